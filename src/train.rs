//! Training loop

use rand::Rng;
use thiserror::Error;

use crate::{
    dataloader::{Batch, DataLoader},
    eval::{EvalError, EvalStats, evaluate},
    loss::{Criterion, LossError},
    nn::{Mode, Model, NNError},
    optim::{Optim, OptimError},
    report,
};

/// Errors for a training run. None of them are recovered from.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("The data source yielded no batches")]
    NoBatches,
}

/// Running statistics of one pass over the training data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Mean of the per-batch losses
    pub loss: f32,
    pub n_batches: usize,
    pub n_samples: usize,
}

/// Runs one epoch: for every batch clear the gradients, forward, compute the loss,
/// backpropagate, and take an optimizer step.
pub fn train_epoch<M, C, O, I>(
    model: &mut M,
    criterion: &C,
    optim: &mut O,
    batches: I,
) -> Result<EpochStats, TrainError>
where
    M: Model + ?Sized,
    C: Criterion + ?Sized,
    O: Optim + ?Sized,
    I: IntoIterator<Item = Batch>,
{
    if model.mode() != Mode::Train {
        log::debug!("switching model to train mode");
        model.set_mode(Mode::Train);
    }

    let mut running_loss = 0.0;
    let mut n_batches = 0;
    let mut n_samples = 0;
    for batch in batches {
        optim.zero_grad(&mut model.parameters_mut());

        let output = model.forward(&batch.images)?;
        let loss = criterion.compute(&output, &batch.labels)?;
        if loss.value.is_nan() {
            log::warn!("NaN loss at batch {}", n_batches + 1);
        }
        model.backward(&loss.grad)?;
        optim.step(&mut model.parameters_mut())?;

        log::trace!("batch {}: loss {}", n_batches + 1, loss.value);
        running_loss += loss.value;
        n_batches += 1;
        n_samples += batch.len();
    }
    if n_batches == 0 {
        return Err(TrainError::NoBatches);
    }

    Ok(EpochStats {
        loss: running_loss / n_batches as f32,
        n_batches,
        n_samples,
    })
}

/// Knobs for [`Trainer::fit`]
#[derive(Debug, Clone, Copy)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Log a summary every `log_every` epochs (and always after the last one)
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            log_every: 1,
        }
    }
}

/// Per-epoch results
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// 1-based
    pub epoch: usize,
    pub train: EpochStats,
    pub validation: Option<EvalStats>,
}

/// Everything [`Trainer::fit`] observed, so over-fitting shows up as
/// diverging train and validation losses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn train_losses(&self) -> Vec<f32> {
        self.epochs.iter().map(|r| r.train.loss).collect()
    }

    pub fn validation_losses(&self) -> Vec<f32> {
        self.epochs
            .iter()
            .filter_map(|r| r.validation.map(|v| v.loss))
            .collect()
    }

    pub fn accuracies(&self) -> Vec<f32> {
        self.epochs
            .iter()
            .filter_map(|r| r.validation.map(|v| v.accuracy()))
            .collect()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

/// Owns the model, loss criterion and optimizer of a training run
pub struct Trainer<M, C, O> {
    model: M,
    criterion: C,
    optim: O,
}

impl<M: Model, C: Criterion, O: Optim> Trainer<M, C, O> {
    pub fn new(model: M, criterion: C, optim: O) -> Self {
        Self {
            model,
            criterion,
            optim,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Hands back the trained model together with the criterion and optimizer state
    pub fn into_parts(self) -> (M, C, O) {
        (self.model, self.criterion, self.optim)
    }

    /// Trains for `config.epochs` epochs, shuffling with `rng`. When `validation`
    /// is given, every epoch is followed by an evaluation pass over it.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        train: &DataLoader,
        validation: Option<&DataLoader>,
        config: &TrainConfig,
        rng: &mut R,
    ) -> Result<History, TrainError> {
        let mut history = History::default();
        for epoch in 1..=config.epochs {
            let train_stats = train_epoch(
                &mut self.model,
                &self.criterion,
                &mut self.optim,
                train.iter_with_rng(rng),
            )?;
            let validation_stats = match validation {
                Some(loader) => Some(evaluate(&mut self.model, &self.criterion, loader.iter())?),
                None => None,
            };
            let record = EpochRecord {
                epoch,
                train: train_stats,
                validation: validation_stats,
            };
            if epoch % config.log_every.max(1) == 0 || epoch == config.epochs {
                log::info!("{}", report::epoch_summary(&record, config.epochs));
            }
            history.epochs.push(record);
        }
        Ok(history)
    }

    /// One evaluation pass with the owned model and criterion
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<EvalStats, TrainError> {
        Ok(evaluate(&mut self.model, &self.criterion, loader.iter())?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::{
        assert_eq_float,
        loss::NLLLoss,
        nn::{Linear, LogSoftmax, Param, Sequential},
        optim::{Adam, SGD},
    };

    use super::*;

    /// A single linear map whose backward records whether the gradient buffer was
    /// clean when it started accumulating
    struct Probe {
        weight: Param,
        input: Option<Array2<f32>>,
        mode: Mode,
        dirty_backwards: usize,
        backwards: usize,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                weight: Param::new(array![[0.5, -0.5], [0.25, 0.0]]),
                input: None,
                mode: Mode::Eval,
                dirty_backwards: 0,
                backwards: 0,
            }
        }
    }

    impl Model for Probe {
        fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
            self.input = Some(input.clone());
            self.infer(input)
        }

        fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
            Ok(crate::nn::log_softmax(&input.dot(&self.weight.data.t())))
        }

        fn backward(&mut self, grad_output: &Array2<f32>) -> Result<(), NNError> {
            let input = self
                .input
                .take()
                .ok_or(NNError::NoForwardRecord { layer: "Probe" })?;
            if self.weight.grad.iter().any(|&g| g != 0.0) {
                self.dirty_backwards += 1;
            }
            self.backwards += 1;
            // skips the softmax jacobian, any non-zero gradient will do here
            self.weight.grad += &grad_output.t().dot(&input);
            Ok(())
        }

        fn parameters(&self) -> Vec<&Param> {
            vec![&self.weight]
        }

        fn parameters_mut(&mut self) -> Vec<&mut Param> {
            vec![&mut self.weight]
        }

        fn set_mode(&mut self, mode: Mode) {
            self.mode = mode;
        }

        fn mode(&self) -> Mode {
            self.mode
        }
    }

    fn toy_loader(batch_size: usize) -> DataLoader {
        let images = array![
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [2.0, 0.5],
            [0.5, 2.0],
            [0.0, 0.0]
        ];
        DataLoader::new(images, vec![0, 1, 0, 0, 1, 1], batch_size, true).unwrap()
    }

    #[test]
    fn test_gradients_cleared_before_every_backward() {
        let mut model = Probe::new();
        let mut optim = SGD::new(&model.parameters(), 0.1, 0.0);
        let loader = toy_loader(2);
        let stats = train_epoch(&mut model, &NLLLoss, &mut optim, loader.iter()).unwrap();
        assert_eq!(stats.n_batches, 3);
        assert_eq!(stats.n_samples, 6);
        assert_eq!(model.backwards, 3);
        assert_eq!(model.dirty_backwards, 0);
        assert_eq!(model.mode(), Mode::Train);
    }

    #[test]
    fn test_step_moves_by_lr_times_grad() {
        let lr = 0.05;
        let mut model = Probe::new();
        let before = model.weight.data.clone();
        let mut optim = SGD::new(&model.parameters(), lr, 0.0);
        let loader = DataLoader::new(array![[1.0, 2.0]], vec![1], 1, false).unwrap();
        train_epoch(&mut model, &NLLLoss, &mut optim, loader.iter()).unwrap();

        // the gradient of the only step is still in the buffer
        let grad = model.weight.grad.clone();
        assert!(grad.iter().any(|&g| g != 0.0));
        let expected = &before - &(grad * lr);
        for (w, e) in model.weight.data.iter().zip(expected.iter()) {
            assert_eq_float!(*w, *e);
        }
    }

    #[test]
    fn test_uniform_initial_loss() {
        let mut model = Sequential::new()
            .push(Linear::zeros(3, 2))
            .push(LogSoftmax::new());
        let mut optim = SGD::new(&model.parameters(), 0.0, 0.0);
        let images = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f32);
        let loader = DataLoader::new(images, vec![0, 1, 1, 0], 4, false).unwrap();
        let stats = train_epoch(&mut model, &NLLLoss, &mut optim, loader.iter()).unwrap();
        assert_eq!(stats.n_batches, 1);
        assert!((stats.loss - 0.6931).abs() < 1e-4);
    }

    #[test]
    fn test_no_batches() {
        let mut model = Probe::new();
        let mut optim = SGD::new(&model.parameters(), 0.1, 0.0);
        let err = train_epoch(&mut model, &NLLLoss, &mut optim, Vec::new()).unwrap_err();
        assert!(matches!(err, TrainError::NoBatches));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut model = Sequential::new()
            .push(Linear::zeros(3, 2))
            .push(LogSoftmax::new());
        let mut optim = SGD::new(&model.parameters(), 0.1, 0.0);
        let loader = DataLoader::new(Array2::zeros((2, 4)), vec![0, 1], 2, false).unwrap();
        let err = train_epoch(&mut model, &NLLLoss, &mut optim, loader.iter()).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Model(NNError::InputSizeMismatch {
                expected: 3,
                got: 4
            })
        ));
    }

    #[test]
    fn test_fit_learns_separable_data() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        // two well separated blobs
        let n = 64;
        let images = Array2::from_shape_fn((n, 2), |(i, j)| {
            let centre = if i % 2 == 0 { -2.0 } else { 2.0 };
            let jitter = if j == 0 { 0.1 } else { -0.1 };
            centre + jitter * (i % 5) as f32
        });
        let labels = (0..n).map(|i| i % 2).collect::<Vec<_>>();
        let train = DataLoader::new(images.clone(), labels.clone(), 8, true).unwrap();
        let validation = DataLoader::new(images, labels, 16, false).unwrap();

        let model = Sequential::classifier(2, &[8], 2, 0.1, &mut rng).unwrap();
        let optim = Adam::new(&model.parameters(), 0.01);
        let mut trainer = Trainer::new(model, NLLLoss, optim);
        let config = TrainConfig {
            epochs: 20,
            log_every: 5,
        };
        let history = trainer
            .fit(&train, Some(&validation), &config, &mut rng)
            .unwrap();

        assert_eq!(history.epochs.len(), 20);
        assert_eq!(history.validation_losses().len(), 20);
        let losses = history.train_losses();
        assert!(losses[19] < losses[0]);
        let last = history.last().unwrap();
        assert_eq!(last.epoch, 20);
        assert!(last.validation.unwrap().accuracy() > 0.95);
        // validation leaves the model ready for the next training epoch
        assert_eq!(trainer.model().mode(), Mode::Train);

        let (model, _, _) = trainer.into_parts();
        assert_eq!(model.parameters().len(), 4);
    }

    #[test]
    fn test_fit_without_validation() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let model = Sequential::classifier(2, &[4], 2, 0.0, &mut rng).unwrap();
        let optim: Box<dyn Optim> = Box::new(SGD::new(&model.parameters(), 0.01, 0.9));
        let mut trainer = Trainer::new(model, NLLLoss, optim);
        let history = trainer
            .fit(&toy_loader(4), None, &TrainConfig::default(), &mut rng)
            .unwrap();
        assert_eq!(history.epochs.len(), 5);
        assert!(history.accuracies().is_empty());
        assert!(history.epochs.iter().all(|r| r.train.n_batches == 2));
    }
}
