//! Loss function(s)

use ndarray::Array2;
use thiserror::Error;

use crate::nn::log_softmax;

/// Errors for the loss criteria
#[derive(Debug, Error)]
pub enum LossError {
    #[error("Got {predictions} predictions for {labels} labels")]
    BatchSizeMismatch { predictions: usize, labels: usize },
    #[error("Label {label} is out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("Cannot compute a loss over an empty batch")]
    EmptyBatch,
}

/// Scalar loss together with its gradient w.r.t. the predictions, ready to be fed
/// to [`crate::nn::Model::backward`]
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub grad: Array2<f32>,
}

/// Maps a batch of predictions and their class labels to a scalar, mean-reduced over the batch
pub trait Criterion {
    /// Only the scalar, no gradient is computed
    fn loss(&self, predictions: &Array2<f32>, labels: &[usize]) -> Result<f32, LossError>;

    /// The scalar and the gradient which `backward` consumes
    fn compute(
        &self,
        predictions: &Array2<f32>,
        labels: &[usize],
    ) -> Result<LossOutput, LossError>;
}

impl<C: Criterion + ?Sized> Criterion for Box<C> {
    fn loss(&self, predictions: &Array2<f32>, labels: &[usize]) -> Result<f32, LossError> {
        (**self).loss(predictions, labels)
    }

    fn compute(
        &self,
        predictions: &Array2<f32>,
        labels: &[usize],
    ) -> Result<LossOutput, LossError> {
        (**self).compute(predictions, labels)
    }
}

fn check_batch(predictions: &Array2<f32>, labels: &[usize]) -> Result<(), LossError> {
    if predictions.nrows() != labels.len() {
        return Err(LossError::BatchSizeMismatch {
            predictions: predictions.nrows(),
            labels: labels.len(),
        });
    }
    if labels.is_empty() {
        return Err(LossError::EmptyBatch);
    }
    let n_classes = predictions.ncols();
    if let Some(&label) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(LossError::LabelOutOfRange { label, n_classes });
    }
    Ok(())
}

/// Mean of `-log_probs[i, labels[i]]`
fn mean_nll(log_probs: &Array2<f32>, labels: &[usize]) -> f32 {
    let total = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| -log_probs[[i, label]])
        .sum::<f32>();
    total / labels.len() as f32
}

/// Negative log likelihood over log-probabilities, the counterpart of torch.nn.NLLLoss
#[derive(Debug, Default, Clone, Copy)]
pub struct NLLLoss;

impl Criterion for NLLLoss {
    fn loss(&self, predictions: &Array2<f32>, labels: &[usize]) -> Result<f32, LossError> {
        check_batch(predictions, labels)?;
        Ok(mean_nll(predictions, labels))
    }

    fn compute(
        &self,
        predictions: &Array2<f32>,
        labels: &[usize],
    ) -> Result<LossOutput, LossError> {
        let value = self.loss(predictions, labels)?;
        let scale = 1.0 / labels.len() as f32;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &label) in labels.iter().enumerate() {
            grad[[i, label]] = -scale;
        }
        Ok(LossOutput { value, grad })
    }
}

/// Log-softmax followed by NLL, taking raw logits. The counterpart of torch.nn.CrossEntropyLoss
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropyLoss;

impl Criterion for CrossEntropyLoss {
    fn loss(&self, predictions: &Array2<f32>, labels: &[usize]) -> Result<f32, LossError> {
        check_batch(predictions, labels)?;
        Ok(mean_nll(&log_softmax(predictions), labels))
    }

    fn compute(
        &self,
        predictions: &Array2<f32>,
        labels: &[usize],
    ) -> Result<LossOutput, LossError> {
        check_batch(predictions, labels)?;
        let log_probs = log_softmax(predictions);
        let value = mean_nll(&log_probs, labels);

        // (softmax - one_hot) / N
        let scale = 1.0 / labels.len() as f32;
        let mut grad = log_probs.mapv(|lp| lp.exp() * scale);
        for (i, &label) in labels.iter().enumerate() {
            grad[[i, label]] -= scale;
        }
        Ok(LossOutput { value, grad })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_nll_loss() {
        let log_probs = array![[0.5f32.ln(), 0.5f32.ln()], [0.25f32.ln(), 0.75f32.ln()]];
        let labels = [0, 1];
        let out = NLLLoss.compute(&log_probs, &labels).unwrap();
        assert_eq_float!(out.value, -(0.5f32.ln() + 0.75f32.ln()) / 2.0);
        assert_eq!(out.grad, array![[-0.5, 0.0], [0.0, -0.5]]);
        assert_eq_float!(NLLLoss.loss(&log_probs, &labels).unwrap(), out.value);
    }

    #[test]
    fn test_cross_entropy_matches_nll_of_log_softmax() {
        let logits = array![[1.0, 2.0, 0.5], [-1.0, 0.0, 3.0]];
        let labels = [1, 2];
        let ce = CrossEntropyLoss.compute(&logits, &labels).unwrap();
        let nll = NLLLoss.loss(&log_softmax(&logits), &labels).unwrap();
        assert_eq_float!(ce.value, nll);

        // (softmax - one_hot) / batch size
        let expected: Array2<f32> = array![
            [0.115612, -0.185734, 0.070122],
            [0.008574, 0.023306, -0.031880]
        ];
        for (&got, &want) in ce.grad.iter().zip(expected.iter()) {
            assert_eq_float!(got, want);
        }
        for row in ce.grad.rows() {
            assert_eq_float!(row.sum(), 0.0);
        }
    }

    #[test]
    fn test_uniform_two_class_loss() {
        let logits = Array2::zeros((4, 2));
        let value = CrossEntropyLoss.loss(&logits, &[0, 1, 1, 0]).unwrap();
        assert_eq_float!(value, 2.0f32.ln());
    }

    #[test]
    fn test_loss_errors() {
        let preds = Array2::zeros((2, 3));
        assert!(matches!(
            NLLLoss.loss(&preds, &[0]),
            Err(LossError::BatchSizeMismatch {
                predictions: 2,
                labels: 1
            })
        ));
        assert!(matches!(
            CrossEntropyLoss.compute(&preds, &[0, 3]),
            Err(LossError::LabelOutOfRange {
                label: 3,
                n_classes: 3
            })
        ));
        assert!(matches!(
            NLLLoss.loss(&Array2::zeros((0, 3)), &[]),
            Err(LossError::EmptyBatch)
        ));
    }
}
