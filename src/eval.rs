//! Validation pass and classification metrics

use std::ops::Deref;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use thiserror::Error;

use crate::{
    dataloader::Batch,
    loss::{Criterion, LossError},
    nn::{Mode, Model, NNError},
};

/// Errors for the evaluation pass
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Model(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Holds a model in [`Mode::Eval`] and restores its previous mode when dropped,
/// including on early returns and unwinding.
///
/// Only shared access to the model is exposed while the guard is alive, so
/// parameters cannot change during the pass.
pub struct EvalGuard<'a, M: Model + ?Sized> {
    model: &'a mut M,
    previous: Mode,
}

impl<'a, M: Model + ?Sized> EvalGuard<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let previous = model.mode();
        model.set_mode(Mode::Eval);
        Self { model, previous }
    }
}

impl<M: Model + ?Sized> Deref for EvalGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: Model + ?Sized> Drop for EvalGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_mode(self.previous);
    }
}

/// Aggregated results of one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalStats {
    /// Mean of the per-batch losses
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
    pub n_batches: usize,
}

impl EvalStats {
    /// Fraction of correct predictions in `[0, 1]`, `0.0` for an empty pass
    pub fn accuracy(&self) -> f32 {
        ratio(self.correct, self.total)
    }
}

fn ratio(correct: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        correct as f32 / total as f32
    }
}

/// Index of the highest score in every row. The first maximal index wins ties.
pub fn argmax(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

/// Number of positions where the prediction equals the label
pub fn count_correct(predictions: &[usize], labels: &[usize]) -> usize {
    predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count()
}

/// Runs the model over `batches` in eval mode with gradient tracking suspended.
///
/// Parameters are left untouched and the model's mode is restored afterwards,
/// whether or not the pass succeeds.
pub fn evaluate<M, C, I>(
    model: &mut M,
    criterion: &C,
    batches: I,
) -> Result<EvalStats, EvalError>
where
    M: Model + ?Sized,
    C: Criterion + ?Sized,
    I: IntoIterator<Item = Batch>,
{
    let model = EvalGuard::new(model);
    let mut stats = EvalStats::default();
    let mut loss_sum = 0.0;
    for batch in batches {
        let output = model.infer(&batch.images)?;
        loss_sum += criterion.loss(&output, &batch.labels)?;
        stats.correct += count_correct(&argmax(&output), &batch.labels);
        stats.total += batch.len();
        stats.n_batches += 1;
    }
    if stats.n_batches > 0 {
        stats.loss = loss_sum / stats.n_batches as f32;
    }
    log::debug!(
        "evaluated {} samples in {} batches, accuracy {:.3}",
        stats.total,
        stats.n_batches,
        stats.accuracy()
    );
    Ok(stats)
}

/// Class probabilities for a single flattened image, for a model emitting log-probabilities
pub fn predict_proba<M: Model + ?Sized>(
    model: &mut M,
    image: ArrayView1<f32>,
) -> Result<Array1<f32>, EvalError> {
    let model = EvalGuard::new(model);
    let input = image.to_owned().insert_axis(Axis(0));
    let log_probs = model.infer(&input)?;
    Ok(log_probs.row(0).mapv(f32::exp))
}
