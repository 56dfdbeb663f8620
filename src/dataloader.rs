//! Data loader

use ndarray::{Array2, Axis};
use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,
}

/// A group of samples processed together in one forward/backward cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// One flattened image per row
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Data loader, returns batches of images and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    images: Array2<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(
        images: Array2<f32>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if images.nrows() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: images.nrows(),
            });
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        Ok(Self {
            images,
            labels,
            batch_size,
            shuffle,
            drop_last: false,
        })
    }

    /// Skip the final batch of an epoch when it is shorter than `batch_size`
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of samples
    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    /// Number of batches yielded per epoch
    pub fn len(&self) -> usize {
        let n = self.n_samples();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates using the thread-local generator when shuffling
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with_rng(&mut rand::rng())
    }

    /// Iterates using `rng` when shuffling, for reproducible epochs
    pub fn iter_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.n_samples()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of images and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.curr_iter);
        let batch_size = self.loader.batch_size;
        if remaining == 0 || (self.loader.drop_last && remaining < batch_size) {
            return None;
        }
        let end = self.curr_iter + remaining.min(batch_size);
        let batch_indices = &self.indices[self.curr_iter..end];
        self.curr_iter = end;
        Some(Batch {
            images: self.loader.images.select(Axis(0), batch_indices),
            labels: batch_indices.iter().map(|&i| self.loader.labels[i]).collect(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len().saturating_sub(self.curr_iter);
        let batch_size = self.loader.batch_size;
        let n = if self.loader.drop_last {
            remaining / batch_size
        } else {
            remaining.div_ceil(batch_size)
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for DataLoaderIterator<'_> {}
