//! MNIST-format image classification datasets
//!
//! IDX decoding is delegated to the `mnist` crate. The files are expected
//! uncompressed under `<data_dir>/<dataset>/`, with their standard names.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use mnist::{Mnist, MnistBuilder};
use ndarray::{Array2, ShapeError};
use thiserror::Error;

use crate::dataloader::{DataLoader, DataLoaderError};

/// Side length of the square images
pub const IMAGE_SIDE: usize = 28;
/// Flattened image size
pub const N_FEATURES: usize = IMAGE_SIDE * IMAGE_SIDE;

const TRAIN_LEN: usize = 60_000;
const TEST_LEN: usize = 10_000;

const IDX_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

const DIGIT_CLASSES: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];
const FASHION_CLASSES: [&str; 10] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle boot",
];

/// Errors for loading datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Missing dataset file '{}'", .0.display())]
    MissingFile(PathBuf),
    #[error("Got {images} images for {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },
    #[error("Normalization std must be positive, got {0}")]
    InvalidStd(f32),
    #[error("Pixel buffer does not form whole images")]
    Shape(#[from] ShapeError),
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Mnist,
    FashionMnist,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Mnist => write!(f, "mnist"),
            Dataset::FashionMnist => write!(f, "fashion-mnist"),
        }
    }
}

impl Dataset {
    /// Human readable name of every class, indexed by label
    pub fn class_names(&self) -> &'static [&'static str] {
        match self {
            Dataset::Mnist => &DIGIT_CLASSES,
            Dataset::FashionMnist => &FASHION_CLASSES,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.class_names().len()
    }
}

/// Per-channel normalization applied after scaling pixels to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalize {
    mean: f32,
    std: f32,
}

impl Normalize {
    pub fn new(mean: f32, std: f32) -> Result<Self, DatasetError> {
        if std.is_nan() || std <= 0.0 {
            return Err(DatasetError::InvalidStd(std));
        }
        Ok(Self { mean, std })
    }

    pub fn apply(&self, pixel: u8) -> f32 {
        (pixel as f32 / 255.0 - self.mean) / self.std
    }
}

impl Default for Normalize {
    /// Maps pixels to `[-1, 1]`
    fn default() -> Self {
        Self {
            mean: 0.5,
            std: 0.5,
        }
    }
}

/// Flattened, normalized images with their class labels
#[derive(Debug, Clone)]
pub struct LabeledImages {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

impl LabeledImages {
    /// Converts raw row-major `u8` pixels, `n_features` per image
    pub fn from_raw(
        pixels: &[u8],
        labels: &[u8],
        n_features: usize,
        normalize: Normalize,
    ) -> Result<Self, DatasetError> {
        let n_images = if n_features == 0 {
            0
        } else {
            pixels.len() / n_features
        };
        let images = Array2::from_shape_vec(
            (n_images, n_features),
            pixels.iter().map(|&p| normalize.apply(p)).collect(),
        )?;
        if n_images != labels.len() {
            return Err(DatasetError::LabelCountMismatch {
                images: n_images,
                labels: labels.len(),
            });
        }
        Ok(Self {
            images,
            labels: labels.iter().map(|&l| l as usize).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.images.ncols()
    }

    pub fn into_loader(
        self,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<DataLoader, DataLoaderError> {
        DataLoader::new(self.images, self.labels, batch_size, shuffle)
    }
}

/// The standard train/test split of a dataset
#[derive(Debug, Clone)]
pub struct Splits {
    pub train: LabeledImages,
    pub test: LabeledImages,
}

/// Directory holding the IDX files of `dataset`
pub fn dataset_dir(data_dir: &Path, dataset: Dataset) -> PathBuf {
    data_dir.join(dataset.to_string())
}

/// Loads both splits of a dataset from `<data_dir>/<dataset>/`
pub fn load_dataset(
    dataset: Dataset,
    data_dir: &Path,
    normalize: Normalize,
) -> Result<Splits, DatasetError> {
    let dir = dataset_dir(data_dir, dataset);
    // `MnistBuilder::finalize` panics on unreadable files, so surface those as errors first
    for file in IDX_FILES {
        let path = dir.join(file);
        if !path.is_file() {
            return Err(DatasetError::MissingFile(path));
        }
    }

    // the builder concatenates the base path and file names
    let base_path = format!("{}/", dir.display());
    let Mnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = MnistBuilder::new()
        .base_path(&base_path)
        .label_format_digit()
        .training_set_length(TRAIN_LEN as u32)
        .validation_set_length(0)
        .test_set_length(TEST_LEN as u32)
        .finalize();

    let train = LabeledImages::from_raw(&trn_img, &trn_lbl, N_FEATURES, normalize)?;
    let test = LabeledImages::from_raw(&tst_img, &tst_lbl, N_FEATURES, normalize)?;
    log::info!(
        "Loaded {}: {} train and {} test images from '{}'",
        dataset,
        train.len(),
        test.len(),
        dir.display()
    );
    Ok(Splits { train, test })
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_normalize() {
        let normalize = Normalize::default();
        assert_eq_float!(normalize.apply(0), -1.0);
        assert_eq_float!(normalize.apply(255), 1.0);
        assert!(matches!(
            Normalize::new(0.0, 0.0),
            Err(DatasetError::InvalidStd(_))
        ));
    }

    #[test]
    fn test_from_raw() {
        let pixels = [0, 255, 51, 102, 0, 0];
        let labels = [3, 7];
        let data =
            LabeledImages::from_raw(&pixels, &labels, 3, Normalize::new(0.0, 1.0).unwrap())
                .unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.n_features(), 3);
        assert_eq!(data.labels, vec![3, 7]);
        assert_eq_float!(data.images[[0, 1]], 1.0);
        assert_eq_float!(data.images[[1, 0]], 0.4);
    }

    #[test]
    fn test_from_raw_errors() {
        let normalize = Normalize::default();
        assert!(matches!(
            LabeledImages::from_raw(&[0, 0, 0, 0], &[1], 2, normalize),
            Err(DatasetError::LabelCountMismatch {
                images: 2,
                labels: 1
            })
        ));
        assert!(matches!(
            LabeledImages::from_raw(&[0, 0, 0], &[1], 2, normalize),
            Err(DatasetError::Shape(_))
        ));
    }

    #[test]
    fn test_missing_files() {
        let dir = std::env::temp_dir().join("mnist-train-no-such-dir");
        let err = load_dataset(Dataset::FashionMnist, &dir, Normalize::default()).unwrap_err();
        match err {
            DatasetError::MissingFile(path) => {
                assert!(path.ends_with("fashion-mnist/train-images-idx3-ubyte"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_class_names() {
        assert_eq!(Dataset::FashionMnist.n_classes(), 10);
        assert_eq!(Dataset::FashionMnist.class_names()[9], "Ankle boot");
        assert_eq!(Dataset::Mnist.to_string(), "mnist");
    }
}
