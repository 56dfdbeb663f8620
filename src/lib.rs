//! A small harness for training feed-forward classifiers on MNIST-format image
//! datasets using a PyTorch-like API.

pub mod dataloader;
pub mod datasets;
pub mod eval;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod report;
pub mod train;

#[cfg(test)]
#[macro_export]
macro_rules! assert_eq_float {
    ($a:expr, $b:expr) => {
        assert!(
            (($a) - ($b)).abs() < 1e-5,
            "{} is not close to {}",
            $a,
            $b
        );
    };
}
