//! Optimizer(s)

use ndarray::{Array2, Zip};
use thiserror::Error;

use crate::nn::Param;

/// Errors for the optimizers
#[derive(Debug, Error)]
pub enum OptimError {
    #[error("Optimizer manages {expected} parameters, got {got}")]
    ParamCountMismatch { expected: usize, got: usize },
    #[error("Parameter {index} has shape {got:?}, optimizer state has {expected:?}")]
    ParamShapeMismatch {
        index: usize,
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
///
/// Parameters are owned by the model, so they are handed in on every call in the
/// same order the optimizer was constructed with.
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self, params: &mut [&mut Param]) -> Result<(), OptimError>;

    /// Zeros gradients for all parameters
    fn zero_grad(&mut self, params: &mut [&mut Param]) {
        for param in params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32;
}

impl<O: Optim + ?Sized> Optim for Box<O> {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<(), OptimError> {
        (**self).step(params)
    }

    fn zero_grad(&mut self, params: &mut [&mut Param]) {
        (**self).zero_grad(params)
    }

    fn lr(&self) -> f32 {
        (**self).lr()
    }
}

fn zeros_like(params: &[&Param]) -> Vec<Array2<f32>> {
    params.iter().map(|p| Array2::zeros(p.data.raw_dim())).collect()
}

fn check_layout(state: &[Array2<f32>], params: &[&mut Param]) -> Result<(), OptimError> {
    if state.len() != params.len() {
        return Err(OptimError::ParamCountMismatch {
            expected: state.len(),
            got: params.len(),
        });
    }
    for (index, (s, p)) in state.iter().zip(params.iter()).enumerate() {
        if s.dim() != p.shape() {
            return Err(OptimError::ParamShapeMismatch {
                index,
                expected: s.dim(),
                got: p.shape(),
            });
        }
    }
    Ok(())
}

/// SGD with momentum
pub struct SGD {
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<Array2<f32>>,
}

impl SGD {
    pub fn new(params: &[&Param], lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: zeros_like(params),
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Array2<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<(), OptimError> {
        check_layout(&self.velocity, params)?;
        let (lr, momentum) = (self.lr, self.momentum);
        for (param, velocity) in params.iter_mut().zip(self.velocity.iter_mut()) {
            let Param { data, grad } = &mut **param;
            Zip::from(data)
                .and(&*grad)
                .and(velocity)
                .for_each(|w, &g, v| {
                    *v = momentum * *v - lr * g;
                    *w += *v;
                });
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

/// Adam with bias-corrected first and second moment estimates
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Vec<Array2<f32>>,
    v: Vec<Array2<f32>>,
}

impl Adam {
    /// Uses the torch defaults `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`
    pub fn new(params: &[&Param], lr: f32) -> Self {
        Self::with_betas(params, lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(params: &[&Param], lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m: zeros_like(params),
            v: zeros_like(params),
        }
    }
}

impl Optim for Adam {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<(), OptimError> {
        check_layout(&self.m, params)?;
        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let bc1 = 1.0 - self.beta1_t;
        let bc2 = 1.0 - self.beta2_t;

        for ((param, m), v) in params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let Param { data, grad } = &mut **param;
            Zip::from(data)
                .and(&*grad)
                .and(m)
                .and(v)
                .for_each(|w, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use crate::assert_eq_float;

    use super::*;

    fn param_with_grad(data: Array2<f32>, grad: Array2<f32>) -> Param {
        let mut p = Param::new(data);
        p.grad = grad;
        p
    }

    #[test]
    fn test_sgd_no_momentum() {
        let mut a = param_with_grad(array![[1.0, 2.0]], array![[1.0, 0.0]]);
        let mut optim = SGD::new(&[&a], 0.1, 0.0);
        optim.step(&mut [&mut a]).unwrap();
        assert_eq_float!(a.data[[0, 0]], 0.9);
        assert_eq!(a.data[[0, 1]], 2.0);
        // gradients are left for the caller to clear
        assert_eq!(a.grad, array![[1.0, 0.0]]);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let mut a = param_with_grad(array![[1.0]], array![[1.0]]);
        let mut optim = SGD::new(&[&a], 0.1, 0.9);
        optim.step(&mut [&mut a]).unwrap();
        assert_eq_float!(a.data[[0, 0]], 0.9);
        assert_eq_float!(optim.velocities()[0][[0, 0]], -0.1);
        optim.step(&mut [&mut a]).unwrap();
        assert_eq_float!(a.data[[0, 0]], 0.71);
        assert_eq_float!(optim.velocities()[0][[0, 0]], -0.19);
    }

    #[test]
    fn test_zero_grad() {
        let mut a = param_with_grad(array![[1.0]], array![[3.0]]);
        let mut optim = SGD::new(&[&a], 0.1, 0.0);
        optim.zero_grad(&mut [&mut a]);
        assert_eq!(a.grad, array![[0.0]]);
    }

    #[test]
    fn test_adam_first_step() {
        // the first bias-corrected step moves each weight by ~lr against the gradient sign
        let mut a = param_with_grad(array![[1.0, 1.0, 1.0]], array![[0.5, -2.0, 0.0]]);
        let mut optim = Adam::new(&[&a], 0.01);
        optim.step(&mut [&mut a]).unwrap();
        assert!((a.data[[0, 0]] - 0.99).abs() < 1e-4);
        assert!((a.data[[0, 1]] - 1.01).abs() < 1e-4);
        assert_eq!(a.data[[0, 2]], 1.0);
    }

    #[test]
    fn test_layout_mismatch() {
        let a = Param::new(Array2::zeros((2, 2)));
        let mut b = Param::new(Array2::zeros((1, 2)));
        let mut optim = SGD::new(&[&a], 0.1, 0.0);
        assert!(matches!(
            optim.step(&mut [&mut b]),
            Err(OptimError::ParamShapeMismatch {
                index: 0,
                expected: (2, 2),
                got: (1, 2)
            })
        ));
        let mut c = Param::new(Array2::zeros((2, 2)));
        assert!(matches!(
            optim.step(&mut []),
            Err(OptimError::ParamCountMismatch {
                expected: 1,
                got: 0
            })
        ));
        optim.step(&mut [&mut c]).unwrap();
    }
}
