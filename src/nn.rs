//! Components to build a feed-forward classifier

use ndarray::{Array1, Array2, Axis, Zip};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Gradient of shape {got:?} does not match the output shape {expected:?}")]
    GradShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("`{layer}` has no recorded forward pass to backpropagate through")]
    NoForwardRecord { layer: &'static str },
    #[error("Bias of length {got} does not match {expected} outputs")]
    BiasSizeMismatch { expected: usize, got: usize },
    #[error("Dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("Invalid weight initialization")]
    Init(#[from] NormalError),
}

/// Whether stochastic layers are active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// A trainable array together with its gradient buffer.
///
/// The backward pass accumulates into `grad`, so it must be zeroed between steps.
#[derive(Debug, Clone)]
pub struct Param {
    pub data: Array2<f32>,
    pub grad: Array2<f32>,
}

impl Param {
    pub fn new(data: Array2<f32>) -> Self {
        let grad = Array2::zeros(data.raw_dim());
        Self { data, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// A single differentiable stage of a [`Sequential`] model
pub trait Layer {
    fn name(&self) -> &'static str;

    /// Computes the output and records what `backward` needs
    fn forward(&mut self, input: &Array2<f32>, mode: Mode) -> Result<Array2<f32>, NNError>;

    /// Computes the output in eval mode without recording anything
    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError>;

    /// Accumulates parameter gradients and returns the gradient w.r.t. the layer input
    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, NNError>;

    fn parameters(&self) -> Vec<&Param> {
        vec![]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![]
    }
}

/// Represents the torch.nn.Module. Classifiers should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Model {
    /// Forward pass which records activations for a later `backward`
    fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>, NNError>;

    /// Forward pass with gradient tracking suspended. Stochastic layers act as in eval mode.
    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError>;

    /// Backpropagates the gradient of a scalar loss w.r.t. the last `forward` output
    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<(), NNError>;

    /// Parameters in a stable order, used by optimizers to index their state
    fn parameters(&self) -> Vec<&Param>;
    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn set_mode(&mut self, mode: Mode);
    fn mode(&self) -> Mode;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }
}

fn check_grad_shape(expected: (usize, usize), grad: &Array2<f32>) -> Result<(), NNError> {
    if grad.dim() != expected {
        return Err(NNError::GradShapeMismatch {
            expected,
            got: grad.dim(),
        });
    }
    Ok(())
}

/// Fully connected layer computing `x W^T + b`
pub struct Linear {
    /// (n_outputs, n_inputs), same layout as torch
    weight: Param,
    /// (1, n_outputs)
    bias: Param,
    input: Option<Array2<f32>>,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new<R: Rng + ?Sized>(
        n_inputs: usize,
        n_outputs: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        // He initialization keeps the activation variance stable through ReLUs,
        // which stops the log-softmax inputs from blowing up on wide layers
        let std = (2.0 / n_inputs as f32).sqrt();
        let normal = Normal::new(0.0, std)?;
        let weight =
            Array2::from_shape_simple_fn((n_outputs, n_inputs), || normal.sample(&mut *rng));
        Ok(Self {
            weight: Param::new(weight),
            bias: Param::new(Array2::zeros((1, n_outputs))),
            input: None,
        })
    }

    /// All weights and biases set to zero
    pub fn zeros(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            weight: Param::new(Array2::zeros((n_outputs, n_inputs))),
            bias: Param::new(Array2::zeros((1, n_outputs))),
            input: None,
        }
    }

    /// Builds a layer from explicit `(n_outputs, n_inputs)` weights and `n_outputs` biases
    pub fn from_arrays(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, NNError> {
        if bias.len() != weight.nrows() {
            return Err(NNError::BiasSizeMismatch {
                expected: weight.nrows(),
                got: bias.len(),
            });
        }
        Ok(Self {
            weight: Param::new(weight),
            bias: Param::new(bias.insert_axis(Axis(0))),
            input: None,
        })
    }

    pub fn n_inputs(&self) -> usize {
        self.weight.data.ncols()
    }

    pub fn n_outputs(&self) -> usize {
        self.weight.data.nrows()
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> &Param {
        &self.bias
    }

    fn affine(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        if input.ncols() != self.n_inputs() {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs(),
                got: input.ncols(),
            });
        }
        let mut output = input.dot(&self.weight.data.t());
        output += &self.bias.data.row(0);
        Ok(output)
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn forward(&mut self, input: &Array2<f32>, _mode: Mode) -> Result<Array2<f32>, NNError> {
        let output = self.affine(input)?;
        self.input = Some(input.clone());
        Ok(output)
    }

    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        self.affine(input)
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        let input = self
            .input
            .take()
            .ok_or(NNError::NoForwardRecord { layer: self.name() })?;
        check_grad_shape((input.nrows(), self.n_outputs()), grad_output)?;

        self.weight.grad += &grad_output.t().dot(&input);
        let mut bias_grad = self.bias.grad.row_mut(0);
        bias_grad += &grad_output.sum_axis(Axis(0));
        Ok(grad_output.dot(&self.weight.data))
    }

    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Element-wise ReLU
#[derive(Default)]
pub struct ReLU {
    input: Option<Array2<f32>>,
    n_dead_neurons: usize,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-positive activations in the last recorded forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons
    }
}

impl Layer for ReLU {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn forward(&mut self, input: &Array2<f32>, _mode: Mode) -> Result<Array2<f32>, NNError> {
        self.n_dead_neurons = input.iter().filter(|v| **v <= 0.0).count();
        log::trace!("n_dead_neurons: {}", self.n_dead_neurons);
        self.input = Some(input.clone());
        Ok(input.mapv(|v| v.max(0.0)))
    }

    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(input.mapv(|v| v.max(0.0)))
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        let input = self
            .input
            .take()
            .ok_or(NNError::NoForwardRecord { layer: self.name() })?;
        check_grad_shape(input.dim(), grad_output)?;
        let mut grad_input = grad_output.clone();
        Zip::from(&mut grad_input).and(&input).for_each(|g, &x| {
            if x <= 0.0 {
                *g = 0.0;
            }
        });
        Ok(grad_input)
    }
}

enum DropoutRecord {
    Identity((usize, usize)),
    Masked(Array2<f32>),
}

/// Zeroes each activation with probability `p` during training and scales the
/// survivors by `1 / (1 - p)`. Identity in eval mode.
pub struct Dropout {
    p: f32,
    rng: Pcg64Mcg,
    record: Option<DropoutRecord>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&p) {
            return Err(NNError::InvalidDropout(p));
        }
        Ok(Self {
            p,
            rng: Pcg64Mcg::seed_from_u64(seed),
            record: None,
        })
    }
}

impl Layer for Dropout {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn forward(&mut self, input: &Array2<f32>, mode: Mode) -> Result<Array2<f32>, NNError> {
        if mode == Mode::Eval || self.p == 0.0 {
            self.record = Some(DropoutRecord::Identity(input.dim()));
            return Ok(input.clone());
        }
        let p = self.p;
        let scale = 1.0 / (1.0 - p);
        let rng = &mut self.rng;
        let mask = Array2::from_shape_simple_fn(input.raw_dim(), || {
            if rng.random::<f32>() < p { 0.0 } else { scale }
        });
        let output = input * &mask;
        self.record = Some(DropoutRecord::Masked(mask));
        Ok(output)
    }

    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(input.clone())
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        match self.record.take() {
            Some(DropoutRecord::Identity(dim)) => {
                check_grad_shape(dim, grad_output)?;
                Ok(grad_output.clone())
            }
            Some(DropoutRecord::Masked(mask)) => {
                check_grad_shape(mask.dim(), grad_output)?;
                Ok(grad_output * &mask)
            }
            None => Err(NNError::NoForwardRecord { layer: self.name() }),
        }
    }
}

/// Row-wise log-softmax, shifted by the row maximum for numerical stability
pub fn log_softmax(input: &Array2<f32>) -> Array2<f32> {
    let mut output = input.clone();
    for mut row in output.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum_exp = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - log_sum_exp);
    }
    output
}

/// Maps class scores to log-probabilities over the last axis
#[derive(Default)]
pub struct LogSoftmax {
    output: Option<Array2<f32>>,
}

impl LogSoftmax {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for LogSoftmax {
    fn name(&self) -> &'static str {
        "LogSoftmax"
    }

    fn forward(&mut self, input: &Array2<f32>, _mode: Mode) -> Result<Array2<f32>, NNError> {
        let output = log_softmax(input);
        self.output = Some(output.clone());
        Ok(output)
    }

    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        Ok(log_softmax(input))
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        let output = self
            .output
            .take()
            .ok_or(NNError::NoForwardRecord { layer: self.name() })?;
        check_grad_shape(output.dim(), grad_output)?;
        // d/dx_j sum_i g_i * (x_i - lse(x)) = g_j - softmax_j * sum_i g_i
        let grad_sum = grad_output.sum_axis(Axis(1)).insert_axis(Axis(1));
        let softmax = output.mapv(f32::exp);
        Ok(grad_output - &(softmax * &grad_sum))
    }
}

/// An ordered stack of layers, the counterpart of torch.nn.Sequential
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
    mode: Mode,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Builds `Linear -> ReLU -> [Dropout] -> ... -> Linear -> LogSoftmax`.
    /// Dropout follows every hidden ReLU when `dropout > 0`. `dropout` must lie in `[0, 1)`.
    pub fn classifier<R: Rng + ?Sized>(
        n_inputs: usize,
        hidden: &[usize],
        n_classes: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&dropout) {
            return Err(NNError::InvalidDropout(dropout));
        }
        let mut model = Self::new();
        let mut fan_in = n_inputs;
        for &width in hidden {
            model = model.push(Linear::new(fan_in, width, rng)?).push(ReLU::new());
            if dropout > 0.0 {
                model = model.push(Dropout::new(dropout, rng.random())?);
            }
            fan_in = width;
        }
        Ok(model
            .push(Linear::new(fan_in, n_classes, rng)?)
            .push(LogSoftmax::new()))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }
}

impl Model for Sequential {
    fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        let mode = self.mode;
        let mut output = input.clone();
        for layer in self.layers.iter_mut() {
            output = layer.forward(&output, mode)?;
        }
        let n_output_nans = output.iter().filter(|v| v.is_nan()).count();
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(output)
    }

    fn infer(&self, input: &Array2<f32>) -> Result<Array2<f32>, NNError> {
        self.layers
            .iter()
            .try_fold(input.clone(), |output, layer| layer.infer(&output))
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<(), NNError> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}
