pub mod activation;
pub mod conv2d;
pub mod dense;
pub mod dropout;
pub mod gru;
pub mod highway;
pub mod input;
pub mod lstm;
pub mod max_pool;
pub mod recurrent;
pub mod reshape;

use std::fmt::Debug;

use ndarray::{Array2, ArrayD, Ix2, Ix3, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Shape of one sample, batch axis excluded.
pub type Shape = Vec<usize>;

/// A differentiable unit of the stack.
///
/// `forward` may only write the layer's own per-pass cache; `backward`
/// consumes that cache and fails with `InvalidState` when there is none.
pub trait Layer: Debug {
    fn name(&self) -> &'static str;

    /// Shape inference, run once when the network is finalized. Initializes
    /// parameters and returns the output shape.
    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape>;

    fn output_shape(&self) -> &[usize];

    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Takes dL/d(output), returns dL/d(input).
    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor>;

    /// Like [`Layer::backward`] but the gradient is already taken with respect
    /// to the pre-activation. Only layers ending in an activation support it.
    fn backward_preactivation(&mut self, _delta: &Tensor) -> Result<Tensor> {
        Err(Error::state(format!("{} has no activation to bypass", self.name())))
    }

    /// Activation applied last by this layer, if any.
    fn activation(&self) -> Option<ActivationType> {
        None
    }

    fn params(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }

    /// Gradients of the last backward pass, in the same order as `params`.
    fn grads(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn set_training(&mut self, _training: bool) {}

    /// Constructor arguments, enough to rebuild an unconnected copy.
    fn spec(&self) -> LayerSpec;

    fn clone_box(&self) -> Box<dyn Layer>;

    fn num_params(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Serializable description of a layer's constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Input {
        shape: Shape,
    },
    Flatten,
    Reshape {
        shape: Shape,
    },
    Dense {
        units: usize,
        activation: ActivationType,
    },
    Activation {
        function: ActivationType,
    },
    Highway {
        activation: ActivationType,
    },
    Dropout {
        rate: f64,
    },
    SimpleRecurrent {
        units: usize,
        activation: ActivationType,
        return_seq: bool,
    },
    Lstm {
        units: usize,
        activation: ActivationType,
        return_seq: bool,
    },
    Gru {
        units: usize,
        activation: ActivationType,
        return_seq: bool,
    },
    Reservoir {
        units: usize,
        activation: ActivationType,
        spectral_radius: f64,
        return_seq: bool,
        seed: Option<u64>,
    },
    Pool {
        size: usize,
    },
    Conv {
        filters: usize,
        filter_x: usize,
        filter_y: usize,
        mode: ConvMode,
    },
}

impl LayerSpec {
    pub fn build(&self) -> Box<dyn Layer> {
        match self.clone() {
            LayerSpec::Input { shape } => Box::new(InputLayer::new(&shape)),
            LayerSpec::Flatten => Box::new(FlattenLayer::new()),
            LayerSpec::Reshape { shape } => Box::new(ReshapeLayer::new(&shape)),
            LayerSpec::Dense { units, activation } => Box::new(DenseLayer::new(units, activation)),
            LayerSpec::Activation { function } => Box::new(ActivationLayer::new(function)),
            LayerSpec::Highway { activation } => Box::new(HighwayLayer::new(activation)),
            LayerSpec::Dropout { rate } => Box::new(DropoutLayer::new(rate)),
            LayerSpec::SimpleRecurrent { units, activation, return_seq } => {
                Box::new(RecurrentLayer::new(units, activation, return_seq))
            }
            LayerSpec::Lstm { units, activation, return_seq } => {
                Box::new(LstmLayer::new(units, activation, return_seq))
            }
            LayerSpec::Gru { units, activation, return_seq } => {
                Box::new(GruLayer::new(units, activation, return_seq))
            }
            LayerSpec::Reservoir { units, activation, spectral_radius, return_seq, seed } => {
                let mut layer = ReservoirLayer::new(units, activation, spectral_radius, return_seq);
                if let Some(seed) = seed {
                    layer = layer.with_seed(seed);
                }
                Box::new(layer)
            }
            LayerSpec::Pool { size } => Box::new(MaxPoolLayer::new(size)),
            LayerSpec::Conv { filters, filter_x, filter_y, mode } => {
                Box::new(Conv2DLayer::new(filters, filter_x, filter_y, mode))
            }
        }
    }
}

/// Checks the non-batch axes of `input` against the layer's input shape.
pub(crate) fn check_input(layer: &str, input: &Tensor, expected: &[usize]) -> Result<()> {
    if input.ndim() == 0 || &input.shape()[1..] != expected {
        return Err(Error::shape(format!(
            "{layer}: expected input of shape (batch, {expected:?}), got {:?}",
            input.shape()
        )));
    }
    Ok(())
}

/// Prepends the batch axis to a sample shape.
pub(crate) fn batched(batch: usize, shape: &[usize]) -> IxDyn {
    let mut dims = Vec::with_capacity(shape.len() + 1);
    dims.push(batch);
    dims.extend_from_slice(shape);
    IxDyn(&dims)
}

pub(crate) fn to_matrix(layer: &str, tensor: &Tensor) -> Result<Array2<f64>> {
    tensor
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::shape(format!("{layer}: expected a 2-D tensor, got {:?}", tensor.shape())))
}

pub(crate) fn to_rank3(layer: &str, tensor: &Tensor) -> Result<ndarray::Array3<f64>> {
    tensor
        .clone()
        .into_dimensionality::<Ix3>()
        .map_err(|_| Error::shape(format!("{layer}: expected a 3-D tensor, got {:?}", tensor.shape())))
}

pub(crate) fn to_rank4(layer: &str, tensor: &Tensor) -> Result<ndarray::Array4<f64>> {
    tensor
        .clone()
        .into_dimensionality::<Ix4>()
        .map_err(|_| Error::shape(format!("{layer}: expected a 4-D tensor, got {:?}", tensor.shape())))
}

/// He-normal initialization, std = sqrt(2 / fan_in).
pub(crate) fn he_normal(shape: &[usize], fan_in: usize, rng: &mut StdRng) -> Result<Tensor> {
    let std_dev = (2.0 / fan_in.max(1) as f64).sqrt();
    let normal_dist = Normal::new(0.0, std_dev).map_err(|e| Error::config(e.to_string()))?;
    Ok(ArrayD::from_shape_fn(IxDyn(shape), |_| normal_dist.sample(&mut *rng)))
}

pub(crate) fn require_units(layer: &str, units: usize) -> Result<()> {
    if units == 0 {
        return Err(Error::config(format!("{layer}: number of units must be positive")));
    }
    Ok(())
}

pub use activation::ActivationLayer;
pub use conv2d::{Conv2DLayer, ConvMode};
pub use dense::DenseLayer;
pub use dropout::DropoutLayer;
pub use gru::GruLayer;
pub use highway::HighwayLayer;
pub use input::InputLayer;
pub use lstm::LstmLayer;
pub use max_pool::MaxPoolLayer;
pub use recurrent::{RecurrentLayer, ReservoirLayer};
pub use reshape::{FlattenLayer, ReshapeLayer};
