//! Layered neural networks with hand-derived backpropagation.
//!
//! A [`NetworkBuilder`] collects layers, [`NetworkBuilder::finalize`] infers
//! shapes and binds a [`Loss`] and an [`Optimizer`], and the resulting
//! [`Network`] trains with mini-batch gradient descent. Every tensor carries
//! the batch on its leading axis.

pub mod activation;
pub mod capsule;
pub mod error;
pub mod evolution;
pub mod gradient_check;
pub mod hyperparameters;
pub mod layers;
pub mod loss;
pub mod network;
pub mod optimizer;

/// Dense `f64` array whose first axis is the batch.
pub type Tensor = ndarray::ArrayD<f64>;

pub use activation::ActivationType;
pub use capsule::Capsule;
pub use error::{Error, Result};
pub use evolution::{EvolutionConfig, Population};
pub use gradient_check::{GradientCheckReport, NumericInstabilityWarning};
pub use hyperparameters::{EpochRecord, Evaluation, FitConfig, History};
pub use layers::{Layer, LayerSpec};
pub use loss::Loss;
pub use network::{Gradients, Network, NetworkBuilder};
pub use optimizer::{Optimizer, OptimizerConfig};
