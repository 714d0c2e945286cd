//! Self-contained snapshot of a finalized network.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::layers::{LayerSpec, Shape};
use crate::loss::Loss;
use crate::network::{Network, NetworkBuilder};
use crate::optimizer::{Optimizer, OptimizerConfig};

/// Architecture, loss, optimizer settings and flattened parameters.
///
/// Optimizer accumulators are not part of a capsule; a restored network
/// starts them from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub input_shape: Shape,
    /// Every layer after the input layer, in order.
    pub layers: Vec<LayerSpec>,
    pub loss: Loss,
    pub optimizer: OptimizerConfig,
    pub weights: Vec<f64>,
}

impl Capsule {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!(path = %path.display(), weights = self.weights.len(), "capsule saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Network {
    pub fn encapsulate(&self) -> Capsule {
        Capsule {
            input_shape: self.input_shape.clone(),
            layers: self.layers.iter().skip(1).map(|layer| layer.spec()).collect(),
            loss: self.loss,
            optimizer: *self.optimizer.config(),
            weights: self.get_weights_unfolded().to_vec(),
        }
    }

    /// Rebuilds and finalizes the architecture, then loads the stored weights.
    pub fn from_capsule(capsule: Capsule) -> Result<Network> {
        if let Some(LayerSpec::Input { .. }) = capsule.layers.first() {
            return Err(Error::config("capsule layers must not repeat the input layer"));
        }
        let builder = capsule
            .layers
            .iter()
            .fold(NetworkBuilder::new(&capsule.input_shape), |builder, spec| {
                builder.add_boxed(spec.build())
            });
        let mut network = builder.finalize(capsule.loss, Optimizer::new(capsule.optimizer)?)?;
        network.set_weights_folded(&capsule.weights)?;
        Ok(network)
    }
}
