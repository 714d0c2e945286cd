use serde::{Deserialize, Serialize};

/// Hyperparameters for a `fit` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Number of training epochs
    pub epochs: usize,

    /// Batch size for training; the last partial batch is kept
    pub batch_size: usize,

    /// Permute samples (jointly with their targets) before every epoch
    pub shuffle: bool,

    /// Report argmax accuracy next to the cost
    pub classify: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            epochs: 30,
            batch_size: 20,
            shuffle: true,
            classify: true,
        }
    }
}

impl FitConfig {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        FitConfig {
            epochs,
            batch_size,
            ..Default::default()
        }
    }
}

/// Cost (and optionally accuracy) of one pass over a dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Mean cost per sample
    pub cost: f64,
    pub accuracy: Option<f64>,
}

/// Per-epoch record emitted by `fit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training cost per sample over the epoch
    pub cost: f64,
    /// Training accuracy measured after the epoch, if classifying
    pub accuracy: Option<f64>,
    pub validation: Option<Evaluation>,
}

pub type History = Vec<EpochRecord>;
