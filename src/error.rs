//! Error types for the training engine

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// Incompatible layer chaining, reshape target or tensor rank
    #[error("Shape error: {0}")]
    Shape(String),

    /// Operation not valid in the current state (e.g. backward without forward)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown registry name or malformed layer/optimizer parameters
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Missing per-pass cache in `backward`
    pub(crate) fn no_forward(layer: &str) -> Self {
        Error::InvalidState(format!("{layer}: backward called without a matching forward"))
    }

    /// Layer used before the network connected it
    pub(crate) fn not_connected(layer: &str) -> Self {
        Error::InvalidState(format!("{layer}: layer is not connected to a network"))
    }
}
