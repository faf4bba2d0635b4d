//! Error types for grcam-rs.
//!
//! This module provides error types and result aliases for the library.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use grcam_rs::{GrcamConfig, GrcamError};
//!
//! # fn main() {
//! match GrcamConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(GrcamError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for grcam-rs operations.
pub type Result<T> = std::result::Result<T, GrcamError>;

/// Errors that can occur in grcam-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GrcamError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Input batch or tensor has the wrong shape.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        got: String,
    },

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// The total loss went NaN or infinite.
    #[error("non-finite loss {loss} at global step {step}")]
    NonFiniteLoss {
        /// Global step at which the loss was computed
        step: u64,
        /// Offending loss value
        loss: f32,
    },

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Training state (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl GrcamError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Whether the error came from a diverged training step.
    #[must_use]
    pub fn is_non_finite(&self) -> bool {
        matches!(self, Self::NonFiniteLoss { .. })
    }
}
