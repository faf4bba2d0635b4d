//! # grcam-rs
//!
//! Glimpse-based recurrent convolutional attention model (GRCAM) trained with
//! REINFORCE.
//!
//! The model classifies a 2-D signal by looking at it through small windows.
//! At every step it evaluates three candidate windows, folds them into an
//! LSTM state and lets a stochastic location policy pick where to look next.
//! Classification is supervised with cross-entropy; the location policy is
//! trained by REINFORCE against a learned per-step baseline.
//!
//! ## Features
//!
//! - **YAML Configuration** - Define model and optimisation in one file
//! - **Hybrid Loss** - Cross-entropy, policy gradient and baseline regression
//! - **Checkpoints** - Named safetensors snapshots plus training state
//! - **Deterministic Sampling** - All randomness from one seeded stream
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! grcam init config.yaml --preset tiny
//!
//! # Train on the synthetic dataset
//! grcam train config.yaml --samples 256
//!
//! # Evaluate a checkpoint
//! grcam evaluate config.yaml --checkpoint ./outputs/tiny/checkpoint-128
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use grcam_rs::{GrcamConfig, Trainer};
//! use grcam_rs::data::SyntheticDataset;
//!
//! # fn main() -> grcam_rs::Result<()> {
//! let config = GrcamConfig::from_file("config.yaml")?;
//! let dataset = SyntheticDataset::generate(&config.model, 256, config.seed);
//!
//! let mut trainer = Trainer::new(config)?;
//! trainer.train(&dataset)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use grcam_rs::GrcamConfig;
//!
//! # fn main() -> grcam_rs::Result<()> {
//! let mut config = GrcamConfig::from_preset("mnist")?;
//! config.model.nb_glimpses = 4;
//! config.training.learning_rate = 5e-4;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod glimpse;
pub mod heads;
pub mod location;
pub mod mlp;
pub mod model;
pub mod optimizer;
pub mod recurrent;
pub mod retina;
pub mod scheduler;
pub mod trainer;

pub use config::{GrcamConfig, ModelConfig, TrainingConfig};
pub use error::{GrcamError, Result};
pub use model::{ForwardOutput, GrcamModel, LossBreakdown};
pub use trainer::{EvalMetrics, StepMetrics, Trainer};
