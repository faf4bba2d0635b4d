//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GrcamError, Result};

/// Number of candidate glimpse locations evaluated per step.
pub const NB_LOCATIONS: usize = 3;

/// Main configuration for a GRCAM run.
///
/// # Example
///
/// ```rust
/// use grcam_rs::GrcamConfig;
///
/// # fn main() -> grcam_rs::Result<()> {
/// let config = GrcamConfig::from_preset("tiny")?;
/// config.validate()?;
/// assert_eq!(config.model.nb_glimpses, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrcamConfig {
    /// Network shape and sampling parameters.
    #[serde(default)]
    pub model: ModelConfig,

    /// Optimisation hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Output directory for checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for glimpse locations, sampling noise and retina noise.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

impl Default for GrcamConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }
}

/// Model construction parameters.
///
/// # Example
///
/// ```rust
/// use grcam_rs::config::ModelConfig;
///
/// let model = ModelConfig {
///     img_width: 8,
///     img_height: 8,
///     nb_glimpses: 2,
///     ..Default::default()
/// };
///
/// assert_eq!(model.select_dim(), 2);
/// assert_eq!(model.policy_dim(), 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Signal width.
    #[serde(default = "default_img_side")]
    pub img_width: usize,

    /// Signal height.
    #[serde(default = "default_img_side")]
    pub img_height: usize,

    /// Parallel candidate locations per step (must be 3).
    #[serde(default = "default_nb_locations")]
    pub nb_locations: usize,

    /// Glimpse window width.
    #[serde(default = "default_glimpse_side")]
    pub glimpse_width: usize,

    /// Glimpse window height.
    #[serde(default = "default_glimpse_side")]
    pub glimpse_height: usize,

    /// Hidden width of the patch ("what") perceptron.
    #[serde(default = "default_hidden")]
    pub g_size: usize,

    /// Hidden width of the location ("where") perceptron.
    #[serde(default = "default_hidden")]
    pub l_size: usize,

    /// Width of each fused glimpse embedding.
    #[serde(default = "default_glimpse_output")]
    pub glimpse_output_size: usize,

    /// Coordinates per candidate location.
    #[serde(default = "default_one")]
    pub loc_dim: usize,

    /// Coordinates of the shared time/context vector.
    #[serde(default = "default_one")]
    pub time_dim: usize,

    /// Standard deviation of the location sampling noise.
    #[serde(default = "default_variance")]
    pub variance: f64,

    /// LSTM cell size.
    #[serde(default = "default_cell_size")]
    pub cell_size: usize,

    /// Number of glimpse steps after the seed step.
    #[serde(default = "default_nb_glimpses")]
    pub nb_glimpses: usize,

    /// Number of output classes.
    #[serde(default = "default_nb_classes")]
    pub nb_classes: usize,

    /// Standard deviation of the normal weight initialiser.
    #[serde(default = "default_init_stddev")]
    pub init_stddev: f64,

    /// Sample noisy locations and allow loss computation.
    #[serde(default = "default_true")]
    pub is_training: bool,
}

fn default_img_side() -> usize {
    28
}
fn default_nb_locations() -> usize {
    NB_LOCATIONS
}
fn default_glimpse_side() -> usize {
    8
}
fn default_hidden() -> usize {
    128
}
fn default_glimpse_output() -> usize {
    128
}
fn default_one() -> usize {
    1
}
fn default_variance() -> f64 {
    0.22
}
fn default_cell_size() -> usize {
    256
}
fn default_nb_glimpses() -> usize {
    6
}
fn default_nb_classes() -> usize {
    10
}
fn default_init_stddev() -> f64 {
    0.01
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            img_width: default_img_side(),
            img_height: default_img_side(),
            nb_locations: NB_LOCATIONS,
            glimpse_width: default_glimpse_side(),
            glimpse_height: default_glimpse_side(),
            g_size: default_hidden(),
            l_size: default_hidden(),
            glimpse_output_size: default_glimpse_output(),
            loc_dim: 1,
            time_dim: 1,
            variance: default_variance(),
            cell_size: default_cell_size(),
            nb_glimpses: default_nb_glimpses(),
            nb_classes: default_nb_classes(),
            init_stddev: default_init_stddev(),
            is_training: true,
        }
    }
}

impl ModelConfig {
    /// Width of one `(location, time)` retina offset.
    #[must_use]
    pub fn select_dim(&self) -> usize {
        self.loc_dim + self.time_dim
    }

    /// Width of the location policy output.
    #[must_use]
    pub fn policy_dim(&self) -> usize {
        self.loc_dim * self.nb_locations + self.time_dim
    }

    /// Flattened retina patch width.
    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.glimpse_width * self.glimpse_height
    }
}

/// Optimisation hyperparameters.
///
/// # Example
///
/// ```rust
/// use grcam_rs::TrainingConfig;
///
/// let training = TrainingConfig {
///     learning_rate: 1e-3,
///     min_learning_rate: 1e-5,
///     nb_training_batch: 500,
///     ..Default::default()
/// };
///
/// assert_eq!(training.nb_training_batch, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Initial learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Multiplicative decay applied every `nb_training_batch` steps.
    #[serde(default = "default_decay_factor")]
    pub learning_rate_decay_factor: f64,

    /// Floor of the decayed learning rate.
    #[serde(default = "default_min_lr")]
    pub min_learning_rate: f64,

    /// Decay interval, in training batches.
    #[serde(default = "default_decay_interval")]
    pub nb_training_batch: u64,

    /// Maximum global gradient norm.
    #[serde(default = "default_grad_norm")]
    pub max_gradient_norm: f64,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Log every N steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Save checkpoint every N steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
}

fn default_lr() -> f64 {
    1e-3
}
fn default_decay_factor() -> f64 {
    0.97
}
fn default_min_lr() -> f64 {
    1e-4
}
fn default_decay_interval() -> u64 {
    1000
}
fn default_grad_norm() -> f64 {
    5.0
}
fn default_batch_size() -> usize {
    32
}
fn default_epochs() -> usize {
    10
}
fn default_log_steps() -> usize {
    10
}
fn default_save_steps() -> usize {
    500
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            learning_rate_decay_factor: default_decay_factor(),
            min_learning_rate: default_min_lr(),
            nb_training_batch: default_decay_interval(),
            max_gradient_norm: default_grad_norm(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            logging_steps: default_log_steps(),
            save_steps: default_save_steps(),
        }
    }
}

impl GrcamConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"tiny"` - 8×8 signals, 2 glimpses, 2 classes (smoke tests)
    /// - `"mnist"` - 28×28 signals, 6 glimpses, 10 classes
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "tiny" => Ok(Self::tiny_preset()),
            "mnist" => Ok(Self::mnist_preset()),
            _ => Err(GrcamError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Minimal 8×8, two-class, two-glimpse configuration.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelConfig {
                img_width: 8,
                img_height: 8,
                glimpse_width: 4,
                glimpse_height: 4,
                g_size: 16,
                l_size: 16,
                glimpse_output_size: 8,
                cell_size: 16,
                nb_glimpses: 2,
                nb_classes: 2,
                init_stddev: 0.1,
                ..Default::default()
            },
            training: TrainingConfig {
                learning_rate: 5e-3,
                min_learning_rate: 1e-4,
                nb_training_batch: 100,
                batch_size: 2,
                epochs: 1,
                logging_steps: 10,
                save_steps: 1000,
                ..Default::default()
            },
            output_dir: "./outputs/tiny".into(),
            seed: 42,
        }
    }

    /// 28×28 digit-sized configuration.
    #[must_use]
    pub fn mnist_preset() -> Self {
        Self {
            output_dir: "./outputs/mnist".into(),
            ..Default::default()
        }
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use grcam_rs::GrcamConfig;
    ///
    /// let mut config = GrcamConfig::tiny_preset();
    /// assert!(config.validate().is_ok());
    ///
    /// config.model.nb_locations = 2;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let t = &self.training;

        let sizes = [
            ("model.img_width", m.img_width),
            ("model.img_height", m.img_height),
            ("model.glimpse_width", m.glimpse_width),
            ("model.glimpse_height", m.glimpse_height),
            ("model.g_size", m.g_size),
            ("model.l_size", m.l_size),
            ("model.glimpse_output_size", m.glimpse_output_size),
            ("model.loc_dim", m.loc_dim),
            ("model.time_dim", m.time_dim),
            ("model.cell_size", m.cell_size),
            ("model.nb_glimpses", m.nb_glimpses),
            ("model.nb_classes", m.nb_classes),
            ("training.batch_size", t.batch_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(GrcamError::Config(format!("{name} must be > 0")));
        }

        if m.nb_locations != NB_LOCATIONS {
            return Err(GrcamError::Config(format!(
                "model.nb_locations must be {NB_LOCATIONS}, got {}",
                m.nb_locations
            )));
        }

        if m.select_dim() != 2 {
            return Err(GrcamError::Config(format!(
                "model.loc_dim + model.time_dim must be 2 (a (y, x) offset), got {}",
                m.select_dim()
            )));
        }

        if m.glimpse_width > m.img_width || m.glimpse_height > m.img_height {
            return Err(GrcamError::Config(format!(
                "glimpse window {}x{} exceeds signal {}x{}",
                m.glimpse_height, m.glimpse_width, m.img_height, m.img_width
            )));
        }

        if !m.variance.is_finite() || m.variance < 0.0 {
            return Err(GrcamError::Config("model.variance must be finite and >= 0".into()));
        }

        if !m.init_stddev.is_finite() || m.init_stddev <= 0.0 {
            return Err(GrcamError::Config("model.init_stddev must be > 0".into()));
        }

        if !(t.learning_rate > 0.0) {
            return Err(GrcamError::Config("training.learning_rate must be > 0".into()));
        }

        if t.min_learning_rate < 0.0 || t.min_learning_rate > t.learning_rate {
            return Err(GrcamError::Config(
                "training.min_learning_rate must be in [0, learning_rate]".into(),
            ));
        }

        if !(t.learning_rate_decay_factor > 0.0 && t.learning_rate_decay_factor <= 1.0) {
            return Err(GrcamError::Config(
                "training.learning_rate_decay_factor must be in (0, 1]".into(),
            ));
        }

        if t.nb_training_batch == 0 {
            return Err(GrcamError::Config("training.nb_training_batch must be > 0".into()));
        }

        if !(t.max_gradient_norm > 0.0) {
            return Err(GrcamError::Config("training.max_gradient_norm must be > 0".into()));
        }

        Ok(())
    }
}
