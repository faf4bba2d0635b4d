//! Model assembly: glimpse network, location policy, recurrent core and heads.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{GrcamConfig, ModelConfig};
use crate::error::{GrcamError, Result};
use crate::glimpse::GlimpseNetwork;
use crate::heads::{self, BaselineHead, ClassificationHead};
use crate::location::{self, LocationNetwork, LOC_MAX, LOC_MIN};
use crate::recurrent::{FeedbackStep, RecurrentCore, Trajectory};
use crate::retina::SignalGrid;

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Final-step class logits, `(batch, nb_classes)`.
    pub logits: Tensor,
    /// Softmax of `logits`.
    pub probabilities: Tensor,
    /// Arg-max class ids, `(batch,)` u32.
    pub predictions: Tensor,
    /// Per-step baselines, `(batch, nb_glimpses)`.
    pub baselines: Tensor,
    /// Recorded location decisions.
    pub trajectory: Trajectory,
}

impl ForwardOutput {
    /// Fraction of examples classified correctly.
    pub fn accuracy(&self, labels: &Tensor) -> Result<f32> {
        heads::accuracy(&self.predictions, labels)
    }
}

/// Hybrid loss and its diagnostic components.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Scalar loss tensor to differentiate.
    pub total: Tensor,
    /// Value of `total`.
    pub total_value: f32,
    /// Mean cross-entropy.
    pub cross_entropy: f32,
    /// Mean advantage `reward - baseline`.
    pub advantage: f32,
    /// Mean squared error between reward and baseline.
    pub baselines_mse: f32,
    /// Mean reward, i.e. batch accuracy.
    pub reward: f32,
}

/// Glimpse-based recurrent convolutional attention model.
///
/// Owns its parameters in a [`VarMap`] and the random stream used for seed
/// locations, sampling noise and retina noise.
///
/// # Example
///
/// ```rust,no_run
/// use candle_core::{DType, Device, Tensor};
/// use grcam_rs::{GrcamConfig, GrcamModel};
///
/// # fn main() -> grcam_rs::Result<()> {
/// let config = GrcamConfig::from_preset("tiny")?;
/// let mut model = GrcamModel::new(&config, &Device::Cpu)?;
///
/// let signals = Tensor::zeros((2, 8, 8), DType::F32, &Device::Cpu)?;
/// let labels = Tensor::new(&[0u32, 1], &Device::Cpu)?;
/// let output = model.forward(&signals)?;
/// let loss = model.compute_loss(&output, &labels)?;
/// println!("loss {}", loss.total_value);
/// # Ok(())
/// # }
/// ```
pub struct GrcamModel {
    config: ModelConfig,
    device: Device,
    var_map: VarMap,
    glimpse: GlimpseNetwork,
    location: LocationNetwork,
    core: RecurrentCore,
    baseline: BaselineHead,
    classifier: ClassificationHead,
    rng: ChaCha8Rng,
    last_locations: Vec<Tensor>,
}

impl GrcamModel {
    /// Build a freshly initialised model.
    pub fn new(config: &GrcamConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let m = &config.model;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let glimpse = GlimpseNetwork::new(m, vb.pp("glimpse"), device)?;
        let location = LocationNetwork::new(
            m.cell_size,
            m.policy_dim(),
            m.variance,
            m.is_training,
            m.init_stddev,
            vb.pp("location"),
        )?;
        let core = RecurrentCore::new(glimpse.output_size(), m.cell_size, m.nb_glimpses, vb.pp("core"))?;
        let baseline = BaselineHead::new(m.cell_size, m.init_stddev, vb.pp("baseline"))?;
        let classifier = ClassificationHead::new(m.cell_size, m.nb_classes, m.init_stddev, vb.pp("classifier"))?;

        tracing::debug!(
            glimpse_output = glimpse.output_size(),
            cell_size = m.cell_size,
            nb_glimpses = m.nb_glimpses,
            "built GRCAM model"
        );

        Ok(Self {
            config: m.clone(),
            device: device.clone(),
            var_map,
            glimpse,
            location,
            core,
            baseline,
            classifier,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            last_locations: Vec::new(),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Restart the random stream.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Whether the model samples locations and may compute a loss.
    pub fn is_training(&self) -> bool {
        self.config.is_training
    }

    /// Switch between training (sampling) and inference (mean) behaviour.
    pub fn set_training(&mut self, is_training: bool) {
        self.config.is_training = is_training;
        self.location.set_sampling(is_training);
    }

    /// Run one full glimpse sequence over `signals` `(batch, height, width)`.
    pub fn forward(&mut self, signals: &Tensor) -> Result<ForwardOutput> {
        let (batch, height, width) = self.check_signals(signals)?;
        let grid = SignalGrid::from_tensor(signals)?;
        let loc_dim = self.config.loc_dim;

        let seed_action = self.seed_action(batch)?;
        let seed = self.glimpse.forward_action(&grid, &seed_action, loc_dim, &mut self.rng)?;

        let glimpse = &self.glimpse;
        let location = &self.location;
        let rng = &mut self.rng;
        let unroll = self.core.unroll(&seed, |h| {
            let sample = location.sample(h, &mut *rng)?;
            let input = glimpse.forward_action(&grid, &sample.action, loc_dim, &mut *rng)?;
            Ok(FeedbackStep { input, sample })
        })?;

        let logits = self.classifier.forward(unroll.last_output()?)?;
        let (probabilities, predictions) = heads::predict(&logits)?;
        let baselines = self.baseline.forward(unroll.step_outputs())?;

        self.last_locations = unroll.trajectory.loc_means.clone();

        tracing::debug!(
            batch,
            height,
            width,
            steps = unroll.trajectory.len(),
            sampling = self.location.is_sampling(),
            "forward pass"
        );

        Ok(ForwardOutput {
            logits,
            probabilities,
            predictions,
            baselines,
            trajectory: unroll.trajectory,
        })
    }

    /// Hybrid REINFORCE + classification + baseline loss for a forward pass.
    ///
    /// `labels` is `(batch,)` u32. Only available in training mode.
    pub fn compute_loss(&self, output: &ForwardOutput, labels: &Tensor) -> Result<LossBreakdown> {
        if !self.config.is_training {
            return Err(GrcamError::Training(
                "loss is only defined in training mode".to_string(),
            ));
        }
        let batch = output.logits.dim(0)?;
        if labels.dims() != [batch] {
            return Err(GrcamError::shape_mismatch(
                format!("labels ({batch},)"),
                format!("{:?}", labels.dims()),
            ));
        }
        let labels = labels.to_dtype(DType::U32)?;

        let cross_entropy = candle_nn::loss::cross_entropy(&output.logits, &labels)?;

        // Terminal reward shared by every step.
        let reward = output.predictions.eq(&labels)?.to_dtype(DType::F32)?.unsqueeze(1)?;
        let baselines = &output.baselines;

        let advantage = reward.broadcast_sub(&baselines.detach())?;
        let logll = location::log_likelihood(
            &output.trajectory.policy_means,
            &output.trajectory.locs,
            self.config.variance,
        )?;
        let policy_objective = (logll * &advantage)?.mean_all()?;

        let baselines_mse = reward.broadcast_sub(baselines)?.sqr()?.mean_all()?;

        let total = ((&cross_entropy - &policy_objective)? + &baselines_mse)?;

        Ok(LossBreakdown {
            total_value: total.to_scalar::<f32>()?,
            cross_entropy: cross_entropy.to_scalar::<f32>()?,
            advantage: advantage.mean_all()?.to_scalar::<f32>()?,
            baselines_mse: baselines_mse.to_scalar::<f32>()?,
            reward: reward.mean_all()?.to_scalar::<f32>()?,
            total,
        })
    }

    /// Location means of the most recent forward pass, one `(batch, policy_dim)`
    /// tensor per glimpse step.
    pub fn locations(&self) -> &[Tensor] {
        &self.last_locations
    }

    /// Parameter store.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Every trainable variable.
    pub fn all_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    /// Every trainable tensor keyed by name, sorted.
    pub fn named_parameters(&self) -> Result<BTreeMap<String, Tensor>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| GrcamError::Checkpoint(format!("parameter store poisoned: {e}")))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write all parameters to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Overwrite parameters in place from a safetensors file.
    ///
    /// Every parameter of the model must be present in the file with the
    /// same shape.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        let loaded = candle_core::safetensors::load(path, &self.device)?;
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|e| GrcamError::Checkpoint(format!("parameter store poisoned: {e}")))?;

        for (name, var) in data.iter() {
            let tensor = loaded.get(name).ok_or_else(|| {
                GrcamError::Checkpoint(format!("{} has no tensor named {name}", path.display()))
            })?;
            if tensor.dims() != var.dims() {
                return Err(GrcamError::Checkpoint(format!(
                    "{name}: expected shape {:?}, found {:?}",
                    var.dims(),
                    tensor.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }

        tracing::debug!(path = %path.display(), tensors = data.len(), "loaded weights");
        Ok(())
    }

    fn check_signals(&self, signals: &Tensor) -> Result<(usize, usize, usize)> {
        let expected = format!("(batch, {}, {})", self.config.img_height, self.config.img_width);
        let (batch, height, width) = signals
            .dims3()
            .map_err(|_| GrcamError::shape_mismatch(expected.clone(), format!("{:?}", signals.dims())))?;
        if batch == 0 || height != self.config.img_height || width != self.config.img_width {
            return Err(GrcamError::shape_mismatch(expected, format!("{:?}", signals.dims())));
        }
        Ok((batch, height, width))
    }

    /// Uniform random action for the seed step.
    fn seed_action(&mut self, batch: usize) -> Result<Tensor> {
        let dim = self.config.policy_dim();
        let (lo, hi) = (LOC_MIN as f32, LOC_MAX as f32);
        let values: Vec<f32> = (0..batch * dim).map(|_| self.rng.random_range(lo..hi)).collect();
        Ok(Tensor::from_vec(values, (batch, dim), &self.device)?)
    }
}
