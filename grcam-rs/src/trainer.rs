//! Training loop, evaluation and checkpoints.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::GrcamConfig;
use crate::data::{GlimpseBatch, SyntheticDataset};
use crate::error::{GrcamError, Result};
use crate::model::GrcamModel;
use crate::optimizer::{clip_grad_norm, AdamWOptimizer, OptimizerConfig};
use crate::scheduler::StaircaseDecay;

const MODEL_FILE: &str = "model.safetensors";
const STATE_FILE: &str = "training_state.json";
const CONFIG_FILE: &str = "config.yaml";

/// Metrics of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Global step after this update
    pub step: u64,
    /// Total hybrid loss
    pub loss: f64,
    /// Classification cross-entropy
    pub cross_entropy: f64,
    /// Mean advantage
    pub advantage: f64,
    /// Baseline regression error
    pub baselines_mse: f64,
    /// Mean reward
    pub reward: f64,
    /// Batch accuracy
    pub accuracy: f64,
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    /// Learning rate used for the update
    pub learning_rate: f64,
}

/// Result of an inference pass.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Predicted class ids, `(batch,)` u32.
    pub predictions: Tensor,
}

/// Training orchestrator.
///
/// Owns the model, the optimizer, the learning rate schedule and the global
/// step counter. The counter advances exactly once per successful
/// [`Trainer::train_step`].
///
/// # Example
///
/// ```no_run
/// use grcam_rs::{GrcamConfig, Trainer};
/// use grcam_rs::data::SyntheticDataset;
///
/// # fn main() -> grcam_rs::Result<()> {
/// let config = GrcamConfig::from_preset("tiny")?;
/// let dataset = SyntheticDataset::generate(&config.model, 64, config.seed);
///
/// let mut trainer = Trainer::new(config)?;
/// trainer.train(&dataset)?;
/// println!("trained for {} steps", trainer.global_step());
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: GrcamConfig,
    device: Device,
    model: GrcamModel,
    optimizer: AdamWOptimizer,
    schedule: StaircaseDecay,
    global_step: u64,
    epoch: usize,
    training_metrics: Vec<StepMetrics>,
}

impl Trainer {
    /// Create a trainer on the default device.
    ///
    /// CUDA is used when the `cuda` feature is enabled and a device is
    /// available, unless `GRCAM_FORCE_CPU=1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: GrcamConfig) -> Result<Self> {
        let device = select_device();
        Self::with_device(config, device)
    }

    /// Create a trainer on an explicit device.
    pub fn with_device(config: GrcamConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let model = GrcamModel::new(&config, &device)?;
        let optimizer = OptimizerConfig::from_training(&config.training).build_adamw(model.var_map())?;
        let schedule = StaircaseDecay::from_config(&config.training);

        tracing::info!(
            "Initialized GRCAM trainer: {} parameters, lr={}, device={:?}",
            model.num_parameters(),
            optimizer.learning_rate(),
            device
        );

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            schedule,
            global_step: 0,
            epoch: 0,
            training_metrics: Vec::new(),
        })
    }

    /// Resume training from a checkpoint directory.
    ///
    /// # Errors
    /// Returns an error if the checkpoint cannot be loaded.
    pub fn resume_from<P: AsRef<Path>>(&mut self, checkpoint_dir: P) -> Result<()> {
        self.load_checkpoint(checkpoint_dir)
    }

    /// Run one optimizer step on `batch`.
    ///
    /// Forward, loss, backward, global-norm clipping, learning rate for the
    /// current global step, optimizer update, then the global step advances.
    ///
    /// # Errors
    ///
    /// A non-finite loss returns [`GrcamError::NonFiniteLoss`] before any
    /// parameter is touched; the global step is left unchanged.
    ///
    /// The returned metrics are also recorded on the trainer. The record is
    /// cleared by [`Trainer::train`]; callers driving steps directly should
    /// drain it with [`Trainer::take_metrics`].
    pub fn train_step(&mut self, batch: &GlimpseBatch) -> Result<StepMetrics> {
        batch.check_classes(self.config.model.nb_classes)?;

        let output = self.model.forward(&batch.signals)?;
        let loss = self.model.compute_loss(&output, &batch.labels)?;
        if !loss.total_value.is_finite() {
            return Err(GrcamError::NonFiniteLoss {
                step: self.global_step,
                loss: loss.total_value,
            });
        }

        let mut grads = loss.total.backward()?;
        let vars = self.model.all_vars();
        let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.training.max_gradient_norm)?;
        if !grad_norm.is_finite() {
            return Err(GrcamError::Training(format!(
                "non-finite gradient norm at global step {}",
                self.global_step
            )));
        }

        let learning_rate = self.schedule.apply(self.global_step, &mut self.optimizer);
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let metrics = StepMetrics {
            step: self.global_step,
            loss: f64::from(loss.total_value),
            cross_entropy: f64::from(loss.cross_entropy),
            advantage: f64::from(loss.advantage),
            baselines_mse: f64::from(loss.baselines_mse),
            reward: f64::from(loss.reward),
            accuracy: f64::from(output.accuracy(&batch.labels)?),
            grad_norm,
            learning_rate,
        };
        self.training_metrics.push(metrics.clone());
        Ok(metrics)
    }

    /// Classify `batch` with sampling disabled.
    ///
    /// The training flag is restored afterwards, whether or not the pass
    /// succeeds. The random stream still advances for the seed locations.
    pub fn evaluate(&mut self, batch: &GlimpseBatch) -> Result<EvalMetrics> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let output = self.model.forward(&batch.signals);
        self.model.set_training(was_training);

        let output = output?;
        Ok(EvalMetrics {
            accuracy: f64::from(output.accuracy(&batch.labels)?),
            predictions: output.predictions,
        })
    }

    /// Train over `dataset` for the configured number of epochs.
    ///
    /// Logs every `logging_steps`, checkpoints every `save_steps` and once
    /// more at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if a step fails or a checkpoint cannot be written.
    pub fn train(&mut self, dataset: &SyntheticDataset) -> Result<()> {
        let training = self.config.training.clone();
        tracing::info!("Starting training");
        tracing::info!("  Examples: {}", dataset.len());
        tracing::info!("  Epochs: {}", training.epochs);
        tracing::info!("  Batch size: {}", training.batch_size);

        let batches = dataset.batches(training.batch_size, &self.device)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let total_steps = (batches.len() * training.epochs) as u64;
        let pb = ProgressBar::new(total_steps);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
                .map_err(|e| GrcamError::Training(format!("Invalid progress template: {e}")))?
                .progress_chars("#>-"),
        );

        self.training_metrics.clear();

        for epoch in 0..training.epochs {
            self.epoch = epoch;
            tracing::info!("Starting epoch {}/{}", epoch + 1, training.epochs);

            for batch in &batches {
                let metrics = self.train_step(batch)?;

                pb.set_message(format!("{:.4}", metrics.loss));
                pb.inc(1);

                if training.logging_steps > 0 && metrics.step % training.logging_steps as u64 == 0 {
                    tracing::info!(
                        "Step {}, Epoch {}, Loss: {:.4}, CE: {:.4}, Reward: {:.3}, BaselineMSE: {:.4}, GradNorm: {:.4}, LR: {:.2e}",
                        metrics.step,
                        epoch + 1,
                        metrics.loss,
                        metrics.cross_entropy,
                        metrics.reward,
                        metrics.baselines_mse,
                        metrics.grad_norm,
                        metrics.learning_rate
                    );
                }

                if training.save_steps > 0 && metrics.step % training.save_steps as u64 == 0 {
                    self.save_checkpoint()?;
                }
            }
        }

        pb.finish_with_message("Training complete");
        self.save_checkpoint()?;
        Ok(())
    }

    /// Write `checkpoint-{global_step}` under the output directory.
    ///
    /// Holds the weights, the training state and the configuration. Earlier
    /// checkpoints are kept.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let checkpoint_dir =
            Path::new(&self.config.output_dir).join(format!("checkpoint-{}", self.global_step));
        std::fs::create_dir_all(&checkpoint_dir)?;

        self.model.save(&checkpoint_dir.join(MODEL_FILE))?;

        let training_state = TrainingState {
            global_step: self.global_step,
            epoch: self.epoch,
            learning_rate: self.optimizer.learning_rate(),
        };
        let state_json = serde_json::to_string_pretty(&training_state)?;
        std::fs::write(checkpoint_dir.join(STATE_FILE), state_json)?;

        self.config.to_file(checkpoint_dir.join(CONFIG_FILE))?;

        tracing::info!("Saved checkpoint to: {}", checkpoint_dir.display());
        Ok(checkpoint_dir)
    }

    /// Restore weights and training state from a checkpoint directory.
    ///
    /// The directory must hold both the weights and the training state;
    /// nothing is changed if either is missing.
    ///
    /// Adam moment estimates are not part of a checkpoint and restart from zero.
    ///
    /// # Errors
    /// Returns error if checkpoint files cannot be read or parsed.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, checkpoint_dir: P) -> Result<()> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let weights = checkpoint_dir.join(MODEL_FILE);
        if !weights.exists() {
            return Err(GrcamError::Checkpoint(format!(
                "{} has no {MODEL_FILE}",
                checkpoint_dir.display()
            )));
        }

        let state_path = checkpoint_dir.join(STATE_FILE);
        let state_json = std::fs::read_to_string(&state_path).map_err(|e| {
            GrcamError::Checkpoint(format!("Failed to read {}: {e}", state_path.display()))
        })?;
        let state: TrainingState = serde_json::from_str(&state_json)
            .map_err(|e| GrcamError::Checkpoint(format!("Failed to parse state: {e}")))?;

        self.model.load_weights(&weights)?;

        self.global_step = state.global_step;
        self.epoch = state.epoch;
        self.optimizer.set_learning_rate(state.learning_rate);

        tracing::info!(
            "Loaded checkpoint from: {} (global_step={}, epoch={})",
            checkpoint_dir.display(),
            state.global_step,
            state.epoch
        );
        Ok(())
    }

    /// The model being trained.
    pub fn model(&self) -> &GrcamModel {
        &self.model
    }

    /// Mutable access to the model.
    pub fn model_mut(&mut self) -> &mut GrcamModel {
        &mut self.model
    }

    /// Configuration in use.
    pub fn config(&self) -> &GrcamConfig {
        &self.config
    }

    /// Device the model lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Metrics of every step since the last call to [`Trainer::train`].
    pub fn metrics(&self) -> &[StepMetrics] {
        &self.training_metrics
    }

    /// Remove and return the recorded step metrics.
    pub fn take_metrics(&mut self) -> Vec<StepMetrics> {
        std::mem::take(&mut self.training_metrics)
    }

    /// Loss of every recorded step.
    pub fn losses(&self) -> Vec<f64> {
        self.training_metrics.iter().map(|m| m.loss).collect()
    }

    /// Gradient norm of every recorded step.
    pub fn grad_norms(&self) -> Vec<f64> {
        self.training_metrics.iter().map(|m| m.grad_norm).collect()
    }

    /// Number of optimizer steps taken.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Current epoch, zero-based.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Learning rate the optimizer currently holds.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

/// Training state for checkpoint serialization.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TrainingState {
    /// Optimizer steps taken
    global_step: u64,
    /// Current epoch
    epoch: usize,
    /// Current learning rate
    learning_rate: f64,
}

fn select_device() -> Device {
    let force_cpu = std::env::var("GRCAM_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if force_cpu || !cfg!(feature = "cuda") {
        return Device::Cpu;
    }

    let ordinal = std::env::var("GRCAM_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", ordinal);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;

    fn tiny_trainer(dir: &TempDir) -> Trainer {
        let mut config = GrcamConfig::tiny_preset();
        config.output_dir = dir.path().to_string_lossy().into_owned();
        Trainer::with_device(config, Device::Cpu).unwrap()
    }

    fn tiny_batch(trainer: &Trainer) -> GlimpseBatch {
        SyntheticDataset::generate(&trainer.config().model, 2, 3)
            .batch(0, 2, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_step_increments_global_step() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);

        let first = trainer.train_step(&batch).unwrap();
        assert_eq!(first.step, 1);
        assert_eq!(trainer.global_step(), 1);
        assert!(first.loss.is_finite());
        assert_eq!(first.learning_rate, trainer.config().training.learning_rate);

        trainer.train_step(&batch).unwrap();
        assert_eq!(trainer.global_step(), 2);
        assert_eq!(trainer.metrics().len(), 2);
    }

    #[test]
    fn test_step_changes_parameters() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);
        let before = trainer.model().named_parameters().unwrap()["classifier.weight"]
            .copy()
            .unwrap();

        trainer.train_step(&batch).unwrap();

        let after = &trainer.model().named_parameters().unwrap()["classifier.weight"];
        let diff = (after - &before).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn test_rejects_out_of_range_labels() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = GlimpseBatch::from_vecs(vec![0.5; 128], vec![0, 5], 8, 8, &Device::Cpu).unwrap();

        assert!(trainer.train_step(&batch).is_err());
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn test_non_finite_input_aborts_before_update() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = GlimpseBatch::from_vecs(vec![f32::NAN; 128], vec![0, 1], 8, 8, &Device::Cpu).unwrap();
        let before = trainer.model().named_parameters().unwrap()["baseline.weight"]
            .to_vec2::<f32>()
            .unwrap();

        let err = trainer.train_step(&batch).unwrap_err();
        assert!(err.is_non_finite());
        assert_eq!(trainer.global_step(), 0);

        let after = trainer.model().named_parameters().unwrap()["baseline.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_evaluate_restores_training_flag() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);

        let eval = trainer.evaluate(&batch).unwrap();
        assert!((0.0..=1.0).contains(&eval.accuracy));
        assert_eq!(eval.predictions.dtype(), DType::U32);
        assert!(trainer.model().is_training());
    }

    #[test]
    fn test_checkpoint_layout_and_resume() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);
        trainer.train_step(&batch).unwrap();
        trainer.train_step(&batch).unwrap();

        let checkpoint = trainer.save_checkpoint().unwrap();
        assert!(checkpoint.ends_with("checkpoint-2"));
        for file in [MODEL_FILE, STATE_FILE, CONFIG_FILE] {
            assert!(checkpoint.join(file).exists(), "missing {file}");
        }

        let mut resumed = tiny_trainer(&dir);
        resumed.resume_from(&checkpoint).unwrap();
        assert_eq!(resumed.global_step(), 2);
        assert_eq!(resumed.learning_rate(), trainer.learning_rate());
    }

    #[test]
    fn test_take_metrics_drains_record() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);
        trainer.train_step(&batch).unwrap();
        trainer.train_step(&batch).unwrap();

        let taken = trainer.take_metrics();
        assert_eq!(taken.iter().map(|m| m.step).collect::<Vec<_>>(), vec![1, 2]);
        assert!(trainer.metrics().is_empty());

        trainer.train_step(&batch).unwrap();
        assert_eq!(trainer.metrics().len(), 1);
        assert_eq!(trainer.metrics()[0].step, 3);
    }

    #[test]
    fn test_load_checkpoint_without_weights_fails() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let batch = tiny_batch(&trainer);
        for _ in 0..3 {
            trainer.train_step(&batch).unwrap();
        }
        let checkpoint = trainer.save_checkpoint().unwrap();
        std::fs::remove_file(checkpoint.join(MODEL_FILE)).unwrap();

        let mut fresh = tiny_trainer(&dir);
        let before = fresh.model().named_parameters().unwrap()["classifier.weight"]
            .to_vec2::<f32>()
            .unwrap();
        let lr = fresh.learning_rate();

        let err = fresh.load_checkpoint(&checkpoint).unwrap_err();
        assert!(matches!(err, GrcamError::Checkpoint(ref msg) if msg.contains(MODEL_FILE)));
        assert_eq!(fresh.global_step(), 0);
        assert_eq!(fresh.epoch(), 0);
        assert_eq!(fresh.learning_rate(), lr);
        let after = fresh.model().named_parameters().unwrap()["classifier.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_load_checkpoint_missing_state() {
        let dir = TempDir::new().unwrap();
        let mut trainer = tiny_trainer(&dir);
        let err = trainer.load_checkpoint(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, GrcamError::Checkpoint(_)));
    }
}
