//! Adam optimizer wrapper and global-norm gradient clipping.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainingConfig;
use crate::error::{GrcamError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay; zero gives plain Adam
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Adam settings for a training configuration.
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            ..Default::default()
        }
    }

    /// Create an AdamW optimizer over every variable of `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> Result<AdamWOptimizer> {
        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let opt = candle_nn::AdamW::new(vars, params)
            .map_err(|e| GrcamError::Training(format!("Failed to create AdamW: {}", e)))?;

        Ok(AdamWOptimizer { inner: opt })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamWOptimizer {
    /// Apply already computed (and possibly clipped) gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner
            .step(grads)
            .map_err(|e| GrcamError::Training(format!("Optimizer step failed: {}", e)))
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

/// Rescale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. Variables without a gradient are skipped.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sum_sq += f64::from(grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?);
        }
    }
    let norm = sum_sq.sqrt();

    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, (grad * scale)?);
            }
        }
        tracing::debug!(norm, max_norm, "clipped gradients");
    }

    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.weight_decay, 0.0);
    }

    #[test]
    fn test_from_training() {
        let training = TrainingConfig {
            learning_rate: 3e-3,
            ..Default::default()
        };
        let config = OptimizerConfig::from_training(&training);
        assert_eq!(config.learning_rate, 3e-3);
        assert_eq!(config.weight_decay, 0.0);
    }

    #[test]
    fn test_build_adamw() -> Result<()> {
        let config = OptimizerConfig::default();
        let varmap = VarMap::new();

        let mut optimizer = config.build_adamw(&varmap)?;
        assert_eq!(optimizer.learning_rate(), 1e-3);
        optimizer.set_learning_rate(5e-4);
        assert_eq!(optimizer.learning_rate(), 5e-4);

        Ok(())
    }

    #[test]
    fn test_step_moves_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(2, "w", candle_nn::Init::Const(1.0))?;

        let mut optimizer = OptimizerConfig::default().build_adamw(&varmap)?;
        let grads = w.sum_all()?.backward()?;
        optimizer.step(&grads)?;

        let after = varmap.all_vars()[0].to_vec1::<f32>()?;
        assert!(after.iter().all(|&v| v < 1.0));
        Ok(())
    }

    fn grads_for(values: &[f32]) -> (Var, GradStore) {
        let var = Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap();
        // d/dx (x^2 / 2) = x, so the gradient equals the values.
        let loss = (var.as_tensor().sqr().unwrap().sum_all().unwrap() * 0.5).unwrap();
        let grads = loss.backward().unwrap();
        (var, grads)
    }

    #[test]
    fn test_clip_scales_large_gradients() {
        let (var, mut grads) = grads_for(&[3.0, 4.0]);
        let norm = clip_grad_norm(&mut grads, &[var.clone()], 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);

        let clipped = grads.get(&var).unwrap().to_vec1::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-6);
        assert!((clipped[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let (var, mut grads) = grads_for(&[0.3, 0.4]);
        let norm = clip_grad_norm(&mut grads, &[var.clone()], 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);

        let kept = grads.get(&var).unwrap().to_vec1::<f32>().unwrap();
        assert!((kept[0] - 0.3).abs() < 1e-6);
        assert!((kept[1] - 0.4).abs() < 1e-6);
    }
}
