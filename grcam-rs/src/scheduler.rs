//! Learning rate schedule.

use crate::config::TrainingConfig;
use crate::optimizer::AdamWOptimizer;

/// Staircase exponential decay with a floor.
///
/// `lr(step) = max(initial * factor ^ floor(step / interval), min)`.
#[derive(Debug, Clone)]
pub struct StaircaseDecay {
    initial: f64,
    factor: f64,
    min: f64,
    interval: u64,
}

impl StaircaseDecay {
    /// Create a schedule. An `interval` of zero is treated as one.
    pub fn new(initial: f64, factor: f64, min: f64, interval: u64) -> Self {
        Self {
            initial,
            factor,
            min,
            interval: interval.max(1),
        }
    }

    /// Schedule described by a training configuration.
    pub fn from_config(training: &TrainingConfig) -> Self {
        Self::new(
            training.learning_rate,
            training.learning_rate_decay_factor,
            training.min_learning_rate,
            training.nb_training_batch,
        )
    }

    /// Learning rate at `global_step`.
    pub fn learning_rate(&self, global_step: u64) -> f64 {
        let exponent = (global_step / self.interval) as f64;
        let decayed = self.initial * self.factor.powf(exponent);
        // powf underflows to 0 for huge steps; NaN never survives max.
        decayed.max(self.min)
    }

    /// Set the optimizer's learning rate for `global_step` and return it.
    pub fn apply(&self, global_step: u64, optimizer: &mut AdamWOptimizer) -> f64 {
        let lr = self.learning_rate(global_step);
        optimizer.set_learning_rate(lr);
        lr
    }

    /// Floor of the schedule.
    pub fn min_learning_rate(&self) -> f64 {
        self.min
    }
}
