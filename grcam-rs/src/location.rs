//! Stochastic location policy.
//!
//! The policy maps the recurrent output to a clipped mean offset and, when
//! sampling, perturbs it with Gaussian noise of fixed standard deviation. The
//! action and the mean handed to the rest of the model are detached: the
//! location layer is trained only through the REINFORCE log-likelihood term,
//! which is evaluated on [`LocationSample::policy_mean`].

use std::f64::consts::PI;

use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::mlp::dense;

/// Lower bound of every location coordinate.
pub const LOC_MIN: f64 = -1.0;
/// Upper bound of every location coordinate.
pub const LOC_MAX: f64 = 1.0;

/// One policy decision for a batch.
#[derive(Debug, Clone)]
pub struct LocationSample {
    /// Sampled (or, without sampling, mean) location, detached.
    pub action: Tensor,
    /// Clipped mean, detached.
    pub mean: Tensor,
    /// Clipped mean still attached to the location layer.
    pub policy_mean: Tensor,
}

/// Linear location policy `h -> clip(W h + b)`.
pub struct LocationNetwork {
    linear: Linear,
    output_dim: usize,
    variance: f64,
    is_sampling: bool,
}

impl LocationNetwork {
    /// Create a policy emitting `output_dim` coordinates from `rnn_output_size` inputs.
    ///
    /// `output_dim` covers every candidate location plus the time slice.
    pub fn new(
        rnn_output_size: usize,
        output_dim: usize,
        variance: f64,
        is_sampling: bool,
        stddev: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = dense(rnn_output_size, output_dim, stddev, vb)?;
        Ok(Self {
            linear,
            output_dim,
            variance,
            is_sampling,
        })
    }

    /// Action width.
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Noise standard deviation.
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Whether noise is added to the mean.
    pub fn is_sampling(&self) -> bool {
        self.is_sampling
    }

    /// Enable or disable sampling noise.
    pub fn set_sampling(&mut self, is_sampling: bool) {
        self.is_sampling = is_sampling;
    }

    /// Choose the next location from the previous recurrent output.
    pub fn sample<R: Rng + ?Sized>(&self, cell_output: &Tensor, rng: &mut R) -> Result<LocationSample> {
        let policy_mean = self.linear.forward(cell_output)?.clamp(LOC_MIN, LOC_MAX)?;
        let mean = policy_mean.detach();

        let action = if self.is_sampling && self.variance > 0.0 {
            let noise = gaussian_noise(mean.dims2()?, self.variance, rng, mean.device())?;
            (&mean + noise)?.clamp(LOC_MIN, LOC_MAX)?.detach()
        } else {
            mean.clone()
        };

        Ok(LocationSample {
            action,
            mean,
            policy_mean,
        })
    }
}

fn gaussian_noise<R: Rng + ?Sized>(
    (batch, dim): (usize, usize),
    stddev: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let normal = Normal::new(0.0f32, stddev as f32)
        .map_err(|e| candle_core::Error::Msg(format!("invalid sampling stddev: {e}")))?;
    let values: Vec<f32> = (0..batch * dim).map(|_| normal.sample(rng)).collect();
    Tensor::from_vec(values, (batch, dim), device)
}

/// Per-step Gaussian log-likelihood of the recorded actions.
///
/// `means[t]` and `locs[t]` are `(batch, loc_dim)`; the density uses standard
/// deviation `variance` and is summed over coordinates. Returns
/// `(batch, timesteps)`. A zero variance yields zeros: a deterministic policy
/// contributes no REINFORCE term.
pub fn log_likelihood(means: &[Tensor], locs: &[Tensor], variance: f64) -> Result<Tensor> {
    if means.len() != locs.len() || means.is_empty() {
        return Err(candle_core::Error::Msg(format!(
            "trajectory mismatch: {} means, {} locations",
            means.len(),
            locs.len()
        )));
    }

    let means = Tensor::stack(means, 0)?; // (timesteps, batch, loc_dim)
    let locs = Tensor::stack(locs, 0)?;

    if variance <= 0.0 {
        let (timesteps, batch, _) = means.dims3()?;
        return Tensor::zeros((batch, timesteps), means.dtype(), means.device());
    }

    let log_norm = variance.ln() + 0.5 * (2.0 * PI).ln();
    let z = ((locs - means)? / variance)?;
    let logll = z.sqr()?.affine(-0.5, -log_norm)?.sum(2)?; // (timesteps, batch)
    logll.t()
}
