//! Recurrent core and its glimpse feedback loop.
//!
//! The unroll runs in two phases. Step 0 consumes a seed glimpse computed by
//! the caller from random locations. Each of the following `nb_glimpses`
//! steps calls a step function with the previous recurrent output; the step
//! function picks a location, embeds the next glimpse and hands both back.
//! The driver owns the trajectory buffers and appends to them in step order.

use candle_core::Tensor;
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::VarBuilder;

use crate::error::{GrcamError, Result};
use crate::location::LocationSample;

/// Output of one feedback step.
#[derive(Debug, Clone)]
pub struct FeedbackStep {
    /// Glimpse embedding fed to the next recurrent step.
    pub input: Tensor,
    /// Location decision that produced `input`.
    pub sample: LocationSample,
}

/// Location decisions recorded during an unroll, one entry per glimpse step.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    /// Actions actually looked at (detached).
    pub locs: Vec<Tensor>,
    /// Policy means (detached).
    pub loc_means: Vec<Tensor>,
    /// Policy means linked to the location layer, for the log-likelihood.
    pub policy_means: Vec<Tensor>,
}

impl Trajectory {
    fn with_capacity(steps: usize) -> Self {
        Self {
            locs: Vec::with_capacity(steps),
            loc_means: Vec::with_capacity(steps),
            policy_means: Vec::with_capacity(steps),
        }
    }

    fn push(&mut self, sample: LocationSample) {
        self.locs.push(sample.action);
        self.loc_means.push(sample.mean);
        self.policy_means.push(sample.policy_mean);
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.locs.len()
    }

    /// True before any step was recorded.
    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }
}

/// Result of a full unroll.
#[derive(Debug, Clone)]
pub struct Unroll {
    /// Recurrent outputs, seed step first; `nb_glimpses + 1` entries.
    pub outputs: Vec<Tensor>,
    /// Recorded location decisions; `nb_glimpses` entries.
    pub trajectory: Trajectory,
}

impl Unroll {
    /// Output of the last step.
    pub fn last_output(&self) -> Result<&Tensor> {
        self.outputs
            .last()
            .ok_or_else(|| GrcamError::Training("unroll produced no outputs".to_string()))
    }

    /// Outputs of the feedback steps, excluding the seed step.
    pub fn step_outputs(&self) -> &[Tensor] {
        self.outputs.get(1..).unwrap_or(&[])
    }
}

/// Single LSTM cell unrolled for a fixed number of glimpses.
pub struct RecurrentCore {
    cell: LSTM,
    nb_glimpses: usize,
}

impl RecurrentCore {
    /// Create a core of `cell_size` units reading `input_size` features.
    pub fn new(input_size: usize, cell_size: usize, nb_glimpses: usize, vb: VarBuilder) -> Result<Self> {
        let cell = lstm(input_size, cell_size, LSTMConfig::default(), vb)?;
        Ok(Self { cell, nb_glimpses })
    }

    /// Number of feedback steps after the seed step.
    pub fn nb_glimpses(&self) -> usize {
        self.nb_glimpses
    }

    /// Run the seed step then `nb_glimpses` feedback steps.
    ///
    /// The state starts at zero for the batch of `seed` and is dropped when
    /// the unroll returns.
    pub fn unroll<F>(&self, seed: &Tensor, mut step_fn: F) -> Result<Unroll>
    where
        F: FnMut(&Tensor) -> Result<FeedbackStep>,
    {
        let batch = seed.dim(0)?;
        let mut outputs = Vec::with_capacity(self.nb_glimpses + 1);
        let mut trajectory = Trajectory::with_capacity(self.nb_glimpses);

        let mut state = self.cell.step(seed, &self.cell.zero_state(batch)?)?;
        outputs.push(state.h().clone());

        for _ in 0..self.nb_glimpses {
            let step = step_fn(state.h())?;
            state = self.cell.step(&step.input, &state)?;
            trajectory.push(step.sample);
            outputs.push(state.h().clone());
        }

        Ok(Unroll { outputs, trajectory })
    }
}
