//! Dense layers and the two-layer perceptron used by the glimpse network.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Linear layer with weights drawn from N(0, `stddev`) and zero bias.
///
/// The weight is stored as `(out_features, in_features)` under `weight`, the
/// bias under `bias`, so the layer round-trips through a `VarMap` by name.
pub fn dense(in_features: usize, out_features: usize, stddev: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_features, in_features),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: stddev,
        },
    )?;
    let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// `second(relu(first(x)))`, with no activation after the second layer.
pub struct Mlp {
    first: Linear,
    second: Linear,
}

impl Mlp {
    /// Create an `in → hidden → out` perceptron.
    pub fn new(
        in_features: usize,
        hidden: usize,
        out_features: usize,
        stddev: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let first = dense(in_features, hidden, stddev, vb.pp("fc1"))?;
        let second = dense(hidden, out_features, stddev, vb.pp("fc2"))?;
        Ok(Self { first, second })
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.first.weight().dim(1).unwrap_or(0)
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.second.weight().dim(0).unwrap_or(0)
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.second.forward(&self.first.forward(x)?.relu()?)
    }
}
