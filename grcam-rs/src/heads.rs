//! Baseline and classification heads.

use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::error::{GrcamError, Result};
use crate::mlp::dense;

/// Per-step scalar baseline shared across steps.
pub struct BaselineHead {
    linear: Linear,
}

impl BaselineHead {
    /// Create a `cell_size -> 1` regression head.
    pub fn new(cell_size: usize, stddev: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: dense(cell_size, 1, stddev, vb)?,
        })
    }

    /// Baselines for the feedback-step outputs, shaped `(batch, steps)`.
    pub fn forward(&self, step_outputs: &[Tensor]) -> Result<Tensor> {
        if step_outputs.is_empty() {
            return Err(GrcamError::shape_mismatch("at least one step output", "0"));
        }
        let per_step = step_outputs
            .iter()
            .map(|h| self.linear.forward(h)?.squeeze(1))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&per_step, 0)?.t()?)
    }
}

/// Final-step linear classifier.
pub struct ClassificationHead {
    linear: Linear,
}

impl ClassificationHead {
    /// Create a `cell_size -> nb_classes` head.
    pub fn new(cell_size: usize, nb_classes: usize, stddev: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: dense(cell_size, nb_classes, stddev, vb)?,
        })
    }
}

impl Module for ClassificationHead {
    fn forward(&self, h: &Tensor) -> candle_core::Result<Tensor> {
        self.linear.forward(h)
    }
}

/// Softmax probabilities and arg-max class ids (`u32`) for `(batch, classes)` logits.
pub fn predict(logits: &Tensor) -> Result<(Tensor, Tensor)> {
    let probabilities = candle_nn::ops::softmax(logits, D::Minus1)?;
    let predictions = probabilities.argmax(D::Minus1)?;
    Ok((probabilities, predictions))
}

/// Fraction of predictions equal to their label.
pub fn accuracy(predictions: &Tensor, labels: &Tensor) -> Result<f32> {
    if predictions.dims() != labels.dims() {
        return Err(GrcamError::shape_mismatch(
            format!("{:?}", predictions.dims()),
            format!("{:?}", labels.dims()),
        ));
    }
    let labels = labels.to_dtype(predictions.dtype())?;
    let hits = predictions.eq(&labels)?.to_dtype(DType::F32)?;
    Ok(hits.mean_all()?.to_scalar::<f32>()?)
}
