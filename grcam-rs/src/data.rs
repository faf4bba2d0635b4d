//! Signal batches and a synthetic dataset.

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ModelConfig;
use crate::error::{GrcamError, Result};

/// A validated batch of `(batch, height, width)` f32 signals and `(batch,)`
/// u32 labels.
#[derive(Debug, Clone)]
pub struct GlimpseBatch {
    /// Signals, `(batch, height, width)`.
    pub signals: Tensor,
    /// Class ids, `(batch,)`.
    pub labels: Tensor,
}

impl GlimpseBatch {
    /// Validate and wrap existing tensors.
    ///
    /// Signals are converted to f32 and labels to u32.
    pub fn new(signals: Tensor, labels: Tensor) -> Result<Self> {
        let (batch, _, _) = signals
            .dims3()
            .map_err(|_| GrcamError::shape_mismatch("signals (batch, height, width)", format!("{:?}", signals.dims())))?;
        if batch == 0 {
            return Err(GrcamError::shape_mismatch("non-empty batch", "0 examples"));
        }
        if labels.dims() != [batch] {
            return Err(GrcamError::shape_mismatch(
                format!("labels ({batch},)"),
                format!("{:?}", labels.dims()),
            ));
        }

        Ok(Self {
            signals: signals.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
        })
    }

    /// Build a batch from flat row-major signal data.
    pub fn from_vecs(
        signals: Vec<f32>,
        labels: Vec<u32>,
        height: usize,
        width: usize,
        device: &Device,
    ) -> Result<Self> {
        let batch = labels.len();
        if signals.len() != batch * height * width {
            return Err(GrcamError::shape_mismatch(
                format!("{} signal values", batch * height * width),
                signals.len().to_string(),
            ));
        }
        let signals = Tensor::from_vec(signals, (batch, height, width), device)?;
        let labels = Tensor::from_vec(labels, batch, device)?;
        Self::new(signals, labels)
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// True for an empty batch; never the case for a validated batch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject labels outside `0..nb_classes`.
    pub fn check_classes(&self, nb_classes: usize) -> Result<()> {
        let max = self.labels.max_all()?.to_scalar::<u32>()? as usize;
        if max >= nb_classes {
            return Err(GrcamError::shape_mismatch(
                format!("labels < {nb_classes}"),
                format!("label {max}"),
            ));
        }
        Ok(())
    }
}

/// Separable toy dataset: each class lights up its own horizontal band.
///
/// Background pixels are uniform in `[0, 0.2)`, band pixels in `[0.8, 1.0)`.
/// Example `i` has class `i % nb_classes`, so consecutive examples cycle
/// through the classes.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    signals: Vec<f32>,
    labels: Vec<u32>,
    height: usize,
    width: usize,
}

impl SyntheticDataset {
    /// Generate `len` examples shaped for `config`.
    pub fn generate(config: &ModelConfig, len: usize, seed: u64) -> Self {
        let (height, width, classes) = (config.img_height, config.img_width, config.nb_classes.max(1));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut signals = Vec::with_capacity(len * height * width);
        let mut labels = Vec::with_capacity(len);

        for i in 0..len {
            let class = i % classes;
            for row in 0..height {
                let lit = row * classes / height.max(1) == class;
                for _ in 0..width {
                    let value = if lit {
                        rng.random_range(0.8f32..1.0)
                    } else {
                        rng.random_range(0.0f32..0.2)
                    };
                    signals.push(value);
                }
            }
            labels.push(class as u32);
        }

        Self {
            signals,
            labels,
            height,
            width,
        }
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in example order.
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Examples `[start, start + count)` as one batch, truncated at the end.
    pub fn batch(&self, start: usize, count: usize, device: &Device) -> Result<GlimpseBatch> {
        let end = (start + count).min(self.len());
        if start >= end {
            return Err(GrcamError::shape_mismatch(
                format!("examples starting at {start}"),
                format!("dataset of {}", self.len()),
            ));
        }
        let pixels = self.height * self.width;
        GlimpseBatch::from_vecs(
            self.signals[start * pixels..end * pixels].to_vec(),
            self.labels[start..end].to_vec(),
            self.height,
            self.width,
            device,
        )
    }

    /// Consecutive batches of `batch_size`; the last one may be shorter.
    pub fn batches(&self, batch_size: usize, device: &Device) -> Result<Vec<GlimpseBatch>> {
        let batch_size = batch_size.max(1);
        (0..self.len())
            .step_by(batch_size)
            .map(|start| self.batch(start, batch_size, device))
            .collect()
    }
}
