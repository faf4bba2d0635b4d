//! Convolutional encoder over the concatenated per-location embeddings.

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, Module, VarBuilder};

/// Output channels of the encoder convolution.
pub const CONV_CHANNELS: usize = 40;

/// Single `1 × input_width` convolution with ReLU, flattened.
///
/// The `(batch, rows * input_width)` input is viewed as a one-channel
/// `rows × input_width` image, one row per candidate location. Because the
/// kernel spans the full row, each output position summarises one location
/// and the 40 channels mix its features.
pub struct PatchEncoder {
    conv: Conv2d,
    rows: usize,
    input_width: usize,
}

impl PatchEncoder {
    /// Create an encoder for `rows` rows of `input_width` features.
    pub fn new(rows: usize, input_width: usize, stddev: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (CONV_CHANNELS, 1, 1, input_width),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: stddev,
            },
        )?;
        let bias = vb.get_with_hints(CONV_CHANNELS, "bias", Init::Const(0.0))?;
        let conv = Conv2d::new(weight, Some(bias), Conv2dConfig::default());

        Ok(Self {
            conv,
            rows,
            input_width,
        })
    }

    /// Flattened output width, `h' * w' * 40`.
    pub fn output_size(&self) -> usize {
        // Full-width kernel with stride 1 and no padding leaves one column.
        self.rows * CONV_CHANNELS
    }
}

impl Module for PatchEncoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let image = x.reshape((batch, 1, self.rows, self.input_width))?;
        let features = self.conv.forward(&image)?.relu()?;
        // (batch, channels, h', w') -> (batch, h', w', channels) before flattening.
        features.permute((0, 2, 3, 1))?.flatten_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);

        let encoder = PatchEncoder::new(3, 8, 0.1, vb).unwrap();
        assert_eq!(encoder.output_size(), 120);

        let x = Tensor::randn(0f32, 1.0, (4, 24), &device).unwrap();
        let y = encoder.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 120]);
    }

    #[test]
    fn test_relu_output_non_negative() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);

        let encoder = PatchEncoder::new(3, 5, 1.0, vb).unwrap();
        let x = Tensor::randn(0f32, 3.0, (2, 15), &device).unwrap();
        let y = encoder.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(y.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_rows_do_not_mix() {
        // With zero bias, a zero row must encode to zero regardless of the other rows.
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);

        let encoder = PatchEncoder::new(3, 2, 1.0, vb).unwrap();
        let x = Tensor::new(&[[0f32, 0.0, 5.0, -3.0, 0.0, 0.0]], &device).unwrap();
        let y = encoder.forward(&x).unwrap().reshape((1, 3, CONV_CHANNELS)).unwrap();
        let rows = y.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert!(rows[0].iter().all(|&v| v == 0.0));
        assert!(rows[2].iter().all(|&v| v == 0.0));
    }
}
