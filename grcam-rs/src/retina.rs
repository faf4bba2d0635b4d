//! Retina sensor: fixed-size patch extraction at normalized offsets.
//!
//! Offsets are `(y, x)` pairs in normalized, centred coordinates: `-1` is the
//! top/left edge of the signal, `0` its centre and `1` the bottom/right edge.
//! The window may hang partly or wholly outside the signal; those pixels are
//! filled with uniform noise spanning the example's own value range so that an
//! exploring location policy never sees a hard border.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::error::{GrcamError, Result};

/// Host-side copy of a `(batch, height, width)` signal batch.
///
/// The retina reads the same signals three times per glimpse step, so the
/// batch is pulled off the device once per forward pass.
#[derive(Debug, Clone)]
pub struct SignalGrid {
    data: Vec<f32>,
    ranges: Vec<(f32, f32)>,
    batch: usize,
    height: usize,
    width: usize,
}

impl SignalGrid {
    /// Copy a rank-3 signal tensor to the host.
    pub fn from_tensor(signals: &Tensor) -> Result<Self> {
        let (batch, height, width) = signals
            .dims3()
            .map_err(|_| GrcamError::shape_mismatch("(batch, height, width)", format!("{:?}", signals.dims())))?;
        let data = signals.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;

        let ranges = if height * width == 0 {
            vec![(0.0, 0.0); batch]
        } else {
            data.chunks(height * width)
                .map(|image| {
                    let lo = image.iter().copied().fold(f32::INFINITY, f32::min);
                    let hi = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    (lo, hi)
                })
                .collect()
        };

        Ok(Self {
            data,
            ranges,
            batch,
            height,
            width,
        })
    }

    /// Number of examples.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// `(height, width)` of every example.
    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn pixel(&self, example: usize, y: i64, x: i64) -> Option<f32> {
        if y < 0 || x < 0 || y >= self.height as i64 || x >= self.width as i64 {
            return None;
        }
        let idx = example * self.height * self.width + y as usize * self.width + x as usize;
        self.data.get(idx).copied()
    }

    fn noise<R: Rng + ?Sized>(&self, example: usize, rng: &mut R) -> f32 {
        let (lo, hi) = self.ranges[example];
        if lo.is_finite() && hi.is_finite() && lo < hi {
            rng.random_range(lo..hi)
        } else if lo.is_finite() {
            lo
        } else {
            0.0
        }
    }
}

/// Extracts `window_height × window_width` patches, flattened row-major.
#[derive(Debug, Clone)]
pub struct RetinaSensor {
    window_width: usize,
    window_height: usize,
}

impl RetinaSensor {
    /// Create a sensor with the given window size.
    pub fn new(window_width: usize, window_height: usize) -> Self {
        Self {
            window_width,
            window_height,
        }
    }

    /// Flattened patch width, `window_width * window_height`.
    pub fn patch_size(&self) -> usize {
        self.window_width * self.window_height
    }

    /// Extract one patch per example.
    ///
    /// `locs` is `(batch, 2)` holding `(y, x)` offsets. Returns
    /// `(batch, window_width * window_height)` whatever the offsets are.
    pub fn extract<R: Rng + ?Sized>(
        &self,
        grid: &SignalGrid,
        locs: &Tensor,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        let (batch, dims) = locs
            .dims2()
            .map_err(|_| GrcamError::shape_mismatch("(batch, 2)", format!("{:?}", locs.dims())))?;
        if dims != 2 || batch != grid.batch {
            return Err(GrcamError::shape_mismatch(
                format!("({}, 2)", grid.batch),
                format!("{:?}", locs.dims()),
            ));
        }

        let offsets = locs.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        let (height, width) = grid.dims();
        let mut patches = Vec::with_capacity(batch * self.patch_size());

        for (example, offset) in offsets.iter().enumerate() {
            let top = window_origin(offset[0], height, self.window_height);
            let left = window_origin(offset[1], width, self.window_width);
            for r in 0..self.window_height {
                let y = top.saturating_add(r as i64);
                for c in 0..self.window_width {
                    let x = left.saturating_add(c as i64);
                    let value = match grid.pixel(example, y, x) {
                        Some(v) => v,
                        None => grid.noise(example, rng),
                    };
                    patches.push(value);
                }
            }
        }

        Ok(Tensor::from_vec(patches, (batch, self.patch_size()), device)?)
    }
}

/// First row (or column) covered by a window centred at a normalized offset.
///
/// A non-finite offset places the window entirely off the signal.
fn window_origin(offset: f32, extent: usize, window: usize) -> i64 {
    if !offset.is_finite() {
        return i64::MIN / 2;
    }
    let centre = (f64::from(offset) + 1.0) * extent as f64 / 2.0;
    (centre - window as f64 / 2.0).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ramp(batch: usize, height: usize, width: usize) -> Tensor {
        let data: Vec<f32> = (0..batch * height * width).map(|v| v as f32).collect();
        Tensor::from_vec(data, (batch, height, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_window_origin() {
        // Centre of an 8-wide signal with a 4-wide window starts at column 2.
        assert_eq!(window_origin(0.0, 8, 4), 2);
        assert_eq!(window_origin(-1.0, 8, 4), -2);
        assert_eq!(window_origin(1.0, 8, 4), 6);
        assert_eq!(window_origin(f32::NAN, 8, 4), i64::MIN / 2);
        assert_eq!(window_origin(f32::INFINITY, 8, 4), i64::MIN / 2);
    }

    #[test]
    fn test_nan_offset_sees_only_noise() {
        let signals = ramp(1, 8, 8);
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        let sensor = RetinaSensor::new(4, 4);
        let locs = Tensor::new(&[[f32::NAN, f32::NAN]], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let patch = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap();
        let values = &patch.to_vec2::<f32>().unwrap()[0];
        assert_eq!(values.len(), 16);
        assert!(values.iter().all(|&v| (0.0..=63.0).contains(&v)));
        // Ramp pixels are whole numbers; uniform noise is not.
        assert!(values.iter().all(|v| v.fract() != 0.0), "{values:?}");
    }

    #[test]
    fn test_centred_patch_is_exact() {
        let signals = ramp(1, 8, 8);
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        let sensor = RetinaSensor::new(2, 2);
        let locs = Tensor::new(&[[0f32, 0.0]], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let patch = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap();
        // Window origin (3, 3): pixels 27, 28, 35, 36.
        assert_eq!(patch.to_vec2::<f32>().unwrap(), vec![vec![27.0, 28.0, 35.0, 36.0]]);
    }

    #[test]
    fn test_offsets_select_rows_and_columns() {
        let signals = ramp(1, 4, 4);
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        let sensor = RetinaSensor::new(1, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        // y = -0.75 → row 0, x = 0.75 → column 3.
        let locs = Tensor::new(&[[-0.75f32, 0.75]], &Device::Cpu).unwrap();
        let patch = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(patch.to_vec2::<f32>().unwrap(), vec![vec![3.0]]);
    }

    #[test]
    fn test_out_of_bounds_filled_with_noise_in_range() {
        let signals = ramp(2, 8, 8);
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        let sensor = RetinaSensor::new(4, 4);
        let locs = Tensor::new(&[[50f32, -50.0], [-1e30, 1e30]], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let patch = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(patch.dims(), &[2, 16]);

        let values = patch.to_vec2::<f32>().unwrap();
        assert!(values[0].iter().all(|&v| (0.0..=63.0).contains(&v)));
        assert!(values[1].iter().all(|&v| (64.0..=127.0).contains(&v)));
    }

    #[test]
    fn test_constant_signal_noise_is_constant() {
        let signals = Tensor::ones((1, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        let sensor = RetinaSensor::new(2, 2);
        let locs = Tensor::new(&[[5f32, 5.0]], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        let patch = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap();
        assert!(patch.to_vec2::<f32>().unwrap()[0].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_rejects_wrong_offset_width() {
        let grid = SignalGrid::from_tensor(&ramp(1, 4, 4)).unwrap();
        let sensor = RetinaSensor::new(2, 2);
        let locs = Tensor::new(&[[0f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let err = sensor.extract(&grid, &locs, &mut rng, &Device::Cpu).unwrap_err();
        assert!(matches!(err, GrcamError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_grid_rejects_rank_two() {
        let signals = Tensor::zeros((4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(SignalGrid::from_tensor(&signals).is_err());
    }
}
