//! Glimpse network: three `(patch, location)` pairs fused into one embedding.
//!
//! For every candidate location `i` the retina offset is `concat(loc_i, t)`.
//! The patch at that offset goes through the "what" perceptron, the offset
//! itself through the "where" perceptron, and the two are fused with
//! `relu(what + where)`. The three fused vectors are concatenated and passed
//! through the [`PatchEncoder`].

use candle_core::{Device, Tensor};
use candle_nn::{Module, VarBuilder};
use rand::Rng;

use crate::config::ModelConfig;
use crate::encoder::PatchEncoder;
use crate::error::{GrcamError, Result};
use crate::mlp::Mlp;
use crate::retina::{RetinaSensor, SignalGrid};

/// Glimpse network shared across all unroll steps.
pub struct GlimpseNetwork {
    retina: RetinaSensor,
    what: Mlp,
    where_: Mlp,
    encoder: PatchEncoder,
    nb_locations: usize,
    device: Device,
}

impl GlimpseNetwork {
    /// Build the network under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let retina = RetinaSensor::new(config.glimpse_width, config.glimpse_height);
        let what = Mlp::new(
            retina.patch_size(),
            config.g_size,
            config.glimpse_output_size,
            config.init_stddev,
            vb.pp("what"),
        )?;
        let where_ = Mlp::new(
            config.select_dim(),
            config.l_size,
            config.glimpse_output_size,
            config.init_stddev,
            vb.pp("where"),
        )?;
        let encoder = PatchEncoder::new(
            config.nb_locations,
            config.glimpse_output_size,
            config.init_stddev,
            vb.pp("encoder"),
        )?;

        Ok(Self {
            retina,
            what,
            where_,
            encoder,
            nb_locations: config.nb_locations,
            device: device.clone(),
        })
    }

    /// Width of the embedding handed to the recurrent core.
    pub fn output_size(&self) -> usize {
        self.encoder.output_size()
    }

    /// Embed one glimpse step.
    ///
    /// `locations` holds one `(batch, loc_dim)` tensor per candidate, `time`
    /// is `(batch, time_dim)`. Returns `(batch, output_size)`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        grid: &SignalGrid,
        locations: &[Tensor],
        time: &Tensor,
        rng: &mut R,
    ) -> Result<Tensor> {
        if locations.len() != self.nb_locations {
            return Err(GrcamError::shape_mismatch(
                format!("{} candidate locations", self.nb_locations),
                format!("{}", locations.len()),
            ));
        }

        let mut fused = Vec::with_capacity(self.nb_locations);
        for loc in locations {
            let offset = Tensor::cat(&[loc, time], 1)?;
            let patch = self.retina.extract(grid, &offset, rng, &self.device)?;
            let what = self.what.forward(&patch)?;
            let where_ = self.where_.forward(&offset)?;
            fused.push((what + where_)?.relu()?);
        }

        let whole = Tensor::cat(&fused, 1)?;
        Ok(self.encoder.forward(&whole)?)
    }

    /// Embed a step from a flat policy action.
    ///
    /// The action is `(batch, nb_locations * loc_dim + time_dim)`: candidate
    /// `i` occupies columns `[i * loc_dim, (i + 1) * loc_dim)` and the time
    /// slice is the trailing `time_dim` columns.
    pub fn forward_action<R: Rng + ?Sized>(
        &self,
        grid: &SignalGrid,
        action: &Tensor,
        loc_dim: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        let width = action.dim(1)?;
        let located = self.nb_locations * loc_dim;
        if width <= located {
            return Err(GrcamError::shape_mismatch(
                format!("action wider than {located}"),
                format!("{:?}", action.dims()),
            ));
        }

        let locations = (0..self.nb_locations)
            .map(|i| action.narrow(1, i * loc_dim, loc_dim))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let time = action.narrow(1, located, width - located)?;

        self.forward(grid, &locations, &time, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::config::GrcamConfig;

    fn setup() -> (GlimpseNetwork, SignalGrid, VarMap) {
        let config = GrcamConfig::tiny_preset().model;
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let network = GlimpseNetwork::new(&config, vb, &device).unwrap();

        let signals = Tensor::randn(0f32, 1.0, (3, 8, 8), &device).unwrap();
        let grid = SignalGrid::from_tensor(&signals).unwrap();
        (network, grid, var_map)
    }

    #[test]
    fn test_forward_shape() {
        let (network, grid, _) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loc = Tensor::zeros((3, 1), DType::F32, &Device::Cpu).unwrap();
        let locations = vec![loc.clone(), loc.clone(), loc.clone()];

        let out = network.forward(&grid, &locations, &loc, &mut rng).unwrap();
        assert_eq!(out.dims(), &[3, network.output_size()]);
        assert_eq!(network.output_size(), 120);
    }

    #[test]
    fn test_forward_action_matches_split() {
        let (network, grid, _) = setup();
        let action = Tensor::new(
            &[[0.1f32, -0.2, 0.3, 0.4], [0.4, 0.2, -0.3, 0.1], [0.0, 0.0, 0.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap();

        // In-bounds offsets draw no noise, so both paths are deterministic.
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = network.forward_action(&grid, &action, 1, &mut rng).unwrap();

        let locations: Vec<Tensor> = (0..3).map(|i| action.narrow(1, i, 1).unwrap()).collect();
        let time = action.narrow(1, 3, 1).unwrap();
        let b = network.forward(&grid, &locations, &time, &mut rng).unwrap();

        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_rejects_wrong_location_count() {
        let (network, grid, _) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let loc = Tensor::zeros((3, 1), DType::F32, &Device::Cpu).unwrap();

        let err = network.forward(&grid, &[loc.clone()], &loc, &mut rng).unwrap_err();
        assert!(matches!(err, GrcamError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_parameters_registered() {
        let (_, _, var_map) = setup();
        let data = var_map.data().lock().unwrap();
        for name in ["what.fc1.weight", "what.fc2.bias", "where.fc1.weight", "encoder.weight"] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
