// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use si_config::SeedSource;
use si_nn::module::{Module, Parameter};
use si_nn::{Conv2d, Relu, Sequential};
use si_tensor::{FeatureMap, PureResult, Tensor, TensorError};

/// Number of convolutions in a block unless configured otherwise.
pub const DEFAULT_BLOCK_DEPTH: usize = 6;

/// Stack of same-padded 3×3 convolutions with a ReLU between consecutive
/// convolutions. The last convolution is not activated, and the spatial
/// extent never changes.
#[derive(Debug)]
pub struct ConvBlock {
    layers: Sequential,
    in_channels: usize,
    out_channels: usize,
    hw: (usize, usize),
    depth: usize,
}

impl ConvBlock {
    /// Builds `depth` convolutions named `{name}.conv{i}`; the first maps
    /// `in_channels → out_channels`, the rest keep `out_channels`.
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        hw: (usize, usize),
        depth: usize,
        seeds: SeedSource,
    ) -> PureResult<Self> {
        if depth == 0 {
            return Err(TensorError::InvalidValue {
                label: "conv_block_depth",
            });
        }
        let mut layers = Sequential::new();
        for idx in 0..depth {
            let conv_name = format!("{name}.conv{idx}");
            let conv_in = if idx == 0 { in_channels } else { out_channels };
            let seed = seeds.seed_for(&conv_name);
            layers.push(Conv2d::same_3x3(
                conv_name,
                conv_in,
                out_channels,
                hw,
                Some(seed),
            )?);
            if idx + 1 < depth {
                layers.push(Relu::new());
            }
        }
        Ok(Self {
            layers,
            in_channels,
            out_channels,
            hw,
            depth,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn hw(&self) -> (usize, usize) {
        self.hw
    }

    /// Number of convolutions in the stack.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn forward_map(&self, input: &FeatureMap) -> PureResult<FeatureMap> {
        input.expect_geometry(self.in_channels, self.hw)?;
        FeatureMap::new(
            self.layers.forward(input.tensor())?,
            self.out_channels,
            self.hw,
        )
    }

    pub fn backward_map(
        &mut self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> PureResult<FeatureMap> {
        input.expect_geometry(self.in_channels, self.hw)?;
        grad_output.expect_geometry(self.out_channels, self.hw)?;
        let grad = self.layers.backward(input.tensor(), grad_output.tensor())?;
        FeatureMap::new(grad, self.in_channels, self.hw)
    }
}

impl Module for ConvBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.layers.forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.layers.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.layers.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.layers.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(batch: usize, channels: usize, hw: (usize, usize)) -> FeatureMap {
        FeatureMap::from_fn(batch, channels, hw, |b, c, y, x| {
            ((b + 2 * c + 3 * y + x) % 7) as f32 / 7.0 - 0.5
        })
        .unwrap()
    }

    #[test]
    fn block_maps_channels_and_keeps_spatial_extent() {
        let block = ConvBlock::new("enc", 3, 5, (6, 4), DEFAULT_BLOCK_DEPTH, SeedSource::new(1))
            .unwrap();
        let out = block.forward_map(&ramp(2, 3, (6, 4))).unwrap();
        assert_eq!(out.dims(), [2, 5, 6, 4]);
    }

    #[test]
    fn block_registers_one_weight_and_bias_per_convolution() {
        let block = ConvBlock::new("b", 2, 4, (3, 3), 6, SeedSource::new(0)).unwrap();
        let mut names = Vec::new();
        block
            .visit_parameters(&mut |param| {
                names.push(param.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "b.conv0::weight");
        assert_eq!(names[11], "b.conv5::bias");
        // first conv 2→4, five more 4→4, all 3×3
        let expected = (4 * 2 * 9 + 4) + 5 * (4 * 4 * 9 + 4);
        assert_eq!(block.parameter_count().unwrap(), expected);
    }

    #[test]
    fn final_convolution_is_not_rectified() {
        let block = ConvBlock::new("neg", 2, 3, (4, 4), 2, SeedSource::new(17)).unwrap();
        let out = block.forward_map(&ramp(3, 2, (4, 4))).unwrap();
        assert!(out.tensor().data().iter().any(|value| *value < 0.0));
    }

    #[test]
    fn geometry_mismatch_is_rejected() {
        let block = ConvBlock::new("g", 3, 3, (4, 4), 1, SeedSource::new(0)).unwrap();
        assert!(matches!(
            block.forward_map(&ramp(1, 2, (4, 4))),
            Err(TensorError::ChannelMismatch { .. })
        ));
        assert!(matches!(
            block.forward_map(&ramp(1, 3, (5, 4))),
            Err(TensorError::SpatialMismatch { .. })
        ));
        assert!(ConvBlock::new("z", 3, 3, (4, 4), 0, SeedSource::new(0)).is_err());
    }

    #[test]
    fn identical_seeds_build_identical_blocks() {
        let a = ConvBlock::new("s", 1, 2, (2, 2), 3, SeedSource::new(5)).unwrap();
        let b = ConvBlock::new("s", 1, 2, (2, 2), 3, SeedSource::new(5)).unwrap();
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    }
}
