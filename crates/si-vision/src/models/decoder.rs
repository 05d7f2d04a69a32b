// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::block::ConvBlock;
use super::Geometry;
use si_config::SeedSource;
use si_nn::module::{Module, Parameter};
use si_nn::ConvTranspose2d;
use si_tensor::{FeatureMap, PureResult, TensorError};

/// One expanding stage: upsample, crop the skip, concatenate, convolve.
#[derive(Debug)]
struct DecoderStage {
    upconv: ConvTranspose2d,
    block: ConvBlock,
    up_channels: usize,
    input_hw: (usize, usize),
    up_hw: (usize, usize),
}

impl DecoderStage {
    fn upsample(&self, x: &FeatureMap) -> PureResult<FeatureMap> {
        FeatureMap::new(
            self.upconv.forward(x.tensor())?,
            self.up_channels,
            self.up_hw,
        )
    }

    fn merge(&self, x: &FeatureMap, skip: &FeatureMap) -> PureResult<FeatureMap> {
        let up = self.upsample(x)?;
        up.concat_channels(&skip.center_crop(self.up_hw)?)
    }
}

/// Expanding half of the U-Net.
///
/// A schedule `d_0 … d_m` yields `m` stages. Stage `i` doubles the spatial
/// extent with a stride-2 transposed convolution `d_i → d_{i+1}`, centre-crops
/// the `i`-th skip (coarsest first) to the upsampled extent, concatenates
/// `[upsampled, skip]` and runs a [`ConvBlock`] `d_i → d_{i+1}`. Skips are
/// never padded: one smaller than the upsampled map is rejected at
/// construction.
#[derive(Debug)]
pub struct Decoder {
    stages: Vec<DecoderStage>,
    channels: Vec<usize>,
    input_hw: (usize, usize),
}

impl Decoder {
    /// `skips` lists the geometry of the skip each stage consumes, coarsest
    /// first. Extra entries beyond the stage count are ignored.
    pub fn new(
        channels: &[usize],
        input_hw: (usize, usize),
        skips: &[Geometry],
        block_depth: usize,
        seeds: SeedSource,
    ) -> PureResult<Self> {
        if channels.len() < 2 {
            return Err(TensorError::InvalidValue {
                label: "decoder_channel_schedule",
            });
        }
        let count = channels.len() - 1;
        if skips.len() < count {
            return Err(TensorError::DataLength {
                expected: count,
                got: skips.len(),
            });
        }
        let mut stages = Vec::with_capacity(count);
        let mut hw = input_hw;
        for (idx, &(skip_channels, skip_hw)) in skips.iter().take(count).enumerate() {
            let (d_in, d_out) = (channels[idx], channels[idx + 1]);
            let upconv_name = format!("decoder.upconv{idx}");
            let seed = seeds.seed_for(&upconv_name);
            let upconv = ConvTranspose2d::upsample_2x(upconv_name, d_in, d_out, hw, Some(seed))?;
            let up_hw = upconv.output_hw()?;
            if skip_hw.0 < up_hw.0 || skip_hw.1 < up_hw.1 {
                return Err(TensorError::CropExceedsSource {
                    source_hw: skip_hw,
                    target_hw: up_hw,
                });
            }
            if d_out + skip_channels != d_in {
                return Err(TensorError::ChannelMismatch {
                    expected: d_in,
                    got: d_out + skip_channels,
                });
            }
            let block = ConvBlock::new(
                &format!("decoder.block{idx}"),
                d_in,
                d_out,
                up_hw,
                block_depth,
                seeds,
            )?;
            stages.push(DecoderStage {
                upconv,
                block,
                up_channels: d_out,
                input_hw: hw,
                up_hw,
            });
            hw = up_hw;
        }
        Ok(Self {
            stages,
            channels: channels.to_vec(),
            input_hw,
        })
    }

    pub fn stages(&self) -> usize {
        self.stages.len()
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    pub fn output_channels(&self) -> usize {
        self.channels[self.channels.len() - 1]
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.stages
            .last()
            .map(|stage| stage.up_hw)
            .unwrap_or(self.input_hw)
    }

    fn check_inputs(&self, x: &FeatureMap, skips: &[FeatureMap]) -> PureResult<()> {
        x.expect_geometry(self.channels[0], self.input_hw)?;
        if skips.len() < self.stages.len() {
            return Err(TensorError::DataLength {
                expected: self.stages.len(),
                got: skips.len(),
            });
        }
        Ok(())
    }

    /// Decodes `x` (the coarsest pyramid level) using `skips`, coarsest first.
    pub fn forward(&self, x: &FeatureMap, skips: &[FeatureMap]) -> PureResult<FeatureMap> {
        self.check_inputs(x, skips)?;
        let mut current = x.clone();
        for (stage, skip) in self.stages.iter().zip(skips) {
            current = stage.block.forward_map(&stage.merge(&current, skip)?)?;
        }
        Ok(current)
    }

    /// Returns the gradient with respect to `x` and one gradient per consumed
    /// skip, in the order the skips were given.
    pub fn backward(
        &mut self,
        x: &FeatureMap,
        skips: &[FeatureMap],
        grad_output: &FeatureMap,
    ) -> PureResult<(FeatureMap, Vec<FeatureMap>)> {
        self.check_inputs(x, skips)?;
        let mut stage_inputs = Vec::with_capacity(self.stages.len());
        let mut merged = Vec::with_capacity(self.stages.len());
        let mut current = x.clone();
        for (stage, skip) in self.stages.iter().zip(skips) {
            let cat = stage.merge(&current, skip)?;
            let next = stage.block.forward_map(&cat)?;
            stage_inputs.push(current);
            merged.push(cat);
            current = next;
        }

        let mut grad = grad_output.clone();
        let mut skip_grads = Vec::with_capacity(self.stages.len());
        for (idx, stage) in self.stages.iter_mut().enumerate().rev() {
            let grad_cat = stage.block.backward_map(&merged[idx], &grad)?;
            let (grad_up, grad_skip) = grad_cat.split_channels(stage.up_channels)?;
            skip_grads.push(grad_skip.uncrop(skips[idx].hw())?);
            let grad_x = stage
                .upconv
                .backward(stage_inputs[idx].tensor(), grad_up.tensor())?;
            grad = FeatureMap::new(grad_x, stage_inputs[idx].channels(), stage.input_hw)?;
        }
        skip_grads.reverse();
        Ok((grad, skip_grads))
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &self.stages {
            stage.upconv.visit_parameters(visitor)?;
            stage.block.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.upconv.visit_parameters_mut(visitor)?;
            stage.block.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(batch: usize, channels: usize, hw: (usize, usize), seed: usize) -> FeatureMap {
        FeatureMap::from_fn(batch, channels, hw, |b, c, y, x| {
            (((seed + b * 13 + c * 7 + y * 3 + x) % 9) as f32 / 4.5) - 1.0
        })
        .unwrap()
    }

    #[test]
    fn decoder_restores_finest_extent() {
        let skips = [(8, (8, 8)), (4, (16, 16))];
        let decoder = Decoder::new(&[16, 8, 4], (4, 4), &skips, 1, SeedSource::new(2)).unwrap();
        let x = filled(2, 16, (4, 4), 0);
        let skip_maps = vec![filled(2, 8, (8, 8), 1), filled(2, 4, (16, 16), 2)];
        let out = decoder.forward(&x, &skip_maps).unwrap();
        assert_eq!(out.dims(), [2, 4, 16, 16]);
        assert_eq!(decoder.output_hw(), (16, 16));
    }

    #[test]
    fn larger_skips_are_centre_cropped() {
        let skips = [(2, (5, 6))];
        let decoder = Decoder::new(&[4, 2], (2, 2), &skips, 1, SeedSource::new(4)).unwrap();
        let x = filled(1, 4, (2, 2), 3);
        let out = decoder.forward(&x, &[filled(1, 2, (5, 6), 5)]).unwrap();
        assert_eq!(out.dims(), [1, 2, 4, 4]);
    }

    #[test]
    fn skips_smaller_than_upsampled_map_are_rejected() {
        let skips = [(2, (3, 4))];
        let err = Decoder::new(&[4, 2], (2, 2), &skips, 1, SeedSource::new(0)).unwrap_err();
        assert_eq!(
            err,
            TensorError::CropExceedsSource {
                source_hw: (3, 4),
                target_hw: (4, 4),
            }
        );
    }

    #[test]
    fn incompatible_schedule_is_rejected() {
        let skips = [(3, (4, 4))];
        assert!(matches!(
            Decoder::new(&[4, 2], (2, 2), &skips, 1, SeedSource::new(0)),
            Err(TensorError::ChannelMismatch { expected: 4, got: 5 })
        ));
        assert!(Decoder::new(&[4, 2, 1], (2, 2), &[(2, (4, 4))], 1, SeedSource::new(0)).is_err());
    }

    #[test]
    fn backward_returns_gradients_for_input_and_skips() {
        let skips = [(2, (6, 6))];
        let mut decoder = Decoder::new(&[4, 2], (2, 2), &skips, 2, SeedSource::new(6)).unwrap();
        let x = filled(2, 4, (2, 2), 1);
        let skip_maps = vec![filled(2, 2, (6, 6), 2)];
        let out = decoder.forward(&x, &skip_maps).unwrap();
        let grad_out = out.with_tensor(out.tensor().scale(0.1).unwrap()).unwrap();
        let (grad_x, grad_skips) = decoder.backward(&x, &skip_maps, &grad_out).unwrap();
        assert_eq!(grad_x.dims(), x.dims());
        assert_eq!(grad_skips.len(), 1);
        assert_eq!(grad_skips[0].dims(), [2, 2, 6, 6]);
        // the one-pixel border outside the crop window receives no gradient
        for b in 0..2 {
            for c in 0..2 {
                for i in 0..6 {
                    assert_eq!(grad_skips[0].at(b, c, 0, i), 0.0);
                    assert_eq!(grad_skips[0].at(b, c, i, 5), 0.0);
                }
            }
        }
    }
}
