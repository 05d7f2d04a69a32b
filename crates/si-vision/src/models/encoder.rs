// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::block::ConvBlock;
use super::Geometry;
use si_config::SeedSource;
use si_nn::module::{Module, Parameter};
use si_nn::MaxPool2d;
use si_tensor::{FeatureMap, PureResult, TensorError};

/// Contracting half of the U-Net.
///
/// A channel schedule `c_0 … c_n` yields `n` stages. Stage `i` runs a
/// [`ConvBlock`] `c_i → c_{i+1}`, records its output in the pyramid and, when
/// another stage follows, halves the spatial extent with a 2×2 max pool.
#[derive(Debug)]
pub struct Encoder {
    blocks: Vec<ConvBlock>,
    pools: Vec<MaxPool2d>,
    channels: Vec<usize>,
    input_hw: (usize, usize),
}

impl Encoder {
    pub fn new(
        channels: &[usize],
        input_hw: (usize, usize),
        block_depth: usize,
        seeds: SeedSource,
    ) -> PureResult<Self> {
        if channels.len() < 2 {
            return Err(TensorError::InvalidValue {
                label: "encoder_channel_schedule",
            });
        }
        let stages = channels.len() - 1;
        let mut blocks = Vec::with_capacity(stages);
        let mut pools = Vec::with_capacity(stages - 1);
        let mut hw = input_hw;
        for stage in 0..stages {
            blocks.push(ConvBlock::new(
                &format!("encoder.block{stage}"),
                channels[stage],
                channels[stage + 1],
                hw,
                block_depth,
                seeds,
            )?);
            if stage + 1 < stages {
                // MaxPool2d rejects extents below its window, so a stage that
                // would shrink under 2×2 fails here rather than at run time.
                let pool = MaxPool2d::halving(channels[stage + 1], hw)?;
                hw = pool.output_hw()?;
                pools.push(pool);
            }
        }
        Ok(Self {
            blocks,
            pools,
            channels: channels.to_vec(),
            input_hw,
        })
    }

    pub fn stages(&self) -> usize {
        self.blocks.len()
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Geometry of every pyramid level, finest first.
    pub fn pyramid_geometry(&self) -> Vec<Geometry> {
        self.blocks
            .iter()
            .map(|block| (block.out_channels(), block.hw()))
            .collect()
    }

    /// Returns the feature pyramid, finest first.
    pub fn forward(&self, input: &FeatureMap) -> PureResult<Vec<FeatureMap>> {
        Ok(self.run(input)?.1)
    }

    /// Runs every stage and returns `(stage inputs, stage outputs)`.
    fn run(&self, input: &FeatureMap) -> PureResult<(Vec<FeatureMap>, Vec<FeatureMap>)> {
        input.expect_geometry(self.channels[0], self.input_hw)?;
        let mut inputs = Vec::with_capacity(self.blocks.len());
        let mut outputs = Vec::with_capacity(self.blocks.len());
        let mut current = input.clone();
        for (stage, block) in self.blocks.iter().enumerate() {
            let out = block.forward_map(&current)?;
            inputs.push(current);
            current = match self.pools.get(stage) {
                Some(pool) => FeatureMap::new(
                    pool.forward(out.tensor())?,
                    out.channels(),
                    pool.output_hw()?,
                )?,
                None => out.clone(),
            };
            outputs.push(out);
        }
        Ok((inputs, outputs))
    }

    /// Backpropagates one gradient per pyramid level (finest first) and returns
    /// the gradient with respect to `input`.
    pub fn backward(
        &mut self,
        input: &FeatureMap,
        grad_pyramid: &[FeatureMap],
    ) -> PureResult<FeatureMap> {
        if grad_pyramid.len() != self.blocks.len() {
            return Err(TensorError::DataLength {
                expected: self.blocks.len(),
                got: grad_pyramid.len(),
            });
        }
        let (inputs, outputs) = self.run(input)?;
        let mut carried: Option<FeatureMap> = None;
        for stage in (0..self.blocks.len()).rev() {
            let mut grad = grad_pyramid[stage].clone();
            if let Some(next) = carried.take() {
                let pool = &mut self.pools[stage];
                let through_pool = pool.backward(outputs[stage].tensor(), next.tensor())?;
                grad = grad.add(&outputs[stage].with_tensor(through_pool)?)?;
            }
            carried = Some(self.blocks[stage].backward_map(&inputs[stage], &grad)?);
        }
        carried.ok_or(TensorError::EmptyInput("encoder_backward"))
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use si_nn::loss::{Loss, MeanSquaredError};

    fn image(batch: usize, channels: usize, hw: (usize, usize)) -> FeatureMap {
        FeatureMap::from_fn(batch, channels, hw, |b, c, y, x| {
            (((b * 31 + c * 17 + y * 5 + x * 3) % 11) as f32 / 5.5) - 1.0
        })
        .unwrap()
    }

    #[test]
    fn pyramid_follows_channel_schedule_and_halves_extent() {
        let encoder = Encoder::new(&[3, 4, 8, 16], (32, 32), 2, SeedSource::new(3)).unwrap();
        let pyramid = encoder.forward(&image(2, 3, (32, 32))).unwrap();
        let dims: Vec<_> = pyramid.iter().map(FeatureMap::dims).collect();
        assert_eq!(
            dims,
            vec![[2, 4, 32, 32], [2, 8, 16, 16], [2, 16, 8, 8]]
        );
        assert_eq!(
            encoder.pyramid_geometry(),
            vec![(4, (32, 32)), (8, (16, 16)), (16, (8, 8))]
        );
    }

    #[test]
    fn odd_extents_floor_when_pooled() {
        let encoder = Encoder::new(&[1, 2, 2], (7, 5), 1, SeedSource::new(0)).unwrap();
        assert_eq!(
            encoder.pyramid_geometry(),
            vec![(2, (7, 5)), (2, (3, 2))]
        );
    }

    #[test]
    fn stage_below_pool_window_is_a_construction_error() {
        assert!(Encoder::new(&[1, 2, 2, 2], (2, 2), 1, SeedSource::new(0)).is_err());
        assert!(Encoder::new(&[1], (4, 4), 1, SeedSource::new(0)).is_err());
    }

    #[test]
    fn wrong_input_channels_are_rejected() {
        let encoder = Encoder::new(&[6, 4], (4, 4), 1, SeedSource::new(0)).unwrap();
        assert!(matches!(
            encoder.forward(&image(1, 3, (4, 4))),
            Err(TensorError::ChannelMismatch { expected: 6, got: 3 })
        ));
    }

    #[test]
    fn backward_populates_every_block_gradient() {
        let mut encoder = Encoder::new(&[2, 3, 4], (4, 4), 2, SeedSource::new(8)).unwrap();
        let input = image(2, 2, (4, 4));
        let pyramid = encoder.forward(&input).unwrap();
        let mut loss = MeanSquaredError::new();
        let grads: Vec<FeatureMap> = pyramid
            .iter()
            .map(|level| {
                let target = FeatureMap::zeros(level.batch(), level.channels(), level.hw()).unwrap();
                let grad = loss.backward(level.tensor(), target.tensor()).unwrap();
                level.with_tensor(grad).unwrap()
            })
            .collect();
        let grad_input = encoder.backward(&input, &grads).unwrap();
        assert_eq!(grad_input.dims(), input.dims());
        encoder
            .visit_parameters(&mut |param| {
                assert!(param.gradient().is_some(), "{} has no gradient", param.name());
                Ok(())
            })
            .unwrap();
    }
}
