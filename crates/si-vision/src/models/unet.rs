// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::block::DEFAULT_BLOCK_DEPTH;
use super::decoder::Decoder;
use super::encoder::Encoder;
use serde::{Deserialize, Serialize};
use si_config::SeedSource;
use si_nn::module::{Module, Parameter};
use si_nn::Conv2d;
use si_tensor::{FeatureMap, PureResult, Tensor, TensorError};

/// Layout of a [`UNet`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Encoder channel schedule; `enc_chs[0]` is the channel count fed in.
    pub enc_chs: Vec<usize>,
    /// Decoder channel schedule; `dec_chs[0]` must match the coarsest level.
    pub dec_chs: Vec<usize>,
    /// Channels produced by the head.
    pub num_classes: usize,
    /// Spatial extent of the encoder input.
    pub in_sz: (usize, usize),
    /// Convolutions per block.
    pub block_depth: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            enc_chs: vec![6, 64, 128, 256, 512],
            dec_chs: vec![512, 256, 128, 64],
            num_classes: 3,
            in_sz: (32, 32),
            block_depth: DEFAULT_BLOCK_DEPTH,
        }
    }
}

impl UNetConfig {
    pub fn with_channels(mut self, enc_chs: Vec<usize>, dec_chs: Vec<usize>) -> Self {
        self.enc_chs = enc_chs;
        self.dec_chs = dec_chs;
        self
    }

    pub fn with_block_depth(mut self, block_depth: usize) -> Self {
        self.block_depth = block_depth;
        self
    }

    pub fn with_input_size(mut self, in_sz: (usize, usize)) -> Self {
        self.in_sz = in_sz;
        self
    }

    /// Channels the encoder expects on its input.
    pub fn input_channels(&self) -> usize {
        self.enc_chs.first().copied().unwrap_or(0)
    }
}

/// 1×1 projection from decoder features to output channels.
#[derive(Debug)]
pub struct ReconstructionHead {
    conv: Conv2d,
}

impl ReconstructionHead {
    pub fn new(
        in_channels: usize,
        num_classes: usize,
        hw: (usize, usize),
        seeds: SeedSource,
    ) -> PureResult<Self> {
        let conv = Conv2d::pointwise("head", in_channels, num_classes, hw, Some(seeds.seed_for("head")))?;
        Ok(Self { conv })
    }

    pub fn output_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn forward_map(&self, input: &FeatureMap) -> PureResult<FeatureMap> {
        input.expect_geometry(self.conv.in_channels(), self.conv.input_hw())?;
        FeatureMap::new(
            self.conv.forward(input.tensor())?,
            self.conv.out_channels(),
            input.hw(),
        )
    }

    pub fn backward_map(
        &mut self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> PureResult<FeatureMap> {
        grad_output.expect_geometry(self.conv.out_channels(), input.hw())?;
        let grad = self.conv.backward(input.tensor(), grad_output.tensor())?;
        input.with_tensor(grad)
    }
}

/// Encoder/decoder with skip connections and a 1×1 reconstruction head.
///
/// The output has `num_classes` channels at the decoder's final extent,
/// which equals the finest pyramid level when the decoder consumes every
/// skip and the input extent is divisible by `2^(stages-1)`.
#[derive(Debug)]
pub struct UNet {
    config: UNetConfig,
    encoder: Encoder,
    decoder: Decoder,
    head: ReconstructionHead,
}

impl UNet {
    pub fn new(config: UNetConfig, seeds: SeedSource) -> PureResult<Self> {
        if config.num_classes == 0 {
            return Err(TensorError::InvalidValue {
                label: "unet_num_classes",
            });
        }
        let encoder = Encoder::new(&config.enc_chs, config.in_sz, config.block_depth, seeds)?;
        let mut geometry = encoder.pyramid_geometry();
        let Some((coarsest_channels, coarsest_hw)) = geometry.pop() else {
            return Err(TensorError::EmptyInput("unet_encoder"));
        };
        if config.dec_chs.first() != Some(&coarsest_channels) {
            return Err(TensorError::ChannelMismatch {
                expected: coarsest_channels,
                got: config.dec_chs.first().copied().unwrap_or(0),
            });
        }
        geometry.reverse();
        let decoder = Decoder::new(
            &config.dec_chs,
            coarsest_hw,
            &geometry,
            config.block_depth,
            seeds,
        )?;
        let head = ReconstructionHead::new(
            decoder.output_channels(),
            config.num_classes,
            decoder.output_hw(),
            seeds,
        )?;
        Ok(Self {
            config,
            encoder,
            decoder,
            head,
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Spatial extent of the head output.
    pub fn output_hw(&self) -> (usize, usize) {
        self.decoder.output_hw()
    }

    /// Splits a pyramid into its coarsest level and the skips, coarsest first.
    fn unwind(mut pyramid: Vec<FeatureMap>) -> PureResult<(FeatureMap, Vec<FeatureMap>)> {
        let coarsest = pyramid
            .pop()
            .ok_or(TensorError::EmptyInput("unet_pyramid"))?;
        pyramid.reverse();
        Ok((coarsest, pyramid))
    }

    pub fn forward_map(&self, input: &FeatureMap) -> PureResult<FeatureMap> {
        let (coarsest, skips) = Self::unwind(self.encoder.forward(input)?)?;
        let decoded = self.decoder.forward(&coarsest, &skips)?;
        self.head.forward_map(&decoded)
    }

    pub fn backward_map(
        &mut self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> PureResult<FeatureMap> {
        let (coarsest, skips) = Self::unwind(self.encoder.forward(input)?)?;
        let decoded = self.decoder.forward(&coarsest, &skips)?;
        let grad_decoded = self.head.backward_map(&decoded, grad_output)?;
        let (grad_coarsest, grad_skips) = self.decoder.backward(&coarsest, &skips, &grad_decoded)?;

        // Re-assemble finest-first; skips the decoder never consumed get zeros.
        let levels = skips.len() + 1;
        let mut grad_pyramid = Vec::with_capacity(levels);
        for level in 0..levels - 1 {
            let skip_index = levels - 2 - level;
            let grad = match grad_skips.get(skip_index) {
                Some(grad) => grad.clone(),
                None => {
                    let skip = &skips[skip_index];
                    FeatureMap::zeros(skip.batch(), skip.channels(), skip.hw())?
                }
            };
            grad_pyramid.push(grad);
        }
        grad_pyramid.push(grad_coarsest);
        self.encoder.backward(input, &grad_pyramid)
    }

    fn wrap_input(&self, input: &Tensor) -> PureResult<FeatureMap> {
        FeatureMap::new(input.clone(), self.config.input_channels(), self.config.in_sz)
    }
}

impl Module for UNet {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(self.forward_map(&self.wrap_input(input)?)?.into_tensor())
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let input = self.wrap_input(input)?;
        let grad_output = FeatureMap::new(
            grad_output.clone(),
            self.config.num_classes,
            self.output_hw(),
        )?;
        Ok(self.backward_map(&input, &grad_output)?.into_tensor())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters(visitor)?;
        self.decoder.visit_parameters(visitor)?;
        self.head.conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        self.decoder.visit_parameters_mut(visitor)?;
        self.head.conv.visit_parameters_mut(visitor)
    }
}
