// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Components that transform inputs ahead of the trainable network but are
//! never updated.
//!
//! A [`FrozenModule`] only exposes `&self` forward passes and read-only
//! parameter visits, so nothing can route an optimiser to its weights. Weights
//! come either from a seeded initialisation or from a state-dict file read at
//! construction time.

use crate::error::AttackResult;
use si_config::SeedSource;
use si_nn::io::load_state_dict;
use si_nn::module::{Module, Parameter};
use si_nn::Conv2d;
use si_tensor::resample::{resize, Interpolation};
use si_tensor::{FeatureMap, PureResult, Tensor};
use std::fmt;
use std::path::Path;

/// Spatial extent GAN features are upsampled to before entering the encoder.
pub const GAN_FEATURE_HW: (usize, usize) = (32, 32);

pub trait FrozenModule: fmt::Debug + Send + Sync {
    fn forward(&self, input: &FeatureMap) -> AttackResult<FeatureMap>;

    fn input_channels(&self) -> usize;

    fn output_channels(&self) -> usize;

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;
}

/// Same-padded convolution lifting image channels to the encoder's input
/// channel count without changing the spatial extent.
#[derive(Debug)]
pub struct ChannelRemap {
    conv: Conv2d,
}

impl ChannelRemap {
    pub const NAME: &'static str = "remap";

    /// `kernel` must be odd so that `kernel / 2` padding keeps the extent.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        hw: (usize, usize),
        kernel: usize,
        seeds: SeedSource,
    ) -> AttackResult<Self> {
        if kernel % 2 == 0 {
            return Err(crate::AttackError::config(format!(
                "channel remap kernel must be odd, got {kernel}"
            )));
        }
        let conv = Conv2d::new(
            Self::NAME,
            in_channels,
            out_channels,
            (kernel, kernel),
            (1, 1),
            (kernel / 2, kernel / 2),
            hw,
            Some(seeds.seed_for(Self::NAME)),
        )?;
        Ok(Self { conv })
    }

    /// Builds the remap and overwrites its weights from `path` (JSON or bincode
    /// by extension). Keys are `remap::weight` and `remap::bias`.
    pub fn from_state_file(
        in_channels: usize,
        out_channels: usize,
        hw: (usize, usize),
        kernel: usize,
        path: &Path,
    ) -> AttackResult<Self> {
        let mut remap = Self::new(in_channels, out_channels, hw, kernel, SeedSource::default())?;
        remap.conv.load_state_dict(&load_state_dict(path)?)?;
        tracing::info!(path = %path.display(), "loaded channel remap weights");
        Ok(remap)
    }

    pub fn hw(&self) -> (usize, usize) {
        self.conv.input_hw()
    }
}

impl FrozenModule for ChannelRemap {
    fn forward(&self, input: &FeatureMap) -> AttackResult<FeatureMap> {
        input.expect_geometry(self.conv.in_channels(), self.conv.input_hw())?;
        Ok(FeatureMap::new(
            self.conv.forward(input.tensor())?,
            self.conv.out_channels(),
            input.hw(),
        )?)
    }

    fn input_channels(&self) -> usize {
        self.conv.in_channels()
    }

    fn output_channels(&self) -> usize {
        self.conv.out_channels()
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)
    }
}

/// 1×1 transposed convolution followed by a nearest upsample to `target_hw`.
///
/// A 1×1, stride-1 transposed convolution is a per-pixel linear map, so the
/// layer works at any input extent. The weight is stored `(in, out)` like
/// every transposed convolution in `si-nn`.
#[derive(Debug)]
pub struct FeatureReduction {
    weight: Parameter,
    bias: Parameter,
    target_hw: (usize, usize),
}

impl FeatureReduction {
    pub const NAME: &'static str = "reduction";

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        target_hw: (usize, usize),
        seeds: SeedSource,
    ) -> AttackResult<Self> {
        // transposed-conv fan-in counts output channels
        let bound = 1.0 / (out_channels.max(1) as f32).sqrt();
        let seed = seeds.seed_for(Self::NAME);
        let weight = Tensor::random_uniform(in_channels, out_channels, -bound, bound, Some(seed))?;
        let bias = Tensor::random_uniform(1, out_channels, -bound, bound, Some(seed.wrapping_add(1)))?;
        Ok(Self {
            weight: Parameter::new(format!("{}::weight", Self::NAME), weight),
            bias: Parameter::new(format!("{}::bias", Self::NAME), bias),
            target_hw,
        })
    }

    /// Builds the reduction and overwrites its weights from `path`.
    pub fn from_state_file(
        in_channels: usize,
        out_channels: usize,
        target_hw: (usize, usize),
        path: &Path,
    ) -> AttackResult<Self> {
        let mut reduction = Self::new(in_channels, out_channels, target_hw, SeedSource::default())?;
        let state = load_state_dict(path)?;
        for param in [&mut reduction.weight, &mut reduction.bias] {
            let Some(value) = state.get(param.name()) else {
                return Err(si_tensor::TensorError::MissingParameter {
                    name: param.name().to_string(),
                }
                .into());
            };
            param.load_value(value)?;
        }
        Ok(reduction)
    }

    pub fn target_hw(&self) -> (usize, usize) {
        self.target_hw
    }

    fn project(&self, input: &FeatureMap) -> AttackResult<FeatureMap> {
        let (in_channels, out_channels) = self.weight.value().shape();
        if input.channels() != in_channels {
            return Err(si_tensor::TensorError::ChannelMismatch {
                expected: in_channels,
                got: input.channels(),
            }
            .into());
        }
        let plane = input.plane_len();
        let weight = self.weight.value().data();
        let bias = self.bias.value().data();
        let mut data = Vec::with_capacity(input.batch() * out_channels * plane);
        for b in 0..input.batch() {
            let row = input.tensor().row(b);
            for oc in 0..out_channels {
                let mut out = vec![bias[oc]; plane];
                for ic in 0..in_channels {
                    let w = weight[ic * out_channels + oc];
                    let src = &row[ic * plane..(ic + 1) * plane];
                    for (dst, value) in out.iter_mut().zip(src) {
                        *dst += w * value;
                    }
                }
                data.extend_from_slice(&out);
            }
        }
        Ok(FeatureMap::new(
            Tensor::from_vec(input.batch(), out_channels * plane, data)?,
            out_channels,
            input.hw(),
        )?)
    }
}

impl FrozenModule for FeatureReduction {
    fn forward(&self, input: &FeatureMap) -> AttackResult<FeatureMap> {
        let projected = self.project(input)?;
        Ok(resize(&projected, self.target_hw, Interpolation::Nearest)?)
    }

    fn input_channels(&self) -> usize {
        self.weight.value().shape().0
    }

    fn output_channels(&self) -> usize {
        self.weight.value().shape().1
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }
}
