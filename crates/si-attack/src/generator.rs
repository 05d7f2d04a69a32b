// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Upstream feature generators whose encoded output the attacker inverts.

use crate::error::{AttackError, AttackResult};
use si_config::SeedSource;
use si_nn::io::load_state_dict;
use si_nn::module::Module;
use si_nn::Conv2d;
use si_tensor::{FeatureMap, Tensor};
use std::fmt;
use std::path::Path;

/// Ordered outputs of one generator call. Position 1 holds the encoded
/// feature; the other positions are generator specific.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorOutputs(Vec<FeatureMap>);

impl GeneratorOutputs {
    pub const ENCODED_INDEX: usize = 1;

    pub fn new(outputs: Vec<FeatureMap>) -> Self {
        Self(outputs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FeatureMap> {
        self.0.get(index)
    }

    pub fn encoded(&self) -> AttackResult<&FeatureMap> {
        self.0
            .get(Self::ENCODED_INDEX)
            .ok_or(AttackError::GeneratorArity { got: self.0.len() })
    }

    pub fn into_encoded(mut self) -> AttackResult<FeatureMap> {
        if self.0.len() <= Self::ENCODED_INDEX {
            return Err(AttackError::GeneratorArity { got: self.0.len() });
        }
        Ok(self.0.swap_remove(Self::ENCODED_INDEX))
    }
}

/// Frozen upstream model mapping images to encoded features.
pub trait FeatureGenerator: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Channels of the encoded feature at [`GeneratorOutputs::ENCODED_INDEX`].
    fn encoded_channels(&self) -> usize;

    fn generate(&self, images: &FeatureMap) -> AttackResult<GeneratorOutputs>;
}

/// Stand-in for a complex-valued feature encoder.
///
/// A 3×3 stride-2 convolution produces `2·k` channels read as `k` complex
/// planes (real parts first). Each sample's planes are then rotated by a
/// phase drawn from the generator seed and the sample's batch position.
/// Outputs are `[features, encoded, phases]`, where `phases` is a `1×1×1`
/// map per sample.
#[derive(Debug)]
pub struct StridedConvGenerator {
    conv: Conv2d,
    seeds: SeedSource,
}

impl StridedConvGenerator {
    pub const NAME: &'static str = "strided-conv";
    pub const ENCODED_CHANNELS: usize = 6;

    pub fn new(in_channels: usize, image_hw: (usize, usize), seeds: SeedSource) -> AttackResult<Self> {
        let conv = Conv2d::new(
            "generator.encoder",
            in_channels,
            Self::ENCODED_CHANNELS,
            (3, 3),
            (2, 2),
            (1, 1),
            image_hw,
            Some(seeds.seed_for("generator.encoder")),
        )?;
        Ok(Self { conv, seeds })
    }

    /// Loads `generator.encoder::weight`/`::bias` from a state-dict file.
    pub fn from_state_file(
        in_channels: usize,
        image_hw: (usize, usize),
        seeds: SeedSource,
        path: &Path,
    ) -> AttackResult<Self> {
        let mut generator = Self::new(in_channels, image_hw, seeds)?;
        generator.conv.load_state_dict(&load_state_dict(path)?)?;
        tracing::info!(path = %path.display(), "loaded generator weights");
        Ok(generator)
    }

    pub fn output_hw(&self) -> AttackResult<(usize, usize)> {
        Ok(self.conv.output_hw()?)
    }

    fn phase(&self, sample: usize) -> f32 {
        let bits = self.seeds.seed_for(&("phase", sample));
        (bits >> 40) as f32 / (1u64 << 24) as f32 * std::f32::consts::TAU
    }
}

impl FeatureGenerator for StridedConvGenerator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn encoded_channels(&self) -> usize {
        Self::ENCODED_CHANNELS
    }

    fn generate(&self, images: &FeatureMap) -> AttackResult<GeneratorOutputs> {
        images.expect_geometry(self.conv.in_channels(), self.conv.input_hw())?;
        let hw = self.conv.output_hw()?;
        let features = FeatureMap::new(self.conv.forward(images.tensor())?, Self::ENCODED_CHANNELS, hw)?;
        let pairs = Self::ENCODED_CHANNELS / 2;
        let plane = features.plane_len();
        let mut rotated = features.tensor().clone();
        let mut phases = Vec::with_capacity(features.batch());
        for (b, row) in rotated.data_mut().chunks_mut(Self::ENCODED_CHANNELS * plane).enumerate() {
            let theta = self.phase(b);
            let (sin, cos) = theta.sin_cos();
            let (real, imag) = row.split_at_mut(pairs * plane);
            for (re, im) in real.iter_mut().zip(imag.iter_mut()) {
                let (a, c) = (*re, *im);
                *re = a * cos - c * sin;
                *im = a * sin + c * cos;
            }
            phases.push(theta);
        }
        let encoded = features.with_tensor(rotated)?;
        let phases = FeatureMap::new(Tensor::from_vec(features.batch(), 1, phases)?, 1, (1, 1))?;
        Ok(GeneratorOutputs::new(vec![features, encoded, phases]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(batch: usize) -> FeatureMap {
        FeatureMap::from_fn(batch, 3, (32, 32), |b, c, y, x| {
            ((b * 3 + c + y * x) % 17) as f32 / 8.5 - 1.0
        })
        .unwrap()
    }

    #[test]
    fn strided_generator_halves_extent_into_six_channels() {
        let generator = StridedConvGenerator::new(3, (32, 32), SeedSource::new(0)).unwrap();
        let outputs = generator.generate(&images(2)).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs.encoded().unwrap().dims(), [2, 6, 16, 16]);
        assert_eq!(outputs.get(2).unwrap().dims(), [2, 1, 1, 1]);
    }

    #[test]
    fn rotation_preserves_complex_magnitude() {
        let generator = StridedConvGenerator::new(3, (32, 32), SeedSource::new(7)).unwrap();
        let outputs = generator.generate(&images(3)).unwrap();
        let features = outputs.get(0).unwrap();
        let encoded = outputs.encoded().unwrap();
        for b in 0..3 {
            for c in 0..3 {
                for (y, x) in [(0, 0), (5, 9), (15, 15)] {
                    let before = features.at(b, c, y, x).hypot(features.at(b, c + 3, y, x));
                    let after = encoded.at(b, c, y, x).hypot(encoded.at(b, c + 3, y, x));
                    approx::assert_abs_diff_eq!(before, after, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let generator = StridedConvGenerator::new(3, (32, 32), SeedSource::new(3)).unwrap();
        let input = images(2);
        assert_eq!(generator.generate(&input).unwrap(), generator.generate(&input).unwrap());
    }

    #[test]
    fn single_output_has_no_encoded_feature() {
        let outputs = GeneratorOutputs::new(vec![images(1)]);
        let err = outputs.encoded().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert!(outputs.into_encoded().is_err());
    }
}
