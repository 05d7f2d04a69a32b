// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{AttackError, AttackResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use si_tensor::Interpolation;
use si_vision::UNetConfig;
use std::path::Path;

/// Everything needed to rebuild an attacker, persisted next to its weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    pub lr: f32,
    /// Extent the reconstruction is resized to when `retain_dim` is set.
    pub out_sz: (usize, usize),
    pub num_classes: usize,
    pub enc_chs: Vec<usize>,
    pub dec_chs: Vec<usize>,
    /// Extent the encoder is built for.
    pub in_sz: (usize, usize),
    pub block_depth: usize,
    pub retain_dim: bool,
    pub interpolation: Interpolation,
    /// Anonymity level of the upstream encoder; recorded, not used by the attacker.
    pub k: usize,
    pub seed: u64,
}

impl HyperParameters {
    /// Keys a persisted document must contain; no defaults are filled in.
    pub const REQUIRED_KEYS: [&'static str; 11] = [
        "lr",
        "out_sz",
        "num_classes",
        "enc_chs",
        "dec_chs",
        "in_sz",
        "block_depth",
        "retain_dim",
        "interpolation",
        "k",
        "seed",
    ];

    pub fn unet_config(&self) -> UNetConfig {
        UNetConfig {
            enc_chs: self.enc_chs.clone(),
            dec_chs: self.dec_chs.clone(),
            num_classes: self.num_classes,
            in_sz: self.in_sz,
            block_depth: self.block_depth,
        }
    }

    pub fn with_unet(mut self, config: &UNetConfig) -> Self {
        self.enc_chs = config.enc_chs.clone();
        self.dec_chs = config.dec_chs.clone();
        self.num_classes = config.num_classes;
        self.in_sz = config.in_sz;
        self.block_depth = config.block_depth;
        self
    }

    pub fn validate(&self) -> AttackResult<()> {
        if !(self.lr > 0.0) || !self.lr.is_finite() {
            return Err(AttackError::config(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        if self.out_sz.0 == 0 || self.out_sz.1 == 0 {
            return Err(AttackError::config(format!(
                "out_sz must be non-empty, got {:?}",
                self.out_sz
            )));
        }
        if self.k == 0 {
            return Err(AttackError::config("k must be at least 1"));
        }
        Ok(())
    }

    /// Parses the `hparams` object of a checkpoint at `path`.
    pub fn from_value(value: &Value, path: &Path) -> AttackResult<Self> {
        let Some(map) = value.as_object() else {
            return Err(AttackError::resource(path, "hparams is not a JSON object"));
        };
        if let Some(key) = Self::REQUIRED_KEYS
            .iter()
            .find(|key| !map.contains_key(**key))
        {
            return Err(AttackError::MissingHyperParameter {
                key: key.to_string(),
                path: path.to_path_buf(),
            });
        }
        let hparams: HyperParameters = serde_json::from_value(value.clone())
            .map_err(|err| AttackError::resource(path, format!("malformed hparams: {err}")))?;
        hparams.validate()?;
        Ok(hparams)
    }
}

impl Default for HyperParameters {
    fn default() -> Self {
        let unet = UNetConfig::default();
        Self {
            lr: 3e-4,
            out_sz: (32, 32),
            num_classes: unet.num_classes,
            enc_chs: unet.enc_chs,
            dec_chs: unet.dec_chs,
            in_sz: unet.in_sz,
            block_depth: unet.block_depth,
            retain_dim: true,
            interpolation: Interpolation::default(),
            k: 2,
            seed: 42,
        }
    }
}
