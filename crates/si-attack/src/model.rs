// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The inversion attacker: frozen input stages in front of a trainable U-Net.

use crate::error::{AttackError, AttackResult};
use crate::frozen::{ChannelRemap, FeatureReduction, FrozenModule, GAN_FEATURE_HW};
use crate::generator::FeatureGenerator;
use crate::hparams::HyperParameters;
use crate::metrics::{RECONSTRUCTION_ERROR, TOTAL_LOSS, VAL_LOSS};
use si_config::SeedSource;
use si_nn::loss::{Loss, MeanSquaredError};
use si_nn::module::Module;
use si_nn::{Adam, Tensor};
use si_tensor::resample::{resize, resize_backward};
use si_tensor::FeatureMap;
use si_vision::UNet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How the encoder input is produced from an image batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttackMode {
    /// Frozen channel remap of the images at their own extent.
    Direct,
    /// Encoded feature of the frozen generator, reduced to the encoder's
    /// channels and upsampled to [`GAN_FEATURE_HW`].
    GanFeature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Validate,
    Test,
}

impl Phase {
    /// Metric each step of this phase is logged under.
    pub fn metric(&self) -> &'static str {
        match self {
            Phase::Train => TOTAL_LOSS,
            Phase::Validate => VAL_LOSS,
            Phase::Test => RECONSTRUCTION_ERROR,
        }
    }
}

/// Components that never receive gradients.
#[derive(Clone)]
pub struct FrozenComponents {
    pub remap: Arc<dyn FrozenModule>,
    pub reduction: Arc<dyn FrozenModule>,
    pub generator: Option<Arc<dyn FeatureGenerator>>,
}

impl FrozenComponents {
    /// Seeded remap (3×3, `image_channels → enc_chs[0]` at `in_sz`) and
    /// reduction (`feature_channels → enc_chs[0]`).
    pub fn seeded(
        hparams: &HyperParameters,
        image_channels: usize,
        feature_channels: usize,
        seeds: SeedSource,
    ) -> AttackResult<Self> {
        let target = encoder_input_channels(hparams)?;
        Ok(Self {
            remap: Arc::new(ChannelRemap::new(image_channels, target, hparams.in_sz, 3, seeds)?),
            reduction: Arc::new(FeatureReduction::new(
                feature_channels,
                target,
                GAN_FEATURE_HW,
                seeds,
            )?),
            generator: None,
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn FeatureGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }
}

impl fmt::Debug for FrozenComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenComponents")
            .field("remap", &self.remap)
            .field("reduction", &self.reduction)
            .field("generator", &self.generator.as_ref().map(|g| g.name().to_string()))
            .finish()
    }
}

fn encoder_input_channels(hparams: &HyperParameters) -> AttackResult<usize> {
    hparams
        .enc_chs
        .first()
        .copied()
        .ok_or_else(|| AttackError::config("encoder channel schedule is empty"))
}

/// Loss and reconstruction of one step.
#[derive(Clone, Debug)]
pub struct StepOutput {
    pub loss: f32,
    pub reconstruction: FeatureMap,
}

/// Frozen stages plus the trainable U-Net and its loss.
#[derive(Debug)]
pub struct InversionModel {
    hparams: HyperParameters,
    unet: UNet,
    frozen: FrozenComponents,
    loss: MeanSquaredError,
    anomaly_detection: bool,
}

impl InversionModel {
    pub fn new(hparams: HyperParameters, frozen: FrozenComponents) -> AttackResult<Self> {
        hparams.validate()?;
        let unet = UNet::new(hparams.unet_config(), SeedSource::new(hparams.seed).child("unet"))?;
        let enc_in = encoder_input_channels(&hparams)?;
        for (label, module) in [("remap", &frozen.remap), ("reduction", &frozen.reduction)] {
            if module.output_channels() != enc_in {
                return Err(AttackError::config(format!(
                    "{label} produces {} channels but the encoder expects {enc_in}",
                    module.output_channels()
                )));
            }
        }
        if let Some(generator) = &frozen.generator {
            check_generator(generator.as_ref(), frozen.reduction.as_ref())?;
        }
        Ok(Self {
            hparams,
            unet,
            frozen,
            loss: MeanSquaredError::new(),
            anomaly_detection: true,
        })
    }

    pub fn hparams(&self) -> &HyperParameters {
        &self.hparams
    }

    pub fn trainable(&self) -> &UNet {
        &self.unet
    }

    pub fn trainable_mut(&mut self) -> &mut UNet {
        &mut self.unet
    }

    pub fn frozen(&self) -> &FrozenComponents {
        &self.frozen
    }

    pub fn has_generator(&self) -> bool {
        self.frozen.generator.is_some()
    }

    /// Swaps the upstream generator; the trainable weights are untouched.
    pub fn set_generator(&mut self, generator: Option<Arc<dyn FeatureGenerator>>) -> AttackResult<()> {
        if let Some(generator) = &generator {
            check_generator(generator.as_ref(), self.frozen.reduction.as_ref())?;
        }
        self.frozen.generator = generator;
        Ok(())
    }

    pub fn anomaly_detection(&self) -> bool {
        self.anomaly_detection
    }

    pub fn set_anomaly_detection(&mut self, enabled: bool) {
        self.anomaly_detection = enabled;
    }

    /// Adam over the trainable parameters only.
    pub fn configure_optimizer(&self) -> AttackResult<Adam> {
        Ok(Adam::new(self.hparams.lr)?)
    }

    pub fn trainable_state(&self) -> AttackResult<HashMap<String, Tensor>> {
        Ok(self.unet.state_dict()?)
    }

    pub fn load_trainable(&mut self, state: &HashMap<String, Tensor>) -> AttackResult<()> {
        Ok(self.unet.load_state_dict(state)?)
    }

    /// Produces the encoder input for `images` under `mode`.
    pub fn encode(&self, mode: AttackMode, images: &FeatureMap) -> AttackResult<FeatureMap> {
        match mode {
            AttackMode::Direct => self.frozen.remap.forward(images),
            AttackMode::GanFeature => {
                let generator = self
                    .frozen
                    .generator
                    .as_ref()
                    .ok_or(AttackError::MissingGenerator)?;
                if self.hparams.in_sz != GAN_FEATURE_HW {
                    return Err(AttackError::config(format!(
                        "GAN features are upsampled to {GAN_FEATURE_HW:?} but the encoder is built for {:?}",
                        self.hparams.in_sz
                    )));
                }
                let encoded = generator.generate(images)?.into_encoded()?;
                self.frozen.reduction.forward(&encoded)
            }
        }
    }

    fn finish(&self, decoded: FeatureMap) -> AttackResult<FeatureMap> {
        if self.hparams.retain_dim {
            Ok(resize(&decoded, self.hparams.out_sz, self.hparams.interpolation)?)
        } else {
            Ok(decoded)
        }
    }

    /// Reconstructs `images` without computing a loss.
    pub fn reconstruct(&self, mode: AttackMode, images: &FeatureMap) -> AttackResult<FeatureMap> {
        let encoded = self.encode(mode, images)?;
        self.finish(self.unet.forward_map(&encoded)?)
    }

    /// Runs one step. Training steps backpropagate into the U-Net and apply
    /// `optimizer`; the other phases only evaluate.
    pub fn step(
        &mut self,
        optimizer: &mut Adam,
        mode: AttackMode,
        phase: Phase,
        images: &FeatureMap,
        step: usize,
    ) -> AttackResult<StepOutput> {
        match phase {
            Phase::Train => self.training_step(optimizer, mode, images, step),
            Phase::Validate | Phase::Test => self.evaluate(mode, images),
        }
    }

    pub fn training_step(
        &mut self,
        optimizer: &mut Adam,
        mode: AttackMode,
        images: &FeatureMap,
        step: usize,
    ) -> AttackResult<StepOutput> {
        let encoded = self.encode(mode, images)?;
        let decoded = self.unet.forward_map(&encoded)?;
        let reconstruction = self.finish(decoded.clone())?;
        let loss = self.loss.value(reconstruction.tensor(), images.tensor())?;
        if self.anomaly_detection && !loss.is_finite() {
            return Err(AttackError::Anomaly {
                what: "loss".into(),
                step,
                value: loss,
            });
        }
        let grad = reconstruction.with_tensor(self.loss.backward(reconstruction.tensor(), images.tensor())?)?;
        let grad = if self.hparams.retain_dim {
            resize_backward(&grad, decoded.hw(), self.hparams.interpolation)?
        } else {
            grad
        };
        optimizer.zero_grad(&mut self.unet)?;
        self.unet.backward_map(&encoded, &grad)?;
        if self.anomaly_detection {
            self.check_gradients(step)?;
        }
        optimizer.step(&mut self.unet)?;
        Ok(StepOutput {
            loss,
            reconstruction,
        })
    }

    pub fn validation_step(&self, images: &FeatureMap) -> AttackResult<StepOutput> {
        self.evaluate(AttackMode::Direct, images)
    }

    pub fn test_step(&self, images: &FeatureMap) -> AttackResult<StepOutput> {
        self.evaluate(AttackMode::GanFeature, images)
    }

    pub fn evaluate(&self, mode: AttackMode, images: &FeatureMap) -> AttackResult<StepOutput> {
        let reconstruction = self.reconstruct(mode, images)?;
        let loss = MeanSquaredError::new().value(reconstruction.tensor(), images.tensor())?;
        Ok(StepOutput {
            loss,
            reconstruction,
        })
    }

    fn check_gradients(&self, step: usize) -> AttackResult<()> {
        let mut anomaly = None;
        self.unet.visit_parameters(&mut |param| {
            if anomaly.is_none() {
                if let Some(value) = param.gradient().and_then(Tensor::first_non_finite) {
                    anomaly = Some((param.name().to_string(), value));
                }
            }
            Ok(())
        })?;
        match anomaly {
            Some((name, value)) => Err(AttackError::Anomaly {
                what: format!("gradient of `{name}`"),
                step,
                value,
            }),
            None => Ok(()),
        }
    }
}

fn check_generator(generator: &dyn FeatureGenerator, reduction: &dyn FrozenModule) -> AttackResult<()> {
    if generator.encoded_channels() != reduction.input_channels() {
        return Err(AttackError::config(format!(
            "generator `{}` encodes {} channels but the reduction expects {}",
            generator.name(),
            generator.encoded_channels(),
            reduction.input_channels()
        )));
    }
    Ok(())
}
