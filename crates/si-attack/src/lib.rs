// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Model-inversion attacker built on the `si-vision` U-Net.
//!
//! An [`InversionModel`] pairs frozen input stages (a channel remap for
//! images, a feature reduction for generator outputs) with a trainable U-Net
//! and learns to reconstruct the original images. [`session::run`] wires the
//! model, datasets and generators together from explicit [`Registries`].

pub mod checkpoint;
pub mod error;
pub mod frozen;
pub mod generator;
pub mod hparams;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod session;
pub mod trainer;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};
pub use error::{AttackError, AttackResult, ErrorKind};
pub use frozen::{ChannelRemap, FeatureReduction, FrozenModule, GAN_FEATURE_HW};
pub use generator::{FeatureGenerator, GeneratorOutputs, StridedConvGenerator};
pub use hparams::HyperParameters;
pub use metrics::{FanoutSink, JsonlSink, MemorySink, MetricRecord, MetricsSink, TracingSink};
pub use model::{AttackMode, FrozenComponents, InversionModel, Phase, StepOutput};
pub use registry::{GeneratorSpec, Registries};
pub use session::{run, GeneratorSelection, RunMode, SessionConfig, SessionReport};
pub use trainer::{EarlyStopping, EpochStats, FitSummary, Trainer, TrainerConfig};
