// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! One end-to-end attacker run: load data, build the model from the
//! registries, fit or restore, save, then test.

use crate::checkpoint::{load_checkpoint, next_versioned_path, save_checkpoint};
use crate::error::{AttackError, AttackResult};
use crate::frozen::{ChannelRemap, FeatureReduction, GAN_FEATURE_HW};
use crate::generator::{FeatureGenerator, StridedConvGenerator};
use crate::hparams::HyperParameters;
use crate::metrics::{FanoutSink, JsonlSink, MetricsSink, TracingSink};
use crate::model::{AttackMode, FrozenComponents};
use crate::registry::{GeneratorSpec, Registries};
use crate::trainer::{FitSummary, Trainer, TrainerConfig};
use serde::{Deserialize, Serialize};
use si_config::SeedSource;
use si_vision::{DatasetOptions, ImageGeometry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Generator registry entry plus optional weights for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSelection {
    pub name: String,
    pub weights: Option<PathBuf>,
}

impl GeneratorSelection {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunMode {
    /// Train from scratch, then test.
    Fit,
    /// Restore the trainable weights from `checkpoint` and test immediately.
    /// `generator` replaces the session's generator for the test.
    LoadOnly {
        checkpoint: PathBuf,
        generator: Option<GeneratorSelection>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub dataset: String,
    pub dataset_options: DatasetOptions,
    /// Used by [`RunMode::Fit`]; a load-only run takes them from the checkpoint.
    pub hparams: HyperParameters,
    pub trainer: TrainerConfig,
    pub run_mode: RunMode,
    pub generator: Option<GeneratorSelection>,
    pub remap_weights: Option<PathBuf>,
    pub reduction_weights: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub save_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "UNet".to_string(),
            dataset: "CIFAR-10".to_string(),
            dataset_options: DatasetOptions::default(),
            hparams: HyperParameters::default(),
            trainer: TrainerConfig::default(),
            run_mode: RunMode::Fit,
            generator: None,
            remap_weights: None,
            reduction_weights: None,
            log_dir: PathBuf::from("attacker_logs"),
            save_dir: PathBuf::from("saved_models"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// `None` for load-only runs.
    pub fit: Option<FitSummary>,
    pub saved_model: PathBuf,
    pub test_loss: f32,
    pub test_mode: String,
    pub log_dir: PathBuf,
}

/// `<root>/version_<N>`, where `N` counts the `version_*` entries already
/// under `root`.
fn next_log_dir(root: &Path) -> AttackResult<PathBuf> {
    fs::create_dir_all(root).map_err(|err| AttackError::resource(root, err))?;
    let mut versions = 0usize;
    for entry in fs::read_dir(root).map_err(|err| AttackError::resource(root, err))? {
        let entry = entry.map_err(|err| AttackError::resource(root, err))?;
        if entry.file_name().to_string_lossy().starts_with("version_") {
            versions += 1;
        }
    }
    let dir = root.join(format!("version_{versions}"));
    fs::create_dir_all(&dir).map_err(|err| AttackError::resource(&dir, err))?;
    Ok(dir)
}

fn write_hparams(dir: &Path, hparams: &HyperParameters) -> AttackResult<()> {
    let path = dir.join("hparams.json");
    let text = serde_json::to_string_pretty(hparams).map_err(|err| AttackError::resource(&path, err))?;
    fs::write(&path, text).map_err(|err| AttackError::resource(&path, err))
}

fn build_generator(
    registries: &Registries,
    selection: &GeneratorSelection,
    image: ImageGeometry,
    seed: u64,
) -> AttackResult<Arc<dyn FeatureGenerator>> {
    let factory = registries.generators.get(&selection.name)?;
    let generator = factory(&GeneratorSpec {
        image,
        seed,
        weights: selection.weights.clone(),
    })?;
    tracing::info!(generator = generator.name(), "generator ready");
    Ok(generator)
}

fn frozen_components(
    config: &SessionConfig,
    hparams: &HyperParameters,
    image: ImageGeometry,
    generator: Option<Arc<dyn FeatureGenerator>>,
) -> AttackResult<FrozenComponents> {
    let feature_channels = generator
        .as_ref()
        .map_or(StridedConvGenerator::ENCODED_CHANNELS, |g| g.encoded_channels());
    let seeds = SeedSource::new(hparams.seed).child("frozen");
    let mut frozen = FrozenComponents::seeded(hparams, image.channels, feature_channels, seeds)?;
    let target = hparams.unet_config().input_channels();
    if let Some(path) = &config.remap_weights {
        frozen.remap = Arc::new(ChannelRemap::from_state_file(
            image.channels,
            target,
            hparams.in_sz,
            3,
            path,
        )?);
    }
    if let Some(path) = &config.reduction_weights {
        frozen.reduction = Arc::new(FeatureReduction::from_state_file(
            feature_channels,
            target,
            GAN_FEATURE_HW,
            path,
        )?);
    }
    Ok(match generator {
        Some(generator) => frozen.with_generator(generator),
        None => frozen,
    })
}

/// Runs `config` against `registries`.
pub fn run(config: &SessionConfig, registries: &Registries) -> AttackResult<SessionReport> {
    run_with_stop(config, registries, None)
}

/// Like [`run`]; setting `stop` ends fitting at the next step boundary.
pub fn run_with_stop(
    config: &SessionConfig,
    registries: &Registries,
    stop: Option<Arc<AtomicBool>>,
) -> AttackResult<SessionReport> {
    let model_factory = *registries.models.get(&config.model)?;
    let dataset_loader = *registries.datasets.get(&config.dataset)?;

    let checkpoint = match &config.run_mode {
        RunMode::Fit => None,
        RunMode::LoadOnly { checkpoint, .. } => Some(load_checkpoint(checkpoint)?),
    };
    let hparams = match &checkpoint {
        Some(checkpoint) => checkpoint.hparams.clone(),
        None => config.hparams.clone(),
    };
    hparams.validate()?;

    let options = DatasetOptions {
        seed: hparams.seed,
        ..config.dataset_options.clone()
    };
    let data = dataset_loader(&options)?;
    if data.geometry.hw != hparams.in_sz {
        return Err(AttackError::config(format!(
            "{} images are {:?} but the encoder is built for {:?}",
            data.name, data.geometry.hw, hparams.in_sz
        )));
    }

    let log_dir = next_log_dir(&config.log_dir)?;
    write_hparams(&log_dir, &hparams)?;
    if !config.trainer.progress_bar {
        tracing::info!(path = %log_dir.display(), "logging metrics to run directory");
    }
    let mut sink = FanoutSink::new()
        .with(JsonlSink::create(log_dir.join("metrics.jsonl"))?)
        .with(TracingSink {
            verbose: config.trainer.progress_bar,
        });

    let selection = match &config.run_mode {
        RunMode::LoadOnly {
            generator: Some(swap),
            ..
        } => Some(swap),
        _ => config.generator.as_ref(),
    };
    let generator = selection
        .map(|selection| build_generator(registries, selection, data.geometry, hparams.seed))
        .transpose()?;
    let frozen = frozen_components(config, &hparams, data.geometry, generator)?;
    let mut model = model_factory(hparams.clone(), frozen)?;
    tracing::info!(model = %config.model, dataset = data.name, "model constructed");

    let mut trainer = Trainer::new(config.trainer.clone(), data.geometry, &mut sink);
    if let Some(stop) = stop {
        trainer = trainer.with_stop_flag(stop);
    }
    let fit = match &checkpoint {
        None => {
            let mut optimizer = model.configure_optimizer()?;
            Some(trainer.fit(&mut model, &mut optimizer, &data.train, &data.val)?)
        }
        Some(checkpoint) => {
            model.load_trainable(&checkpoint.parameters)?;
            tracing::info!(path = %checkpoint.path.display(), "restored trainable parameters");
            None
        }
    };

    let saved_model = next_versioned_path(&config.save_dir)?;
    save_checkpoint(&saved_model, model.hparams(), model.trainable())?;

    let test_mode = if model.has_generator() {
        AttackMode::GanFeature
    } else {
        tracing::warn!("no generator attached, testing on direct reconstruction");
        AttackMode::Direct
    };
    let test_loss = trainer.test(&mut model, test_mode, &data.test)?;

    Ok(SessionReport {
        fit,
        saved_model,
        test_loss,
        test_mode: format!("{test_mode:?}"),
        log_dir,
    })
}
