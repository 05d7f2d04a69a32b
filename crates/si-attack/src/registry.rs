// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Name → constructor tables for models, datasets and generators.
//!
//! Registries are plain values handed to [`crate::session::run`]; callers can
//! start from `with_defaults()` and register additional entries.

use crate::error::{AttackError, AttackResult};
use crate::generator::{FeatureGenerator, StridedConvGenerator};
use crate::hparams::HyperParameters;
use crate::model::{FrozenComponents, InversionModel};
use si_config::SeedSource;
use si_tensor::PureResult;
use si_vision::{DatasetKind, DatasetOptions, ImageGeometry, LoadedDataset};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub type ModelFactory = fn(HyperParameters, FrozenComponents) -> AttackResult<InversionModel>;
pub type DatasetLoader = fn(&DatasetOptions) -> PureResult<LoadedDataset>;
pub type GeneratorFactory = fn(&GeneratorSpec) -> AttackResult<Arc<dyn FeatureGenerator>>;

/// What a generator factory is told about the run.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorSpec {
    pub image: ImageGeometry,
    pub seed: u64,
    /// State-dict file to load instead of the seeded initialisation.
    pub weights: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Registry<F> {
    label: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    pub fn empty(label: &'static str) -> Self {
        Self {
            label,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, entry: F) -> &mut Self {
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> AttackResult<&F> {
        self.entries.get(name).ok_or_else(|| AttackError::UnknownName {
            registry: self.label,
            name: name.to_string(),
            available: self.names().join(", "),
        })
    }
}

pub type ModelRegistry = Registry<ModelFactory>;
pub type DatasetRegistry = Registry<DatasetLoader>;
pub type GeneratorRegistry = Registry<GeneratorFactory>;

fn build_unet(hparams: HyperParameters, frozen: FrozenComponents) -> AttackResult<InversionModel> {
    InversionModel::new(hparams, frozen)
}

fn build_strided_conv(spec: &GeneratorSpec) -> AttackResult<Arc<dyn FeatureGenerator>> {
    let seeds = SeedSource::new(spec.seed).child(StridedConvGenerator::NAME);
    let generator = match &spec.weights {
        Some(path) => StridedConvGenerator::from_state_file(spec.image.channels, spec.image.hw, seeds, path)?,
        None => StridedConvGenerator::new(spec.image.channels, spec.image.hw, seeds)?,
    };
    Ok(Arc::new(generator))
}

impl Registry<ModelFactory> {
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty("model");
        registry.register("UNet", build_unet as ModelFactory);
        registry
    }
}

impl Registry<DatasetLoader> {
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty("dataset");
        registry.register(DatasetKind::Cifar10.as_str(), si_vision::datasets::load_cifar10 as DatasetLoader);
        registry.register(DatasetKind::Cifar100.as_str(), si_vision::datasets::load_cifar100 as DatasetLoader);
        registry.register(DatasetKind::CelebA.as_str(), si_vision::datasets::load_celeba as DatasetLoader);
        registry
    }
}

impl Registry<GeneratorFactory> {
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty("generator");
        registry.register(StridedConvGenerator::NAME, build_strided_conv as GeneratorFactory);
        registry
    }
}

/// The three registries a session consults.
#[derive(Clone, Debug)]
pub struct Registries {
    pub models: ModelRegistry,
    pub datasets: DatasetRegistry,
    pub generators: GeneratorRegistry,
}

impl Registries {
    pub fn with_defaults() -> Self {
        Self {
            models: ModelRegistry::with_defaults(),
            datasets: DatasetRegistry::with_defaults(),
            generators: GeneratorRegistry::with_defaults(),
        }
    }
}
