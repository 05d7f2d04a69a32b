// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! On-disk image datasets used to train and evaluate reconstruction attacks.
//!
//! Every reader yields `(image, label)` samples. Images are flattened
//! `3×32×32` rows normalised with mean 0.5 and std 0.5 into `[-1, 1]`;
//! labels are single-column class indices. Training loaders shuffle with a
//! seed derived from [`DatasetOptions::seed`], validation and test loaders
//! keep file order.

mod celeba;
mod cifar;

pub use celeba::load_celeba;
pub use cifar::{load_cifar10, load_cifar100, CIFAR10_CLASSES};

use serde::{Deserialize, Serialize};
use si_config::SeedSource;
use si_nn::{DataLoader, Dataset};
use si_tensor::{PureResult, TensorError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Channel and spatial layout of every image a dataset yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub channels: usize,
    pub hw: (usize, usize),
}

impl ImageGeometry {
    pub const RGB_32: ImageGeometry = ImageGeometry {
        channels: 3,
        hw: (32, 32),
    };

    pub fn features(&self) -> usize {
        self.channels * self.hw.0 * self.hw.1
    }
}

/// Datasets the attacker knows how to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    #[serde(rename = "CIFAR-10")]
    Cifar10,
    #[serde(rename = "CIFAR-100")]
    Cifar100,
    #[serde(rename = "CelebA")]
    CelebA,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 3] = [DatasetKind::Cifar10, DatasetKind::Cifar100, DatasetKind::CelebA];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Cifar10 => "CIFAR-10",
            DatasetKind::Cifar100 => "CIFAR-100",
            DatasetKind::CelebA => "CelebA",
        }
    }

    pub fn load(&self, options: &DatasetOptions) -> PureResult<LoadedDataset> {
        match self {
            DatasetKind::Cifar10 => load_cifar10(options),
            DatasetKind::Cifar100 => load_cifar100(options),
            DatasetKind::CelebA => load_celeba(options),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(TensorError::InvalidValue {
                label: "dataset_name",
            })
    }
}

/// Loader settings shared by every dataset reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetOptions {
    /// Directory holding the dataset files.
    pub root: PathBuf,
    pub batch_size: usize,
    /// Background prefetch depth; `0` loads batches on the caller's thread.
    pub num_workers: usize,
    pub seed: u64,
    /// Share of the training split held out for validation when the dataset
    /// has no validation split of its own.
    pub val_fraction: f32,
    /// Caps how many images each split reads.
    pub max_samples: Option<usize>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            batch_size: 64,
            num_workers: 0,
            seed: 42,
            val_fraction: 0.1,
            max_samples: None,
        }
    }
}

impl DatasetOptions {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    fn validate(&self) -> PureResult<()> {
        if self.batch_size == 0 {
            return Err(TensorError::InvalidValue {
                label: "dataset_batch_size",
            });
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            return Err(TensorError::InvalidValue {
                label: "dataset_val_fraction",
            });
        }
        Ok(())
    }

    fn loader(&self, dataset: Dataset, shuffle_label: Option<&str>) -> DataLoader {
        let mut loader = dataset.into_loader().batched(self.batch_size);
        if let Some(label) = shuffle_label {
            loader = loader.shuffle(SeedSource::new(self.seed).seed_for(label));
        }
        if self.num_workers > 0 {
            loader = loader.prefetch(self.num_workers);
        }
        loader
    }

    /// Carves a validation split off `train` when the dataset ships none.
    fn holdout(&self, train: Dataset) -> (Dataset, Dataset) {
        let count = (train.len() as f32 * self.val_fraction).round() as usize;
        train.split_holdout(count, SeedSource::new(self.seed).seed_for("val_split"))
    }

    fn assemble(
        &self,
        name: &'static str,
        classes: Vec<String>,
        train: Dataset,
        val: Dataset,
        test: Dataset,
    ) -> LoadedDataset {
        tracing::info!(
            dataset = name,
            train = train.len(),
            val = val.len(),
            test = test.len(),
            batch_size = self.batch_size,
            "dataset loaded"
        );
        LoadedDataset {
            name,
            classes,
            geometry: ImageGeometry::RGB_32,
            train: self.loader(train, Some("train_shuffle")),
            val: self.loader(val, None),
            test: self.loader(test, None),
        }
    }
}

/// Ready-to-iterate splits of one dataset.
pub struct LoadedDataset {
    pub name: &'static str,
    pub classes: Vec<String>,
    pub geometry: ImageGeometry,
    pub train: DataLoader,
    pub val: DataLoader,
    pub test: DataLoader,
}

impl fmt::Debug for LoadedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedDataset")
            .field("name", &self.name)
            .field("classes", &self.classes.len())
            .field("geometry", &self.geometry)
            .field("train", &self.train.len())
            .field("val", &self.val.len())
            .field("test", &self.test.len())
            .finish()
    }
}

/// Maps a raw 8-bit intensity into `[-1, 1]`.
pub fn normalise_pixel(value: u8) -> f32 {
    (value as f32 / 255.0 - 0.5) / 0.5
}

fn io_error(path: &Path, err: impl fmt::Display) -> TensorError {
    TensorError::IoError {
        message: format!("{}: {err}", path.display()),
    }
}

/// Returns `root/nested` when that directory exists, otherwise `root`. The
/// archives unpack into a named subdirectory, but either layout is accepted.
fn resolve_dir(root: &Path, nested: &str) -> PureResult<PathBuf> {
    if !root.is_dir() {
        return Err(io_error(root, "dataset root is not a readable directory"));
    }
    let candidate = root.join(nested);
    Ok(if candidate.is_dir() {
        candidate
    } else {
        root.to_path_buf()
    })
}
