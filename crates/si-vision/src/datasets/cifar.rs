// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Readers for the binary CIFAR distributions.
//!
//! A record is `label_bytes` label bytes followed by 3072 pixel bytes: the
//! red, green and blue 32×32 planes in that order, which is already the
//! channel-major layout [`si_tensor::FeatureMap`] expects.

use super::{io_error, normalise_pixel, resolve_dir, DatasetOptions, LoadedDataset};
use si_nn::Dataset;
use si_tensor::{PureResult, Tensor, TensorError};
use std::fs;
use std::path::Path;

pub const CIFAR10_CLASSES: [&str; 10] = [
    "plane", "car", "bird", "cat", "deer", "dog", "frog", "horse", "ship", "truck",
];

const PIXELS: usize = 3 * 32 * 32;
const CIFAR10_TRAIN: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];

/// Appends every record of `path` to `dataset`, stopping at `limit` samples.
/// The label used is the last label byte of each record.
fn read_records(
    path: &Path,
    label_bytes: usize,
    dataset: &mut Dataset,
    limit: Option<usize>,
) -> PureResult<()> {
    let bytes = fs::read(path).map_err(|err| io_error(path, err))?;
    let record = label_bytes + PIXELS;
    if bytes.is_empty() || bytes.len() % record != 0 {
        return Err(TensorError::SerializationError {
            message: format!(
                "{}: {} bytes is not a whole number of {record}-byte records",
                path.display(),
                bytes.len()
            ),
        });
    }
    for chunk in bytes.chunks_exact(record) {
        if limit.is_some_and(|cap| dataset.len() >= cap) {
            break;
        }
        let label = chunk[label_bytes - 1] as f32;
        let pixels = chunk[label_bytes..].iter().copied().map(normalise_pixel).collect();
        dataset.push(
            Tensor::from_vec(1, PIXELS, pixels)?,
            Tensor::from_vec(1, 1, vec![label])?,
        );
    }
    tracing::debug!(path = %path.display(), samples = dataset.len(), "read cifar records");
    Ok(())
}

fn read_split(
    dir: &Path,
    files: &[&str],
    label_bytes: usize,
    limit: Option<usize>,
) -> PureResult<Dataset> {
    let mut dataset = Dataset::new();
    for file in files {
        read_records(&dir.join(file), label_bytes, &mut dataset, limit)?;
    }
    Ok(dataset)
}

/// CIFAR-10 from `data_batch_{1..5}.bin` and `test_batch.bin`, either directly
/// under the root or inside `cifar-10-batches-bin/`.
pub fn load_cifar10(options: &DatasetOptions) -> PureResult<LoadedDataset> {
    options.validate()?;
    let dir = resolve_dir(&options.root, "cifar-10-batches-bin")?;
    let train = read_split(&dir, &CIFAR10_TRAIN, 1, options.max_samples)?;
    let test = read_split(&dir, &["test_batch.bin"], 1, options.max_samples)?;
    let (train, val) = options.holdout(train);
    let classes = CIFAR10_CLASSES.iter().map(|name| name.to_string()).collect();
    Ok(options.assemble("CIFAR-10", classes, train, val, test))
}

/// CIFAR-100 from `train.bin` and `test.bin` (coarse and fine label bytes;
/// the fine label is kept), either under the root or `cifar-100-binary/`.
pub fn load_cifar100(options: &DatasetOptions) -> PureResult<LoadedDataset> {
    options.validate()?;
    let dir = resolve_dir(&options.root, "cifar-100-binary")?;
    let train = read_split(&dir, &["train.bin"], 2, options.max_samples)?;
    let test = read_split(&dir, &["test.bin"], 2, options.max_samples)?;
    let (train, val) = options.holdout(train);
    let classes = match fs::read_to_string(dir.join("fine_label_names.txt")) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => (0..100).map(|idx| format!("class_{idx}")).collect(),
    };
    Ok(options.assemble("CIFAR-100", classes, train, val, test))
}
