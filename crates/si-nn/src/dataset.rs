// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use si_tensor::{PureResult, Tensor};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// `(input, target)` pair; both tensors hold a single row.
pub type Sample = (Tensor, Tensor);

/// Lightweight in-memory dataset that keeps input/target tensors paired together.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Builds a dataset from an owning vector.
    pub fn from_vec(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Appends a new sample to the dataset.
    pub fn push(&mut self, input: Tensor, target: Tensor) {
        self.samples.push((input, target));
    }

    /// Returns the number of samples stored in the dataset.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are registered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns an owning iterator that yields cloned samples.
    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().cloned()
    }

    /// Splits off `holdout` samples chosen by a seeded permutation. Returns
    /// `(remaining, held_out)`; both keep their original relative order.
    pub fn split_holdout(self, holdout: usize, seed: u64) -> (Dataset, Dataset) {
        let holdout = holdout.min(self.samples.len());
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut held = vec![false; self.samples.len()];
        for &idx in &indices[..holdout] {
            held[idx] = true;
        }
        let mut remaining = Vec::with_capacity(self.samples.len() - holdout);
        let mut held_out = Vec::with_capacity(holdout);
        for (sample, is_held) in self.samples.into_iter().zip(held) {
            if is_held {
                held_out.push(sample);
            } else {
                remaining.push(sample);
            }
        }
        (Dataset::from_vec(remaining), Dataset::from_vec(held_out))
    }

    /// Consumes the dataset and turns it into a streaming [`DataLoader`].
    pub fn into_loader(self) -> DataLoader {
        DataLoader::new(self.samples.into())
    }
}

fn default_order(len: usize) -> Arc<Vec<usize>> {
    Arc::new((0..len).collect())
}

fn stack_batch(samples: &[Sample], indices: &[usize]) -> PureResult<(Tensor, Tensor)> {
    let mut inputs = Vec::with_capacity(indices.len());
    let mut targets = Vec::with_capacity(indices.len());
    for &idx in indices {
        inputs.push(samples[idx].0.clone());
        targets.push(samples[idx].1.clone());
    }
    Ok((Tensor::cat_rows(&inputs)?, Tensor::cat_rows(&targets)?))
}

struct ImmediateBatches {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl Iterator for ImmediateBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (self.position + self.batch_size).min(self.order.len());
        self.position = end;
        Some(stack_batch(&self.samples, &self.order[start..end]))
    }
}

struct PrefetchBatches {
    rx: Receiver<PureResult<(Tensor, Tensor)>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PrefetchBatches {
    fn spawn(
        samples: Arc<[Sample]>,
        order: Arc<Vec<usize>>,
        batch_size: usize,
        depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let handle = thread::spawn(move || {
            for indices in order.chunks(batch_size) {
                if tx.send(stack_batch(&samples, indices)).is_err() {
                    return;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for PrefetchBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for PrefetchBatches {
    fn drop(&mut self) {
        // Unblock a producer waiting on a full channel before joining it.
        let (_, placeholder) = mpsc::sync_channel(0);
        drop(std::mem::replace(&mut self.rx, placeholder));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum DataLoaderBackend {
    Immediate(ImmediateBatches),
    Prefetch(PrefetchBatches),
}

/// Iterator over mini-batches produced by a [`DataLoader`].
pub struct DataLoaderBatches {
    backend: DataLoaderBackend,
}

impl Iterator for DataLoaderBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            DataLoaderBackend::Immediate(iter) => iter.next(),
            DataLoaderBackend::Prefetch(iter) => iter.next(),
        }
    }
}

/// Builder-style streaming loader that supports deterministic shuffling, fixed
/// batch sizes, and background prefetch for feeding training loops.
///
/// A shuffled loader draws a fresh permutation per [`DataLoader::epoch`],
/// derived from the shuffle seed and the epoch counter.
#[derive(Clone)]
pub struct DataLoader {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    shuffle_seed: Option<u64>,
    batch_size: usize,
    prefetch: usize,
}

impl DataLoader {
    fn new(samples: Arc<[Sample]>) -> Self {
        let len = samples.len();
        Self {
            samples,
            order: default_order(len),
            shuffle_seed: None,
            batch_size: 1,
            prefetch: 0,
        }
    }

    /// Returns the number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when the underlying dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass yields.
    pub fn batches_per_epoch(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Returns the configured prefetch depth.
    pub fn prefetch_depth(&self) -> usize {
        self.prefetch
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle_seed.is_some()
    }

    /// Enables seeded shuffling.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self.order = Arc::new(permutation(self.samples.len(), seed));
        self
    }

    /// Updates the loader to emit batches of `batch_size` samples.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enables background prefetching with the given channel depth.
    pub fn prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    /// Iterates the batches of epoch `epoch`. Unshuffled loaders ignore `epoch`.
    pub fn epoch(&self, epoch: usize) -> DataLoaderBatches {
        let order = match self.shuffle_seed {
            Some(seed) if epoch > 0 => Arc::new(permutation(
                self.samples.len(),
                seed.wrapping_add(epoch as u64),
            )),
            _ => Arc::clone(&self.order),
        };
        self.batches(order)
    }

    /// Creates a new iterator over the configured batches.
    pub fn iter(&self) -> DataLoaderBatches {
        self.batches(Arc::clone(&self.order))
    }

    fn batches(&self, order: Arc<Vec<usize>>) -> DataLoaderBatches {
        let samples = Arc::clone(&self.samples);
        let backend = if self.prefetch == 0 {
            DataLoaderBackend::Immediate(ImmediateBatches {
                samples,
                order,
                batch_size: self.batch_size,
                position: 0,
            })
        } else {
            DataLoaderBackend::Prefetch(PrefetchBatches::spawn(
                samples,
                order,
                self.batch_size,
                self.prefetch,
            ))
        };
        DataLoaderBatches { backend }
    }
}

fn permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    indices
}

impl IntoIterator for DataLoader {
    type Item = PureResult<(Tensor, Tensor)>;
    type IntoIter = DataLoaderBatches;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> Dataset {
        Dataset::from_vec(
            (0..count)
                .map(|i| {
                    let input = Tensor::from_vec(1, 2, vec![i as f32, (i + 1) as f32]).unwrap();
                    let target = Tensor::from_vec(1, 1, vec![i as f32]).unwrap();
                    (input, target)
                })
                .collect(),
        )
    }

    #[test]
    fn dataloader_batches_rows_with_short_tail() {
        let loader = numbered(7).into_loader().batched(3);
        assert_eq!(loader.batches_per_epoch(), 3);
        let shapes: Vec<_> = loader
            .iter()
            .map(|batch| batch.unwrap().0.shape())
            .collect();
        assert_eq!(shapes, vec![(3, 2), (3, 2), (1, 2)]);
    }

    #[test]
    fn dataloader_shuffles_deterministically() {
        let collect = |loader: &DataLoader, epoch: usize| -> Vec<f32> {
            loader
                .epoch(epoch)
                .flat_map(|batch| batch.unwrap().1.into_vec())
                .collect()
        };
        let a = numbered(16).into_loader().shuffle(9).batched(4);
        let b = numbered(16).into_loader().shuffle(9).batched(4);
        assert_eq!(collect(&a, 0), collect(&b, 0));
        assert_ne!(collect(&a, 0), collect(&a, 1));
        let mut seen = collect(&a, 1);
        seen.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(seen, (0..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn prefetch_matches_immediate_order() {
        let plain = numbered(10).into_loader().batched(4);
        let prefetched = plain.clone().prefetch(2);
        let left: Vec<_> = plain.iter().map(|b| b.unwrap()).collect();
        let right: Vec<_> = prefetched.iter().map(|b| b.unwrap()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn dropping_a_partially_consumed_prefetch_iterator_does_not_hang() {
        let loader = numbered(64).into_loader().batched(1).prefetch(1);
        let mut iter = loader.iter();
        assert!(iter.next().is_some());
        drop(iter);
    }

    #[test]
    fn holdout_split_partitions_samples() {
        let (train, val) = numbered(10).split_holdout(3, 4);
        assert_eq!(train.len(), 7);
        assert_eq!(val.len(), 3);
        let mut all: Vec<f32> = train
            .iter()
            .chain(val.iter())
            .map(|(_, t)| t.data()[0])
            .collect();
        all.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(all, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }
}
