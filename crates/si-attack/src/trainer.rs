// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Epoch loop around [`InversionModel`]: training, per-epoch validation,
//! early stopping and metric emission.

use crate::error::AttackResult;
use crate::metrics::MetricsSink;
use crate::model::{AttackMode, InversionModel, Phase};
use serde::{Deserialize, Serialize};
use si_nn::{Adam, DataLoader, Tensor};
use si_tensor::FeatureMap;
use si_vision::ImageGeometry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stops training once the monitored loss has not improved by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub min_delta: f32,
    pub patience: usize,
    #[serde(skip)]
    best: Option<f32>,
    #[serde(skip)]
    wait: usize,
}

impl EarlyStopping {
    pub fn new(min_delta: f32, patience: usize) -> Self {
        Self {
            min_delta: min_delta.abs(),
            patience,
            best: None,
            wait: 0,
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    /// Feeds one epoch's value; returns `true` when training should stop.
    pub fn observe(&mut self, value: f32) -> bool {
        let improved = match self.best {
            None => value.is_finite(),
            Some(best) => value < best - self.min_delta,
        };
        if improved {
            self.best = Some(value);
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }

    pub fn reset(&mut self) {
        self.best = None;
        self.wait = 0;
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(0.005, 3)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Monitors `val/loss`; `None` always runs `max_epochs`.
    pub early_stopping: Option<EarlyStopping>,
    /// Promotes per-step metric events from `debug` to `info`.
    pub progress_bar: bool,
    pub anomaly_detection: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            early_stopping: Some(EarlyStopping::default()),
            progress_bar: false,
            anomaly_detection: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub train_steps: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub epochs: Vec<EpochStats>,
    pub stopped_early: bool,
    pub interrupted: bool,
    pub best_val_loss: Option<f32>,
}

/// Sample-weighted running mean.
#[derive(Default)]
struct Mean {
    total: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: f32, weight: usize) {
        self.total += value as f64 * weight as f64;
        self.count += weight;
    }

    fn value(&self) -> f32 {
        if self.count == 0 {
            f32::NAN
        } else {
            (self.total / self.count as f64) as f32
        }
    }
}

pub struct Trainer<'a> {
    config: TrainerConfig,
    geometry: ImageGeometry,
    sink: &'a mut dyn MetricsSink,
    global_step: usize,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> Trainer<'a> {
    pub fn new(config: TrainerConfig, geometry: ImageGeometry, sink: &'a mut dyn MetricsSink) -> Self {
        Self {
            config,
            geometry,
            sink,
            global_step: 0,
            stop: None,
        }
    }

    /// Checked between steps; setting it ends the current fit early.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn interrupted(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn images(&self, batch: Tensor) -> AttackResult<FeatureMap> {
        Ok(FeatureMap::new(batch, self.geometry.channels, self.geometry.hw)?)
    }

    /// Runs every batch of `loader` through `model` in `phase`. Returns the
    /// sample-weighted mean loss, `None` if interrupted.
    fn run_epoch(
        &mut self,
        model: &mut InversionModel,
        optimizer: &mut Adam,
        mode: AttackMode,
        phase: Phase,
        loader: &DataLoader,
        epoch: usize,
    ) -> AttackResult<Option<(f32, usize)>> {
        let mut mean = Mean::default();
        let mut steps = 0usize;
        let batches = match phase {
            Phase::Train => loader.epoch(epoch),
            Phase::Validate | Phase::Test => loader.iter(),
        };
        for (idx, batch) in batches.enumerate() {
            if self.interrupted() {
                tracing::warn!(epoch, step = idx, "stop requested, leaving epoch early");
                return Ok(None);
            }
            let (images, _labels) = batch?;
            let images = self.images(images)?;
            let step = match phase {
                Phase::Train => self.global_step,
                Phase::Validate | Phase::Test => idx,
            };
            let out = model.step(optimizer, mode, phase, &images, step)?;
            self.sink.record(phase.metric(), step, out.loss)?;
            mean.push(out.loss, images.batch());
            steps += 1;
            if phase == Phase::Train {
                self.global_step += 1;
            }
        }
        Ok(Some((mean.value(), steps)))
    }

    /// Trains in [`AttackMode::Direct`] with validation after every epoch.
    pub fn fit(
        &mut self,
        model: &mut InversionModel,
        optimizer: &mut Adam,
        train: &DataLoader,
        val: &DataLoader,
    ) -> AttackResult<FitSummary> {
        model.set_anomaly_detection(self.config.anomaly_detection);
        let mut early_stopping = self.config.early_stopping.clone();
        if let Some(stopper) = early_stopping.as_mut() {
            stopper.reset();
        }
        let mut summary = FitSummary::default();
        tracing::info!(
            max_epochs = self.config.max_epochs,
            train_batches = train.batches_per_epoch(),
            val_batches = val.batches_per_epoch(),
            "fit started"
        );
        for epoch in 0..self.config.max_epochs {
            let Some((train_loss, train_steps)) =
                self.run_epoch(model, optimizer, AttackMode::Direct, Phase::Train, train, epoch)?
            else {
                summary.interrupted = true;
                break;
            };
            let Some((val_loss, _)) =
                self.run_epoch(model, optimizer, AttackMode::Direct, Phase::Validate, val, epoch)?
            else {
                summary.interrupted = true;
                break;
            };
            tracing::info!(epoch, train_loss, val_loss, train_steps, "epoch finished");
            summary.epochs.push(EpochStats {
                epoch,
                train_loss,
                val_loss,
                train_steps,
            });
            if let Some(stopper) = early_stopping.as_mut() {
                let stop = stopper.observe(val_loss);
                summary.best_val_loss = stopper.best();
                if stop {
                    tracing::info!(epoch, best = ?stopper.best(), "early stopping on val/loss");
                    summary.stopped_early = true;
                    break;
                }
            } else if summary.best_val_loss.map_or(true, |best| val_loss < best) {
                summary.best_val_loss = Some(val_loss);
            }
        }
        self.sink.flush()?;
        Ok(summary)
    }

    /// Evaluates every batch of `loader` under `mode`; returns the mean loss.
    pub fn test(
        &mut self,
        model: &mut InversionModel,
        mode: AttackMode,
        loader: &DataLoader,
    ) -> AttackResult<f32> {
        // evaluation never steps the optimiser
        let mut optimizer = model.configure_optimizer()?;
        let result = self.run_epoch(model, &mut optimizer, mode, Phase::Test, loader, 0)?;
        self.sink.flush()?;
        let loss = result.map(|(loss, _)| loss).unwrap_or(f32::NAN);
        tracing::info!(?mode, loss, "test finished");
        Ok(loss)
    }
}
