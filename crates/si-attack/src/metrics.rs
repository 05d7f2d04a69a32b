// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scalar metric sinks.

use crate::error::{AttackError, AttackResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const TOTAL_LOSS: &str = "total/loss";
pub const VAL_LOSS: &str = "val/loss";
pub const RECONSTRUCTION_ERROR: &str = "total/reconstruction_error";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub step: usize,
    pub value: f32,
}

pub trait MetricsSink: Send {
    fn record(&mut self, name: &str, step: usize, value: f32) -> AttackResult<()>;

    fn flush(&mut self) -> AttackResult<()> {
        Ok(())
    }
}

/// Emits every record as a `tracing` event; `debug` unless `verbose`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink {
    pub verbose: bool,
}

impl MetricsSink for TracingSink {
    fn record(&mut self, name: &str, step: usize, value: f32) -> AttackResult<()> {
        if self.verbose {
            tracing::info!(metric = name, step, value, "metric");
        } else {
            tracing::debug!(metric = name, step, value, "metric");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Vec<MetricRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    /// Values recorded under `name`, in emission order.
    pub fn values(&self, name: &str) -> Vec<f32> {
        self.records
            .iter()
            .filter(|record| record.name == name)
            .map(|record| record.value)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, name: &str, step: usize, value: f32) -> AttackResult<()> {
        self.records.push(MetricRecord {
            name: name.to_string(),
            step,
            value,
        });
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: impl Into<PathBuf>) -> AttackResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|err| AttackError::resource(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, name: &str, step: usize, value: f32) -> AttackResult<()> {
        let record = MetricRecord {
            name: name.to_string(),
            step,
            value,
        };
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|err| AttackError::resource(&self.path, err))?;
        self.writer
            .write_all(b"\n")
            .map_err(|err| AttackError::resource(&self.path, err))
    }

    fn flush(&mut self) -> AttackResult<()> {
        self.writer
            .flush()
            .map_err(|err| AttackError::resource(&self.path, err))
    }
}

/// Forwards every record to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for FanoutSink {
    fn record(&mut self, name: &str, step: usize, value: f32) -> AttackResult<()> {
        for sink in &mut self.sinks {
            sink.record(name, step, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> AttackResult<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut sink = FanoutSink::new()
            .with(JsonlSink::create(&path).unwrap())
            .with(TracingSink::default());
        sink.record(TOTAL_LOSS, 0, 0.5).unwrap();
        sink.record(VAL_LOSS, 1, 0.25).unwrap();
        sink.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MetricRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, VAL_LOSS);
        assert_eq!(records[1].value, 0.25);
    }

    #[test]
    fn memory_sink_filters_by_name() {
        let mut sink = MemorySink::new();
        sink.record(TOTAL_LOSS, 0, 1.0).unwrap();
        sink.record(VAL_LOSS, 0, 2.0).unwrap();
        sink.record(TOTAL_LOSS, 1, 0.5).unwrap();
        assert_eq!(sink.values(TOTAL_LOSS), vec![1.0, 0.5]);
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn jsonl_sink_reports_unwritable_path() {
        let err = JsonlSink::create("/no/such/dir/metrics.jsonl").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Resource);
    }
}
