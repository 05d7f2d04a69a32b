// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use serde::{Deserialize, Serialize};
use si_tensor::{PureResult, Tensor, TensorError};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serialisable copy of a tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    pub fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// Name-sorted parameter snapshot; the ordering keeps files diffable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub parameters: BTreeMap<String, StoredTensor>,
}

impl ModuleSnapshot {
    pub fn from_state(state: &HashMap<String, Tensor>) -> ModuleSnapshot {
        let parameters = state
            .iter()
            .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
            .collect();
        ModuleSnapshot { parameters }
    }

    pub fn from_module<M: Module + ?Sized>(module: &M) -> PureResult<ModuleSnapshot> {
        Ok(Self::from_state(&module.state_dict()?))
    }

    pub fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.parameters.len());
        for (name, tensor) in self.parameters {
            state.insert(name, tensor.into_tensor()?);
        }
        Ok(state)
    }
}

/// On-disk encoding of a state dict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateFormat {
    Json,
    Bincode,
}

impl StateFormat {
    /// `.bin`/`.bincode` select bincode; everything else is JSON.
    pub fn from_path(path: &Path) -> StateFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("bin") | Some("bincode") => StateFormat::Bincode,
            _ => StateFormat::Json,
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: format!("{}: {err}", path.display()),
    }
}

fn serde_error(path: &Path, err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: format!("{}: {}", path.display(), err.to_string()),
    }
}

pub fn save_snapshot<P: AsRef<Path>>(
    snapshot: &ModuleSnapshot,
    path: P,
    format: StateFormat,
) -> PureResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| io_error(path, err))?;
    let writer = BufWriter::new(file);
    match format {
        StateFormat::Json => {
            serde_json::to_writer_pretty(writer, snapshot).map_err(|err| serde_error(path, err))?
        }
        StateFormat::Bincode => {
            bincode::serialize_into(writer, snapshot).map_err(|err| serde_error(path, err))?
        }
    }
    tracing::debug!(
        path = %path.display(),
        parameters = snapshot.parameters.len(),
        "saved state dict"
    );
    Ok(())
}

pub fn load_snapshot<P: AsRef<Path>>(path: P, format: StateFormat) -> PureResult<ModuleSnapshot> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = match format {
        StateFormat::Json => {
            serde_json::from_reader(reader).map_err(|err| serde_error(path, err))?
        }
        StateFormat::Bincode => {
            bincode::deserialize_from(reader).map_err(|err| serde_error(path, err))?
        }
    };
    Ok(snapshot)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_snapshot(&ModuleSnapshot::from_module(module)?, path, StateFormat::Json)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_snapshot(path, StateFormat::Json)?.into_state()?;
    module.load_state_dict(&state)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_snapshot(&ModuleSnapshot::from_module(module)?, path, StateFormat::Bincode)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_snapshot(path, StateFormat::Bincode)?.into_state()?;
    module.load_state_dict(&state)
}

/// Saves a bare state dict, picking the encoding from the file extension.
pub fn save_state_dict<P: AsRef<Path>>(state: &HashMap<String, Tensor>, path: P) -> PureResult<()> {
    let path = path.as_ref();
    save_snapshot(
        &ModuleSnapshot::from_state(state),
        path,
        StateFormat::from_path(path),
    )
}

/// Loads a bare state dict, picking the encoding from the file extension.
pub fn load_state_dict<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let path = path.as_ref();
    load_snapshot(path, StateFormat::from_path(path))?.into_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Conv2d;

    #[test]
    fn json_round_trip_restores_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.json");
        let source = Conv2d::same_3x3("conv", 2, 3, (4, 4), Some(1)).unwrap();
        save_json(&source, &path).unwrap();
        let mut target = Conv2d::same_3x3("conv", 2, 3, (4, 4), Some(2)).unwrap();
        assert_ne!(target.state_dict().unwrap(), source.state_dict().unwrap());
        load_json(&mut target, &path).unwrap();
        assert_eq!(target.state_dict().unwrap(), source.state_dict().unwrap());
    }

    #[test]
    fn extension_selects_bincode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.bin");
        assert_eq!(StateFormat::from_path(&path), StateFormat::Bincode);
        let source = Conv2d::pointwise("p", 3, 6, (2, 2), Some(3)).unwrap();
        save_state_dict(&source.state_dict().unwrap(), &path).unwrap();
        let restored = load_state_dict(&path).unwrap();
        assert_eq!(restored, source.state_dict().unwrap());
        assert!(load_snapshot(&path, StateFormat::Json).is_err());
    }

    #[test]
    fn loading_into_a_mismatched_module_names_the_missing_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.json");
        let source = Conv2d::pointwise("left", 1, 1, (1, 1), Some(0)).unwrap();
        save_json(&source, &path).unwrap();
        let mut target = Conv2d::pointwise("right", 1, 1, (1, 1), Some(0)).unwrap();
        let err = load_json(&mut target, &path).unwrap_err();
        assert_eq!(
            err,
            TensorError::MissingParameter {
                name: "right::weight".into()
            }
        );
    }

    #[test]
    fn missing_file_is_an_io_error_naming_the_path() {
        let err = load_state_dict("/definitely/not/here.json").unwrap_err();
        match err {
            TensorError::IoError { message } => assert!(message.contains("/definitely/not/here.json")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
