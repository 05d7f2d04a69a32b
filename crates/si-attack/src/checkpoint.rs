// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Attacker checkpoints: trainable parameters plus the hyperparameters needed
//! to rebuild the network, stored as one JSON document
//! `{"hparams": {...}, "parameters": {name: {rows, cols, data}}}`.

use crate::error::{AttackError, AttackResult};
use crate::hparams::HyperParameters;
use serde::Serialize;
use serde_json::Value;
use si_nn::io::{ModuleSnapshot, StoredTensor};
use si_nn::module::Module;
use si_tensor::Tensor;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const MODEL_FILE_PREFIX: &str = "inference_attack_model_v";

#[derive(Serialize)]
struct CheckpointRef<'a> {
    hparams: &'a HyperParameters,
    parameters: &'a BTreeMap<String, StoredTensor>,
}

/// A checkpoint read back from disk.
#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub hparams: HyperParameters,
    pub parameters: HashMap<String, Tensor>,
}

pub fn save_checkpoint<M: Module + ?Sized>(
    path: &Path,
    hparams: &HyperParameters,
    trainable: &M,
) -> AttackResult<()> {
    let snapshot = ModuleSnapshot::from_module(trainable)?;
    let document = CheckpointRef {
        hparams,
        parameters: &snapshot.parameters,
    };
    let file = File::create(path).map_err(|err| AttackError::resource(path, err))?;
    serde_json::to_writer(BufWriter::new(file), &document)
        .map_err(|err| AttackError::resource(path, err))?;
    tracing::info!(
        path = %path.display(),
        parameters = snapshot.parameters.len(),
        "saved attacker checkpoint"
    );
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> AttackResult<Checkpoint> {
    let file = File::open(path).map_err(|err| AttackError::resource(path, err))?;
    let document: Value = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| AttackError::resource(path, format!("malformed checkpoint: {err}")))?;
    let Some(hparams) = document.get("hparams") else {
        return Err(AttackError::resource(path, "checkpoint has no `hparams` section"));
    };
    let hparams = HyperParameters::from_value(hparams, path)?;
    let Some(parameters) = document.get("parameters") else {
        return Err(AttackError::resource(path, "checkpoint has no `parameters` section"));
    };
    let parameters: BTreeMap<String, StoredTensor> = serde_json::from_value(parameters.clone())
        .map_err(|err| AttackError::resource(path, format!("malformed parameters: {err}")))?;
    let parameters = ModuleSnapshot { parameters }.into_state()?;
    Ok(Checkpoint {
        path: path.to_path_buf(),
        hparams,
        parameters,
    })
}

/// `<dir>/inference_attack_model_v<N>.json`, where `N` counts the files already
/// in `dir`. Creates `dir` when missing.
pub fn next_versioned_path(dir: &Path) -> AttackResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|err| AttackError::resource(dir, err))?;
    let mut files = 0usize;
    for entry in fs::read_dir(dir).map_err(|err| AttackError::resource(dir, err))? {
        let entry = entry.map_err(|err| AttackError::resource(dir, err))?;
        if entry.path().is_file() {
            files += 1;
        }
    }
    Ok(dir.join(format!("{MODEL_FILE_PREFIX}{files}.json")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use si_config::SeedSource;
    use si_vision::{UNet, UNetConfig};

    fn tiny() -> (HyperParameters, UNet) {
        let config = UNetConfig::default()
            .with_channels(vec![2, 2, 4], vec![4, 2])
            .with_block_depth(1)
            .with_input_size((4, 4));
        let hparams = HyperParameters::default().with_unet(&config);
        (hparams, UNet::new(config, SeedSource::new(0)).unwrap())
    }

    #[test]
    fn checkpoint_round_trips_weights_and_hparams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let (hparams, net) = tiny();
        save_checkpoint(&path, &hparams, &net).unwrap();
        let restored = load_checkpoint(&path).unwrap();
        assert_eq!(restored.hparams, hparams);
        assert_eq!(restored.parameters, net.state_dict().unwrap());
    }

    #[test]
    fn missing_hparam_key_is_a_resource_error_naming_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let (hparams, net) = tiny();
        save_checkpoint(&path, &hparams, &net).unwrap();
        let mut document: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        document["hparams"].as_object_mut().unwrap().remove("out_sz");
        fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();
        let err = load_checkpoint(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.to_string().contains("out_sz"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_checkpoint(Path::new("/nowhere/model.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.to_string().contains("/nowhere/model.json"));
    }

    #[test]
    fn versioned_paths_count_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("saved_models");
        let first = next_versioned_path(&models).unwrap();
        assert!(first.ends_with("inference_attack_model_v0.json"));
        fs::write(&first, "{}").unwrap();
        fs::create_dir(models.join("nested")).unwrap();
        let second = next_versioned_path(&models).unwrap();
        assert!(second.ends_with("inference_attack_model_v1.json"));
    }
}
