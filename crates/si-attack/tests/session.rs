// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use si_attack::metrics::{MetricRecord, RECONSTRUCTION_ERROR, TOTAL_LOSS};
use si_attack::{
    load_checkpoint, run, ErrorKind, GeneratorSelection, HyperParameters, Registries, RunMode,
    SessionConfig, TrainerConfig,
};
use si_vision::DatasetOptions;
use std::fs;
use std::io::Write;
use std::path::Path;

const PIXELS: usize = 3 * 32 * 32;

/// One record per training batch file and two test records.
fn cifar10_fixture(dir: &Path) {
    let names = [
        "data_batch_1.bin",
        "data_batch_2.bin",
        "data_batch_3.bin",
        "data_batch_4.bin",
        "data_batch_5.bin",
        "test_batch.bin",
    ];
    for (idx, name) in names.iter().enumerate() {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        let records = if *name == "test_batch.bin" { 2 } else { 1 };
        for record in 0..records {
            file.write_all(&[(idx % 10) as u8]).unwrap();
            let pixels: Vec<u8> = (0..PIXELS)
                .map(|p| ((p * 3 + idx * 31 + record * 7) % 256) as u8)
                .collect();
            file.write_all(&pixels).unwrap();
        }
    }
}

fn config(root: &Path) -> SessionConfig {
    let data = root.join("data");
    fs::create_dir_all(&data).unwrap();
    cifar10_fixture(&data);
    SessionConfig {
        dataset_options: DatasetOptions::default()
            .with_root(&data)
            .with_batch_size(2),
        hparams: HyperParameters {
            enc_chs: vec![4, 4, 8],
            dec_chs: vec![8, 4],
            block_depth: 1,
            ..HyperParameters::default()
        },
        trainer: TrainerConfig {
            max_epochs: 1,
            ..TrainerConfig::default()
        },
        generator: Some(GeneratorSelection::named("strided-conv")),
        log_dir: root.join("attacker_logs"),
        save_dir: root.join("saved_models"),
        ..SessionConfig::default()
    }
}

fn records(path: &Path) -> Vec<MetricRecord> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn fit_saves_a_versioned_model_and_tests_on_generator_features() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let report = run(&config, &Registries::with_defaults()).unwrap();

    let fit = report.fit.as_ref().unwrap();
    assert_eq!(fit.epochs.len(), 1);
    assert_eq!(report.test_mode, "GanFeature");
    assert!(report.test_loss.is_finite() && report.test_loss >= 0.0);
    assert!(report.saved_model.ends_with("inference_attack_model_v0.json"));
    assert!(report.log_dir.ends_with("version_0"));
    assert!(report.log_dir.join("hparams.json").is_file());

    let metrics = records(&report.log_dir.join("metrics.jsonl"));
    // 4 training samples in batches of 2
    assert_eq!(metrics.iter().filter(|r| r.name == TOTAL_LOSS).count(), 2);
    assert_eq!(metrics.iter().filter(|r| r.name == RECONSTRUCTION_ERROR).count(), 1);

    let checkpoint = load_checkpoint(&report.saved_model).unwrap();
    assert_eq!(checkpoint.hparams, config.hparams);
}

#[test]
fn load_only_restores_and_swaps_the_generator() {
    let dir = tempfile::tempdir().unwrap();
    let fit_config = config(dir.path());
    let registries = Registries::with_defaults();
    let fitted = run(&fit_config, &registries).unwrap();

    let load_config = SessionConfig {
        generator: None,
        run_mode: RunMode::LoadOnly {
            checkpoint: fitted.saved_model.clone(),
            generator: Some(GeneratorSelection::named("strided-conv")),
        },
        ..fit_config
    };
    let report = run(&load_config, &registries).unwrap();
    assert!(report.fit.is_none());
    assert_eq!(report.test_mode, "GanFeature");
    assert!(report.saved_model.ends_with("inference_attack_model_v1.json"));
    assert!(report.log_dir.ends_with("version_1"));

    // identical weights and frozen stages give the same test error
    assert!((report.test_loss - fitted.test_loss).abs() < 1e-6);
}

#[test]
fn load_only_without_generator_falls_back_to_direct() {
    let dir = tempfile::tempdir().unwrap();
    let fit_config = config(dir.path());
    let registries = Registries::with_defaults();
    let fitted = run(&fit_config, &registries).unwrap();
    let report = run(
        &SessionConfig {
            generator: None,
            run_mode: RunMode::LoadOnly {
                checkpoint: fitted.saved_model,
                generator: None,
            },
            ..fit_config
        },
        &registries,
    )
    .unwrap();
    assert_eq!(report.test_mode, "Direct");
}

#[test]
fn missing_checkpoint_is_a_resource_error_naming_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nowhere.json");
    let config = SessionConfig {
        run_mode: RunMode::LoadOnly {
            checkpoint: missing.clone(),
            generator: None,
        },
        ..config(dir.path())
    };
    let err = run(&config, &Registries::with_defaults()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(err.to_string().contains(&missing.display().to_string()));
}

#[test]
fn unknown_generator_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        generator: Some(GeneratorSelection::named("stylegan")),
        ..config(dir.path())
    };
    let err = run(&config, &Registries::with_defaults()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("strided-conv"));
}
