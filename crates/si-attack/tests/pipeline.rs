// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use si_attack::metrics::{RECONSTRUCTION_ERROR, TOTAL_LOSS, VAL_LOSS};
use si_attack::{
    load_checkpoint, AttackMode, AttackResult, ErrorKind, FeatureGenerator, FrozenComponents,
    FrozenModule, GeneratorOutputs, HyperParameters, InversionModel, MemorySink, Trainer,
    TrainerConfig,
};
use si_config::SeedSource;
use si_nn::{Dataset, Tensor};
use si_tensor::FeatureMap;
use si_vision::ImageGeometry;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn small_hparams() -> HyperParameters {
    HyperParameters {
        enc_chs: vec![4, 4, 8],
        dec_chs: vec![8, 4],
        block_depth: 1,
        lr: 5e-3,
        ..HyperParameters::default()
    }
}

fn batch(size: usize) -> FeatureMap {
    FeatureMap::from_fn(size, 3, (32, 32), |b, c, y, x| {
        (((b * 7 + c * 11 + y * 3 + x * 5) % 17) as f32 / 8.5) - 1.0
    })
    .unwrap()
}

fn model(hparams: HyperParameters) -> InversionModel {
    let frozen = FrozenComponents::seeded(&hparams, 3, 6, SeedSource::new(3)).unwrap();
    InversionModel::new(hparams, frozen).unwrap()
}

/// Returns a fixed `[B, 6, 16, 16]` feature at position 1.
#[derive(Debug)]
struct MockGenerator;

impl FeatureGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    fn encoded_channels(&self) -> usize {
        6
    }

    fn generate(&self, images: &FeatureMap) -> AttackResult<GeneratorOutputs> {
        let encoded = FeatureMap::from_fn(images.batch(), 6, (16, 16), |b, c, y, x| {
            ((b + c + y * x) % 5) as f32 * 0.1
        })?;
        Ok(GeneratorOutputs::new(vec![images.clone(), encoded]))
    }
}

#[test]
fn direct_mode_reconstructs_a_cifar_sized_batch() {
    let mut model = model(small_hparams());
    let mut optimizer = model.configure_optimizer().unwrap();
    let images = batch(4);
    let out = model
        .training_step(&mut optimizer, AttackMode::Direct, &images, 0)
        .unwrap();
    assert_eq!(out.reconstruction.dims(), [4, 3, 32, 32]);
    assert!(out.loss >= 0.0);
    let val = model.validation_step(&images).unwrap();
    assert_eq!(val.reconstruction.dims(), [4, 3, 32, 32]);
    assert!(val.loss >= 0.0);
}

#[test]
fn gan_mode_with_a_mocked_generator_yields_images() {
    let mut model = model(small_hparams());
    model.set_generator(Some(Arc::new(MockGenerator))).unwrap();
    let out = model.test_step(&batch(4)).unwrap();
    assert_eq!(out.reconstruction.dims(), [4, 3, 32, 32]);
    assert!(out.loss.is_finite() && out.loss >= 0.0);
}

#[test]
fn frozen_stages_do_not_change_across_training() {
    let mut model = model(small_hparams());
    model.set_generator(Some(Arc::new(MockGenerator))).unwrap();
    let images = batch(2);
    let remap_before = model.frozen().remap.forward(&images).unwrap();
    let encoded_before = model.encode(AttackMode::GanFeature, &images).unwrap();
    let mut optimizer = model.configure_optimizer().unwrap();
    for step in 0..3 {
        model
            .training_step(&mut optimizer, AttackMode::Direct, &images, step)
            .unwrap();
    }
    assert_eq!(model.frozen().remap.forward(&images).unwrap(), remap_before);
    assert_eq!(model.encode(AttackMode::GanFeature, &images).unwrap(), encoded_before);
}

#[test]
fn trainer_emits_one_metric_per_step() {
    let mut dataset = Dataset::new();
    let images = batch(6).into_tensor();
    for b in 0..6 {
        let row = Tensor::from_vec(1, images.shape().1, images.row(b).to_vec()).unwrap();
        dataset.push(row, Tensor::from_vec(1, 1, vec![0.0]).unwrap());
    }
    let (train, val) = dataset.split_holdout(2, 11);
    let train = train.into_loader().batched(2).shuffle(5);
    let val = val.into_loader().batched(2);

    let mut model = model(small_hparams());
    model.set_generator(Some(Arc::new(MockGenerator))).unwrap();
    let mut optimizer = model.configure_optimizer().unwrap();
    let mut sink = MemorySink::new();
    let config = TrainerConfig {
        max_epochs: 2,
        early_stopping: None,
        ..TrainerConfig::default()
    };
    let mut trainer = Trainer::new(config, ImageGeometry::RGB_32, &mut sink);
    let summary = trainer.fit(&mut model, &mut optimizer, &train, &val).unwrap();
    assert_eq!(summary.epochs.len(), 2);
    assert!(!summary.stopped_early);
    assert_eq!(trainer.global_step(), 4);
    let test_loss = trainer.test(&mut model, AttackMode::GanFeature, &val).unwrap();
    assert!(test_loss >= 0.0);

    assert_eq!(sink.values(TOTAL_LOSS).len(), 4);
    assert_eq!(sink.values(VAL_LOSS).len(), 2);
    assert_eq!(sink.values(RECONSTRUCTION_ERROR).len(), 1);
}

#[test]
fn stop_flag_interrupts_before_the_first_step() {
    let mut dataset = Dataset::new();
    dataset.push(batch(1).into_tensor(), Tensor::from_vec(1, 1, vec![0.0]).unwrap());
    let loader = dataset.into_loader();
    let mut model = model(small_hparams());
    let before = model.trainable_state().unwrap();
    let mut optimizer = model.configure_optimizer().unwrap();
    let mut sink = MemorySink::new();
    let mut trainer = Trainer::new(TrainerConfig::default(), ImageGeometry::RGB_32, &mut sink)
        .with_stop_flag(Arc::new(AtomicBool::new(true)));
    let summary = trainer.fit(&mut model, &mut optimizer, &loader, &loader).unwrap();
    assert!(summary.interrupted);
    assert!(summary.epochs.is_empty());
    assert_eq!(model.trainable_state().unwrap(), before);
}

#[test]
fn checkpoint_without_a_hyperparameter_is_a_resource_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attacker.json");
    let model = model(small_hparams());
    si_attack::save_checkpoint(&path, model.hparams(), model.trainable()).unwrap();

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    document["hparams"].as_object_mut().unwrap().remove("enc_chs");
    std::fs::write(&path, document.to_string()).unwrap();

    let err = load_checkpoint(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(err.to_string().contains("enc_chs"));
}

#[test]
fn restored_checkpoint_reproduces_reconstructions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attacker.json");
    let mut trained = model(small_hparams());
    let mut optimizer = trained.configure_optimizer().unwrap();
    trained
        .training_step(&mut optimizer, AttackMode::Direct, &batch(2), 0)
        .unwrap();
    si_attack::save_checkpoint(&path, trained.hparams(), trained.trainable()).unwrap();

    let checkpoint = load_checkpoint(&path).unwrap();
    let mut restored = model(checkpoint.hparams.clone());
    restored.load_trainable(&checkpoint.parameters).unwrap();
    let images = batch(2);
    assert_eq!(
        restored.reconstruct(AttackMode::Direct, &images).unwrap(),
        trained.reconstruct(AttackMode::Direct, &images).unwrap()
    );
}
