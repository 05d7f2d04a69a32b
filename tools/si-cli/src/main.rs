use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueHint};
use si_attack::{
    run, EarlyStopping, GeneratorSelection, HyperParameters, Registries, RunMode, SessionConfig,
    TrainerConfig,
};
use si_config::tracing::{flush_chrome_trace, init_tracing_with, TracingOptions};
use si_vision::{DatasetKind, DatasetOptions};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Train and evaluate U-Net model-inversion attackers"
)]
struct Cli {
    /// Registered attacker model
    #[arg(long, default_value = "UNet")]
    model: String,

    /// Dataset to reconstruct (CIFAR-10, CIFAR-100 or CelebA)
    #[arg(long, default_value = "CIFAR-10")]
    dataset: String,

    /// Directory holding the dataset files
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    data_root: PathBuf,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Background prefetch depth; 0 loads batches inline
    #[arg(long, default_value_t = 0)]
    num_workers: usize,

    /// Caps the number of images read per split
    #[arg(long)]
    max_samples: Option<usize>,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 3e-4)]
    lr: f32,

    /// Anonymity level of the upstream encoder, recorded with the checkpoint
    #[arg(long, default_value_t = 2)]
    k: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = "attacker_logs", value_hint = ValueHint::DirPath)]
    log_dir: PathBuf,

    #[arg(long, default_value = "saved_models", value_hint = ValueHint::DirPath)]
    save_dir: PathBuf,

    /// Restore an attacker checkpoint and only run the test phase
    #[arg(long, value_hint = ValueHint::FilePath)]
    load_dict: Option<PathBuf>,

    /// Registered generator whose encoded features are inverted at test time
    #[arg(long)]
    generator: Option<String>,

    /// State-dict file for the generator
    #[arg(long, value_hint = ValueHint::FilePath, requires = "generator")]
    generator_weights: Option<PathBuf>,

    /// State-dict file for the frozen channel remap
    #[arg(long, value_hint = ValueHint::FilePath)]
    remap_weights: Option<PathBuf>,

    /// State-dict file for the frozen feature reduction
    #[arg(long, value_hint = ValueHint::FilePath)]
    reduction_weights: Option<PathBuf>,

    /// Log every step at info level
    #[arg(long)]
    progress_bar: bool,

    /// Train for exactly --epochs epochs
    #[arg(long = "no-early-stopping", action = ArgAction::SetFalse, default_value_t = true)]
    early_stopping: bool,

    /// Skip the non-finite loss and gradient checks
    #[arg(long = "no-anomaly-detection", action = ArgAction::SetFalse, default_value_t = true)]
    anomaly_detection: bool,

    /// Write a Chrome trace of the run to this file
    #[arg(long, value_hint = ValueHint::FilePath)]
    trace_chrome: Option<PathBuf>,
}

impl Cli {
    fn session(&self) -> Result<SessionConfig> {
        if self.dataset.parse::<DatasetKind>().is_err() {
            let known: Vec<&str> = DatasetKind::ALL.iter().map(DatasetKind::as_str).collect();
            bail!("unknown dataset `{}`; available: {}", self.dataset, known.join(", "));
        }
        let mut dataset_options = DatasetOptions::default()
            .with_root(&self.data_root)
            .with_batch_size(self.batch_size)
            .with_seed(self.seed);
        dataset_options.num_workers = self.num_workers;
        dataset_options.max_samples = self.max_samples;

        let hparams = HyperParameters {
            lr: self.lr,
            k: self.k,
            seed: self.seed,
            ..HyperParameters::default()
        };
        let trainer = TrainerConfig {
            max_epochs: self.epochs,
            early_stopping: self.early_stopping.then(EarlyStopping::default),
            progress_bar: self.progress_bar,
            anomaly_detection: self.anomaly_detection,
        };
        let generator = self.generator.as_ref().map(|name| GeneratorSelection {
            name: name.clone(),
            weights: self.generator_weights.clone(),
        });
        let run_mode = match &self.load_dict {
            Some(checkpoint) => RunMode::LoadOnly {
                checkpoint: checkpoint.clone(),
                generator: None,
            },
            None => RunMode::Fit,
        };
        Ok(SessionConfig {
            model: self.model.clone(),
            dataset: self.dataset.clone(),
            dataset_options,
            hparams,
            trainer,
            run_mode,
            generator,
            remap_weights: self.remap_weights.clone(),
            reduction_weights: self.reduction_weights.clone(),
            log_dir: self.log_dir.clone(),
            save_dir: self.save_dir.clone(),
        })
    }
}

fn main() {
    if let Err(err) = try_main() {
        flush_chrome_trace();
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
    flush_chrome_trace();
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with(&TracingOptions {
        default_directive: None,
        chrome_trace: cli.trace_chrome.clone(),
    })?;
    let config = cli.session()?;
    let report = run(&config, &Registries::with_defaults())
        .with_context(|| format!("attacker run on {} failed", config.dataset))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_training_script() {
        let cli = Cli::try_parse_from(["si-attack"]).unwrap();
        let config = cli.session().unwrap();
        assert_eq!(config.dataset, "CIFAR-10");
        assert_eq!(config.dataset_options.batch_size, 64);
        assert_eq!(config.trainer.max_epochs, 10);
        assert_eq!(config.hparams.k, 2);
        assert_eq!(config.log_dir, PathBuf::from("attacker_logs"));
        assert_eq!(config.run_mode, RunMode::Fit);
        assert!(config.trainer.early_stopping.is_some());
    }

    #[test]
    fn load_dict_selects_load_only() {
        let cli = Cli::try_parse_from([
            "si-attack",
            "--load-dict",
            "saved_models/inference_attack_model_v0.json",
            "--generator",
            "strided-conv",
            "--no-early-stopping",
        ])
        .unwrap();
        let config = cli.session().unwrap();
        assert!(matches!(config.run_mode, RunMode::LoadOnly { .. }));
        assert_eq!(config.generator.unwrap().name, "strided-conv");
        assert!(config.trainer.early_stopping.is_none());
    }

    #[test]
    fn unknown_dataset_is_rejected_up_front() {
        let cli = Cli::try_parse_from(["si-attack", "--dataset", "MNIST"]).unwrap();
        let err = cli.session().unwrap_err();
        assert!(err.to_string().contains("CIFAR-100"));
    }

    #[test]
    fn generator_weights_need_a_generator() {
        assert!(Cli::try_parse_from(["si-attack", "--generator-weights", "g.bin"]).is_err());
    }
}
