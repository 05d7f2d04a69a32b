// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use si_tensor::TensorError;
use std::path::PathBuf;
use thiserror::Error;

pub type AttackResult<T> = std::result::Result<T, AttackError>;

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The run was set up inconsistently: unknown names, incompatible channel
    /// schedules, crops that would need padding, a missing generator.
    Configuration,
    /// Something on disk is missing or malformed.
    Resource,
    /// A non-finite loss or gradient was detected.
    Numerical,
}

#[derive(Debug, Error)]
pub enum AttackError {
    #[error("unknown {registry} `{name}`; available: {available}")]
    UnknownName {
        registry: &'static str,
        name: String,
        available: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("GAN-feature reconstruction needs a frozen generator, none is attached")]
    MissingGenerator,
    #[error("generator returned {got} outputs; the encoded feature lives at index 1")]
    GeneratorArity { got: usize },
    #[error("hyperparameter `{key}` is missing from {}", path.display())]
    MissingHyperParameter { key: String, path: PathBuf },
    #[error("{}: {message}", path.display())]
    Resource { path: PathBuf, message: String },
    #[error("non-finite {what} at step {step}: {value}")]
    Anomaly {
        what: String,
        step: usize,
        value: f32,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl AttackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttackError::UnknownName { .. }
            | AttackError::Config(_)
            | AttackError::MissingGenerator
            | AttackError::GeneratorArity { .. } => ErrorKind::Configuration,
            AttackError::MissingHyperParameter { .. } | AttackError::Resource { .. } => {
                ErrorKind::Resource
            }
            AttackError::Anomaly { .. } => ErrorKind::Numerical,
            AttackError::Tensor(err) => tensor_kind(err),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        AttackError::Config(message.into())
    }

    pub fn resource(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        AttackError::Resource {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

fn tensor_kind(err: &TensorError) -> ErrorKind {
    match err {
        TensorError::IoError { .. }
        | TensorError::SerializationError { .. }
        | TensorError::MissingParameter { .. } => ErrorKind::Resource,
        TensorError::NonFiniteValue { .. } => ErrorKind::Numerical,
        _ => ErrorKind::Configuration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_errors_are_classified() {
        let crop: AttackError = TensorError::CropExceedsSource {
            source_hw: (2, 2),
            target_hw: (4, 4),
        }
        .into();
        assert_eq!(crop.kind(), ErrorKind::Configuration);
        let io: AttackError = TensorError::IoError {
            message: "gone".into(),
        }
        .into();
        assert_eq!(io.kind(), ErrorKind::Resource);
        let nan: AttackError = TensorError::NonFiniteValue {
            label: "loss",
            value: f32::NAN,
        }
        .into();
        assert_eq!(nan.kind(), ErrorKind::Numerical);
    }

    #[test]
    fn missing_hyperparameter_names_key_and_file() {
        let err = AttackError::MissingHyperParameter {
            key: "out_sz".into(),
            path: PathBuf::from("ckpt/model.json"),
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        let message = err.to_string();
        assert!(message.contains("out_sz") && message.contains("ckpt/model.json"));
    }
}
