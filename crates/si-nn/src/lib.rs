// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural building blocks on top of `si-tensor`: parameters and the [`Module`]
//! trait, convolutional layers, losses, the Adam optimiser, state-dict
//! persistence and the batching [`dataset::DataLoader`].

pub mod dataset;
pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use dataset::{DataLoader, Dataset};
pub use layers::{Conv2d, ConvTranspose2d, MaxPool2d, Relu, Sequential};
pub use loss::{Loss, MeanSquaredError};
pub use module::{Module, Parameter};
pub use optim::{Adam, AdamConfig};
pub use si_tensor::{FeatureMap, PureResult, Tensor, TensorError};
