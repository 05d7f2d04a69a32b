// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision components for SpiralInversion.
//!
//! [`models`] holds the U-Net used to reconstruct images from encoded
//! features: a stack of [`models::ConvBlock`]s arranged into an
//! [`models::Encoder`] pyramid and a skip-connected [`models::Decoder`].
//! [`datasets`] reads CIFAR-10, CIFAR-100 and CelebA from disk into
//! [`si_nn::DataLoader`]s.

pub mod datasets;
pub mod models;

pub use datasets::{DatasetKind, DatasetOptions, ImageGeometry, LoadedDataset};
pub use models::{ConvBlock, Decoder, Encoder, ReconstructionHead, UNet, UNetConfig};
