// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust tensor primitives with only lightweight external dependencies.
//!
//! Tensors are two dimensional and row-major. Image batches keep one sample per
//! row and flatten `channels × height × width` into the columns; [`FeatureMap`]
//! carries the channel count and spatial extent alongside the raw tensor so
//! that convolutional code can index planes without re-deriving geometry.

mod pure;
pub mod resample;
pub mod spatial;

pub use pure::{PureResult, Tensor, TensorError};
pub use resample::Interpolation;
pub use spatial::FeatureMap;
