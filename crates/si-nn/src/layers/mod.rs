// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod sequential;

pub use activation::Relu;
pub use conv::{Conv2d, ConvTranspose2d, MaxPool2d};
pub use sequential::Sequential;
