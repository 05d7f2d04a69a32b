// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! U-Net building blocks implemented on top of the `si-nn` module stack.
//!
//! Every component exposes a `FeatureMap` API that checks channel counts and
//! spatial extents, and the composite [`UNet`] also implements
//! [`si_nn::Module`] so optimisers and checkpoint helpers can drive it.

mod block;
mod decoder;
mod encoder;
mod unet;

pub use self::block::{ConvBlock, DEFAULT_BLOCK_DEPTH};
pub use self::decoder::Decoder;
pub use self::encoder::Encoder;
pub use self::unet::{ReconstructionHead, UNet, UNetConfig};

/// `(channels, (height, width))` of one feature map.
pub type Geometry = (usize, (usize, usize));
