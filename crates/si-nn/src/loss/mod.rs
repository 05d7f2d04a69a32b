// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reconstruction losses over row-major batches.

mod mean_squared_error;

use si_tensor::{PureResult, Tensor};

pub use mean_squared_error::MeanSquaredError;

pub trait Loss {
    /// Reduced loss as a `1×1` tensor.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Gradient with respect to `prediction`, shaped like it.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// [`Loss::forward`] unwrapped to a scalar.
    fn value(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<f32> {
        Ok(self.forward(prediction, target)?.data()[0])
    }
}
