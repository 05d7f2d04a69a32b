// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use si_tensor::{PureResult, Tensor, TensorError};

/// Mean of squared differences over every pixel of every sample. Used for
/// training, validation and test reconstructions alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn new() -> Self {
        Self
    }
}

fn check_shapes(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
    if prediction.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            left: prediction.shape(),
            right: target.shape(),
        });
    }
    Ok(())
}

impl Loss for MeanSquaredError {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        check_shapes(prediction, target)?;
        let sum: f64 = prediction
            .data()
            .iter()
            .zip(target.data().iter())
            .map(|(pred, tgt)| {
                let diff = (pred - tgt) as f64;
                diff * diff
            })
            .sum();
        let mean = sum / prediction.len() as f64;
        Tensor::from_vec(1, 1, vec![mean as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        check_shapes(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let inv = 2.0f32 / (rows * cols) as f32;
        let data = prediction
            .data()
            .iter()
            .zip(target.data().iter())
            .map(|(pred, tgt)| (pred - tgt) * inv)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}
