// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use si_tensor::{PureResult, Tensor, TensorError};

/// Elementwise `max(x, 0)`. Placed between the convolutions of a block.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relu;

impl Relu {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = input.shape();
        Tensor::from_vec(rows, cols, input.data().iter().map(|x| x.max(0.0)).collect())
    }

    /// Passes the gradient where the input was strictly positive.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let mut grad = grad_output.clone();
        for (g, x) in grad.data_mut().iter_mut().zip(input.data()) {
            if *x <= 0.0 {
                *g = 0.0;
            }
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_negatives_and_masks_their_gradient() {
        let mut relu = Relu::new();
        let input = Tensor::from_vec(2, 2, vec![-2.0, 0.0, 0.25, 3.0]).unwrap();
        assert_eq!(relu.forward(&input).unwrap().data(), &[0.0, 0.0, 0.25, 3.0]);
        let grad = Tensor::from_vec(2, 2, vec![0.5, 0.5, 0.5, -1.0]).unwrap();
        assert_eq!(relu.backward(&input, &grad).unwrap().data(), &[0.0, 0.0, 0.5, -1.0]);
        assert_eq!(relu.parameter_count().unwrap(), 0);
    }
}
