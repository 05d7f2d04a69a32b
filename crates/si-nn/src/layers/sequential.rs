// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use si_tensor::{PureResult, Tensor};
use std::fmt;

/// Ordered chain of layers applied one after another.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequential")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Input of every layer except the first, in order. Backward needs these
    /// because layers keep no activation caches.
    fn trace(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut inputs = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let Some((_, head)) = self.layers.split_last() else {
            return Ok(inputs);
        };
        for layer in head {
            let next = layer.forward(inputs.last().unwrap_or(input))?;
            inputs.push(next);
        }
        Ok(inputs)
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.layers
            .iter()
            .try_fold(input.clone(), |activation, layer| layer.forward(&activation))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let inputs = self.trace(input)?;
        let mut grad = grad_output.clone();
        for (idx, layer) in self.layers.iter_mut().enumerate().rev() {
            let layer_input = match idx {
                0 => input,
                _ => &inputs[idx - 1],
            };
            grad = layer.backward(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.layers
            .iter()
            .try_for_each(|layer| layer.visit_parameters(visitor))
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.layers
            .iter_mut()
            .try_for_each(|layer| layer.visit_parameters_mut(visitor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Conv2d, Relu};

    fn stack() -> Sequential {
        let mut seq = Sequential::new();
        seq.push(Conv2d::same_3x3("stack.conv0", 2, 3, (4, 4), Some(1)).unwrap());
        seq.push(Relu::new());
        seq.push(Conv2d::same_3x3("stack.conv1", 3, 3, (4, 4), Some(2)).unwrap());
        seq
    }

    #[test]
    fn chains_layers_and_reaches_every_parameter() {
        let mut seq = stack();
        let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(7)).unwrap();
        let output = seq.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 3 * 16));

        let grad_in = seq.backward(&input, &output).unwrap();
        assert_eq!(grad_in.shape(), input.shape());
        let mut names = Vec::new();
        seq.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} has no gradient", param.name());
            names.push(param.name().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            names,
            ["stack.conv0::weight", "stack.conv0::bias", "stack.conv1::weight", "stack.conv1::bias"]
        );
    }

    #[test]
    fn empty_chain_is_the_identity() {
        let mut seq = Sequential::new();
        let input = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        assert_eq!(seq.forward(&input).unwrap(), input);
        assert_eq!(seq.backward(&input, &input).unwrap(), input);
        assert!(seq.is_empty());
    }
}
