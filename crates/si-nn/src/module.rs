// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use si_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;
use std::fmt;

/// Named weight tensor plus the gradient accumulated since the last reset.
///
/// Names follow `{layer}::weight` / `{layer}::bias`, with layer paths such as
/// `encoder.block0.conv3`; checkpoints are keyed by them.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("shape", &self.value.shape())
            .field("has_grad", &self.gradient.is_some())
            .finish()
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Adds `update` into the gradient accumulator.
    pub fn accumulate(&mut self, update: &Tensor) -> PureResult<()> {
        if update.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: update.shape(),
                right: self.value.shape(),
            });
        }
        match self.gradient.as_mut() {
            Some(grad) => grad.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Drops the accumulated gradient.
    pub fn zero_gradient(&mut self) {
        self.gradient = None;
    }

    /// Overwrites the value with `value`, which must have the same shape.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if value.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: value.shape(),
                right: self.value.shape(),
            });
        }
        self.value = value.clone();
        Ok(())
    }
}

/// Differentiable computation with named parameters.
///
/// `backward` receives the same input that was passed to `forward` and is free
/// to recompute intermediate activations; layers keep no per-call caches so a
/// shared reference is enough to run inference.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations should populate the
    /// relevant parameter accumulators before returning the gradient with
    /// respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Total number of scalar weights.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0usize;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Affine {
        scale: Parameter,
    }

    impl Module for Affine {
        fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
            let mut out = input.clone();
            out.data_mut().iter_mut().for_each(|x| *x *= self.scale.value().data()[0]);
            Ok(out)
        }

        fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
            let dot: f32 = input.data().iter().zip(grad_output.data()).map(|(x, g)| x * g).sum();
            self.scale.accumulate(&Tensor::from_vec(1, 1, vec![dot])?)?;
            let mut grad = grad_output.clone();
            grad.data_mut().iter_mut().for_each(|g| *g *= self.scale.value().data()[0]);
            Ok(grad)
        }

        fn visit_parameters(
            &self,
            visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            visitor(&self.scale)
        }

        fn visit_parameters_mut(
            &mut self,
            visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
        ) -> PureResult<()> {
            visitor(&mut self.scale)
        }
    }

    fn affine(scale: f32) -> Affine {
        Affine {
            scale: Parameter::new("head::weight", Tensor::from_vec(1, 1, vec![scale]).unwrap()),
        }
    }

    #[test]
    fn gradients_accumulate_until_reset() {
        let mut module = affine(2.0);
        let input = Tensor::from_vec(1, 2, vec![1.0, 3.0]).unwrap();
        let ones = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        module.backward(&input, &ones).unwrap();
        module.backward(&input, &ones).unwrap();
        assert_eq!(module.scale.gradient().unwrap().data(), &[8.0]);
        module.zero_accumulators().unwrap();
        assert!(module.scale.gradient().is_none());
        assert!(module.scale.accumulate(&Tensor::zeros(1, 2).unwrap()).is_err());
    }

    #[test]
    fn state_dict_round_trips_and_names_missing_keys() {
        let source = affine(0.5);
        let mut target = affine(4.0);
        target.load_state_dict(&source.state_dict().unwrap()).unwrap();
        assert_eq!(target.scale.value().data(), &[0.5]);
        assert_eq!(target.parameter_count().unwrap(), 1);

        match target.load_state_dict(&HashMap::new()) {
            Err(TensorError::MissingParameter { name }) => assert_eq!(name, "head::weight"),
            other => panic!("unexpected {other:?}"),
        }
        let mut wrong = HashMap::new();
        wrong.insert("head::weight".to_string(), Tensor::zeros(2, 1).unwrap());
        assert!(target.load_state_dict(&wrong).is_err());
    }
}
