// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! First-order optimisers driven by the gradients stored on [`Parameter`]s.

use crate::module::{Module, Parameter};
use si_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Hyperparameters of [`Adam`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug)]
struct Moments {
    first: Tensor,
    second: Tensor,
    steps: u32,
}

/// Adam with bias-corrected moment estimates and a fixed learning rate.
///
/// Moment buffers are keyed by parameter name, so one optimiser can only ever
/// update the parameters of the module it is stepped with. Parameters without
/// an accumulated gradient are left untouched and do not advance their step
/// counter.
#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    moments: HashMap<String, Moments>,
}

impl Adam {
    /// Creates an optimiser with the default betas and epsilon.
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        Self::with_config(AdamConfig::with_learning_rate(learning_rate))
    }

    pub fn with_config(config: AdamConfig) -> PureResult<Self> {
        if !(config.learning_rate > 0.0) || !config.learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: config.learning_rate,
            });
        }
        if !(0.0..1.0).contains(&config.beta1) {
            return Err(TensorError::InvalidValue { label: "adam_beta1" });
        }
        if !(0.0..1.0).contains(&config.beta2) {
            return Err(TensorError::InvalidValue { label: "adam_beta2" });
        }
        if !(config.epsilon > 0.0) {
            return Err(TensorError::InvalidValue {
                label: "adam_epsilon",
            });
        }
        Ok(Self {
            config,
            moments: HashMap::new(),
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }

    /// Number of parameters that currently own moment buffers.
    pub fn tracked_parameters(&self) -> usize {
        self.moments.len()
    }

    /// Clears every gradient accumulator of `module`.
    pub fn zero_grad<M: Module + ?Sized>(&self, module: &mut M) -> PureResult<()> {
        module.zero_accumulators()
    }

    /// Applies one update to every parameter of `module` that carries a gradient.
    pub fn step<M: Module + ?Sized>(&mut self, module: &mut M) -> PureResult<()> {
        module.visit_parameters_mut(&mut |param| self.update(param))
    }

    fn update(&mut self, param: &mut Parameter) -> PureResult<()> {
        let Some(grad) = param.gradient().cloned() else {
            return Ok(());
        };
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let shape = param.value().shape();
        if !self.moments.contains_key(param.name()) {
            let fresh = Moments {
                first: Tensor::zeros(shape.0, shape.1)?,
                second: Tensor::zeros(shape.0, shape.1)?,
                steps: 0,
            };
            self.moments.insert(param.name().to_string(), fresh);
        }
        let Some(moments) = self.moments.get_mut(param.name()) else {
            return Err(TensorError::MissingParameter {
                name: param.name().to_string(),
            });
        };
        if moments.first.shape() != shape {
            return Err(TensorError::ShapeMismatch {
                left: moments.first.shape(),
                right: shape,
            });
        }
        moments.steps += 1;
        let correction1 = 1.0 - beta1.powi(moments.steps as i32);
        let correction2 = 1.0 - beta2.powi(moments.steps as i32);
        let first = moments.first.data_mut();
        let second = moments.second.data_mut();
        let values = param.value_mut().data_mut();
        for (((value, m), v), g) in values
            .iter_mut()
            .zip(first.iter_mut())
            .zip(second.iter_mut())
            .zip(grad.data().iter())
        {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *value -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Conv2d;
    use crate::loss::{Loss, MeanSquaredError};
    use approx::assert_abs_diff_eq;

    #[test]
    fn rejects_non_positive_learning_rate() {
        assert!(matches!(
            Adam::new(0.0),
            Err(TensorError::NonPositiveLearningRate { .. })
        ));
        assert!(Adam::new(-1e-3).is_err());
        assert!(Adam::new(f32::NAN).is_err());
    }

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient_sign() {
        let mut conv = Conv2d::pointwise("p", 1, 1, (1, 2), Some(0)).unwrap();
        let before = conv.state_dict().unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, -2.0]).unwrap();
        let output = conv.forward(&input).unwrap();
        let target = Tensor::zeros(1, 2).unwrap();
        let grad = MeanSquaredError::new().backward(&output, &target).unwrap();
        conv.backward(&input, &grad).unwrap();
        let mut adam = Adam::new(0.1).unwrap();
        adam.step(&mut conv).unwrap();
        assert_eq!(adam.tracked_parameters(), 2);
        conv.visit_parameters(&mut |param| {
            let old = before[param.name()].data()[0];
            let g = param.gradient().unwrap().data()[0];
            let moved = param.value().data()[0] - old;
            // bias-corrected first step is lr * sign(g)
            assert_abs_diff_eq!(moved, -0.1 * g.signum(), epsilon = 1e-4);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn parameters_without_gradients_are_skipped() {
        let mut conv = Conv2d::pointwise("p", 2, 2, (2, 2), Some(1)).unwrap();
        let before = conv.state_dict().unwrap();
        let mut adam = Adam::new(1e-2).unwrap();
        adam.step(&mut conv).unwrap();
        assert_eq!(adam.tracked_parameters(), 0);
        assert_eq!(conv.state_dict().unwrap(), before);
    }

    #[test]
    fn repeated_steps_reduce_a_quadratic_loss() {
        let mut conv = Conv2d::pointwise("p", 2, 2, (2, 2), Some(5)).unwrap();
        let input = Tensor::random_uniform(4, 8, -1.0, 1.0, Some(6)).unwrap();
        let target = Tensor::random_uniform(4, 8, -0.5, 0.5, Some(7)).unwrap();
        let mut loss = MeanSquaredError::new();
        let mut adam = Adam::new(5e-2).unwrap();
        let initial = loss.value(&conv.forward(&input).unwrap(), &target).unwrap();
        for _ in 0..50 {
            adam.zero_grad(&mut conv).unwrap();
            let output = conv.forward(&input).unwrap();
            let grad = loss.backward(&output, &target).unwrap();
            conv.backward(&input, &grad).unwrap();
            adam.step(&mut conv).unwrap();
        }
        let last = loss.value(&conv.forward(&input).unwrap(), &target).unwrap();
        assert!(last < initial);
    }
}
