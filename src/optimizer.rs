//! Gradient-based parameter update rules.
//!
//! Every rule keeps its own accumulators per parameter tensor and never mixes
//! state between tensors. Gradients arrive summed over a batch, so the
//! learning rate is divided by the batch size before it is applied.

use std::str::FromStr;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Tensor;

/// Update rule and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Sgd {
        learning_rate: f64,
    },
    Momentum {
        learning_rate: f64,
        momentum: f64,
        nesterov: bool,
    },
    Adagrad {
        learning_rate: f64,
        epsilon: f64,
    },
    #[serde(rename = "rmsprop")]
    RmsProp {
        learning_rate: f64,
        decay: f64,
        epsilon: f64,
    },
    Adam {
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f64) -> Self {
        OptimizerConfig::Sgd { learning_rate }
    }

    pub fn momentum(learning_rate: f64, momentum: f64, nesterov: bool) -> Self {
        OptimizerConfig::Momentum { learning_rate, momentum, nesterov }
    }

    pub fn adagrad(learning_rate: f64) -> Self {
        OptimizerConfig::Adagrad { learning_rate, epsilon: 1e-8 }
    }

    pub fn rmsprop(learning_rate: f64) -> Self {
        OptimizerConfig::RmsProp { learning_rate, decay: 0.9, epsilon: 1e-8 }
    }

    pub fn adam(learning_rate: f64) -> Self {
        OptimizerConfig::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match *self {
            OptimizerConfig::Sgd { learning_rate }
            | OptimizerConfig::Momentum { learning_rate, .. }
            | OptimizerConfig::Adagrad { learning_rate, .. }
            | OptimizerConfig::RmsProp { learning_rate, .. }
            | OptimizerConfig::Adam { learning_rate, .. } => learning_rate,
        }
    }

    fn validate(&self) -> Result<()> {
        let lr = self.learning_rate();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::config(format!("learning rate must be positive, got {lr}")));
        }
        let unit = |name: &str, v: f64| {
            if (0.0..1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::config(format!("{name} must lie in [0, 1), got {v}")))
            }
        };
        match *self {
            OptimizerConfig::Momentum { momentum, .. } => unit("momentum", momentum),
            OptimizerConfig::RmsProp { decay, .. } => unit("decay", decay),
            OptimizerConfig::Adam { beta1, beta2, .. } => {
                unit("beta1", beta1)?;
                unit("beta2", beta2)
            }
            _ => Ok(()),
        }
    }

    /// Number of accumulator tensors kept per parameter.
    fn slots(&self) -> usize {
        match self {
            OptimizerConfig::Sgd { .. } => 0,
            OptimizerConfig::Adam { .. } => 2,
            _ => 1,
        }
    }
}

impl FromStr for OptimizerConfig {
    type Err = Error;

    /// Looks a rule up by name with its customary defaults.
    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerConfig::sgd(0.01)),
            "momentum" => Ok(OptimizerConfig::momentum(0.01, 0.9, false)),
            "nesterov" => Ok(OptimizerConfig::momentum(0.01, 0.9, true)),
            "adagrad" => Ok(OptimizerConfig::adagrad(0.01)),
            "rmsprop" => Ok(OptimizerConfig::rmsprop(0.001)),
            "adam" => Ok(OptimizerConfig::adam(0.001)),
            other => Err(Error::config(format!("unknown optimizer '{other}'"))),
        }
    }
}

/// Optimizer bound to a network's parameter list.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    /// velocity / squared-gradient sum / first moment
    first: Vec<Tensor>,
    /// Adam's second moment
    second: Vec<Tensor>,
    steps: u64,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            first: Vec::new(),
            second: Vec::new(),
            steps: 0,
        })
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::new(name.parse()?)
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Allocates zeroed accumulators shaped like the given parameters.
    pub fn attach(&mut self, shapes: &[&[usize]]) {
        let zeros = || shapes.iter().map(|s| Tensor::zeros(s.to_vec())).collect::<Vec<_>>();
        self.first = if self.config.slots() >= 1 { zeros() } else { Vec::new() };
        self.second = if self.config.slots() == 2 { zeros() } else { Vec::new() };
        self.steps = 0;
    }

    /// Zeroes every accumulator without changing the attached shapes.
    pub fn reset(&mut self) {
        self.first.iter_mut().chain(self.second.iter_mut()).for_each(|t| t.fill(0.0));
        self.steps = 0;
    }

    /// Applies one update in place.
    pub fn optimize(&mut self, params: Vec<&mut Tensor>, grads: &[Tensor], batch_size: usize) -> Result<()> {
        if params.len() != grads.len() {
            return Err(Error::shape(format!(
                "optimizer received {} parameters but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if self.config.slots() > 0 && self.first.len() != params.len() {
            return Err(Error::state("optimizer is not attached to this parameter set"));
        }
        for (param, grad) in params.iter().zip(grads) {
            if param.shape() != grad.shape() {
                return Err(Error::shape(format!(
                    "gradient shape {:?} does not match parameter shape {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }
        }

        let eta = self.config.learning_rate() / batch_size.max(1) as f64;
        self.steps = self.steps.saturating_add(1);

        for (i, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            match self.config {
                OptimizerConfig::Sgd { .. } => {
                    param.scaled_add(-eta, grad);
                }
                OptimizerConfig::Momentum { momentum, nesterov, .. } => {
                    let velocity = &mut self.first[i];
                    Zip::from(&mut *velocity)
                        .and(grad)
                        .for_each(|v, &g| *v = momentum * *v - eta * g);
                    if nesterov {
                        // look-ahead step: p += μv − ηg
                        Zip::from(param)
                            .and(&*velocity)
                            .and(grad)
                            .for_each(|p, &v, &g| *p += momentum * v - eta * g);
                    } else {
                        *param += &*velocity;
                    }
                }
                OptimizerConfig::Adagrad { epsilon, .. } => {
                    Zip::from(param)
                        .and(&mut self.first[i])
                        .and(grad)
                        .for_each(|p, s, &g| {
                            *s += g * g;
                            *p -= eta * g / (s.sqrt() + epsilon);
                        });
                }
                OptimizerConfig::RmsProp { decay, epsilon, .. } => {
                    Zip::from(param)
                        .and(&mut self.first[i])
                        .and(grad)
                        .for_each(|p, s, &g| {
                            *s = decay * *s + (1.0 - decay) * g * g;
                            *p -= eta * g / (s.sqrt() + epsilon);
                        });
                }
                OptimizerConfig::Adam { beta1, beta2, epsilon, .. } => {
                    let m_correction = 1.0 - beta1.powf(self.steps as f64);
                    let v_correction = 1.0 - beta2.powf(self.steps as f64);
                    Zip::from(param)
                        .and(&mut self.first[i])
                        .and(&mut self.second[i])
                        .and(grad)
                        .for_each(|p, m, v, &g| {
                            *m = beta1 * *m + (1.0 - beta1) * g;
                            *v = beta2 * *v + (1.0 - beta2) * g * g;
                            let m_hat = *m / m_correction;
                            let v_hat = *v / v_correction;
                            *p -= eta * m_hat / (v_hat.sqrt() + epsilon);
                        });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, ArrayD, IxDyn};

    fn single(config: OptimizerConfig, value: f64) -> (Optimizer, Tensor) {
        let mut optimizer = Optimizer::new(config).unwrap();
        let param = ArrayD::from_elem(IxDyn(&[3, 2]), value);
        optimizer.attach(&[param.shape()]);
        (optimizer, param)
    }

    #[test]
    fn test_sgd_update() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::sgd(0.01), 1.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));
        optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();

        assert!((weights[[0, 0]] - 0.99).abs() < 1e-10);
    }

    #[test]
    fn sgd_scales_by_batch_size() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::sgd(0.1), 1.0);
        let gradients = ArrayD::from_elem(IxDyn(&[3, 2]), 4.0);
        optimizer.optimize(vec![&mut weights], &[gradients], 4).unwrap();
        assert_relative_eq!(weights[[2, 1]], 0.9, epsilon = 1e-12);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::momentum(0.1, 0.5, false), 0.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));
        optimizer.optimize(vec![&mut weights], &[gradients.clone()], 1).unwrap();
        assert_relative_eq!(weights[[0, 0]], -0.1, epsilon = 1e-12);
        optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();
        // v = 0.5 * -0.1 - 0.1
        assert_relative_eq!(weights[[0, 0]], -0.25, epsilon = 1e-12);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::momentum(0.1, 0.5, true), 0.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));
        optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();
        // v = -0.1; p += 0.5 * -0.1 - 0.1
        assert_relative_eq!(weights[[1, 1]], -0.15, epsilon = 1e-12);
    }

    #[test]
    fn adagrad_and_rmsprop_normalise_the_step() {
        for config in [OptimizerConfig::adagrad(0.1), OptimizerConfig::rmsprop(0.1)] {
            let (mut optimizer, mut weights) = single(config, 1.0);
            let gradients = ArrayD::from_elem(IxDyn(&[3, 2]), 100.0);
            optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();
            assert!(weights[[0, 0]] < 1.0);
            // step is bounded by lr / sqrt(1 - decay) regardless of gradient size
            assert!(weights[[0, 0]] > 1.0 - 0.1 / (0.1f64).sqrt() - 1e-9);
        }
    }

    #[test]
    fn adam_step_counter_outlives_i32_and_saturates() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::adam(0.001), 1.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));

        optimizer.steps = i32::MAX as u64;
        optimizer.optimize(vec![&mut weights], &[gradients.clone()], 1).unwrap();
        assert_eq!(optimizer.steps, i32::MAX as u64 + 1);

        optimizer.steps = u64::MAX;
        optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();
        assert_eq!(optimizer.steps, u64::MAX);
        assert!(weights.iter().all(|w| w.is_finite() && *w < 1.0));
    }

    #[test]
    fn test_adam_update() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::adam(0.001), 1.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));

        optimizer.optimize(vec![&mut weights], &[gradients.clone()], 1).unwrap();
        // bias correction makes the first step exactly lr
        assert_relative_eq!(weights[[0, 0]], 1.0 - 0.001, epsilon = 1e-9);

        for _ in 0..10 {
            optimizer.optimize(vec![&mut weights], &[gradients.clone()], 1).unwrap();
        }
        assert!(weights[[0, 0]] < 0.999);
    }

    #[test]
    fn parameters_are_updated_independently() {
        let mut optimizer = Optimizer::new(OptimizerConfig::adam(0.01)).unwrap();
        let mut a = arr1(&[1.0, 1.0]).into_dyn();
        let mut b = arr1(&[1.0]).into_dyn();
        optimizer.attach(&[a.shape(), b.shape()]);
        let grads = [arr1(&[1.0, 0.0]).into_dyn(), arr1(&[1000.0]).into_dyn()];
        optimizer.optimize(vec![&mut a, &mut b], &grads, 1).unwrap();
        assert_relative_eq!(a[[0]], 0.99, epsilon = 1e-9);
        assert_eq!(a[[1]], 1.0);
        assert_relative_eq!(b[[0]], 0.99, epsilon = 1e-9);
    }

    #[test]
    fn reset_clears_state() {
        let (mut optimizer, mut weights) = single(OptimizerConfig::momentum(0.1, 0.9, false), 0.0);
        let gradients = ArrayD::ones(IxDyn(&[3, 2]));
        optimizer.optimize(vec![&mut weights], &[gradients.clone()], 1).unwrap();
        optimizer.reset();
        let before = weights[[0, 0]];
        optimizer.optimize(vec![&mut weights], &[gradients], 1).unwrap();
        assert_relative_eq!(weights[[0, 0]] - before, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(Optimizer::from_name("lbfgs"), Err(Error::Configuration(_))));
        assert!(matches!(
            Optimizer::new(OptimizerConfig::sgd(-1.0)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Optimizer::new(OptimizerConfig::momentum(0.1, 1.5, false)),
            Err(Error::Configuration(_))
        ));
    }
}
