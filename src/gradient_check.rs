//! Finite-difference verification of the analytic gradients.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::Tensor;

/// Relative error above which a tensor is reported as unstable.
pub const GRADIENT_CHECK_TOLERANCE: f64 = 1e-5;

/// An analytic gradient disagreeing with its numeric estimate. Reported, not raised.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("numeric instability in {tensor}: relative error {relative_error:e} exceeds {tolerance:e}")]
pub struct NumericInstabilityWarning {
    pub tensor: String,
    pub relative_error: f64,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorCheck {
    /// `input` or `<layer>[<index>].<param>`
    pub tensor: String,
    pub relative_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheckReport {
    pub checks: Vec<TensorCheck>,
    pub max_relative_error: f64,
    pub warnings: Vec<NumericInstabilityWarning>,
}

impl GradientCheckReport {
    pub fn passed(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// `‖a − n‖ / (‖a‖ + ‖n‖)`, zero when both are zero.
pub fn relative_error(analytic: &Tensor, numeric: &Tensor) -> f64 {
    let norm = |t: &Tensor| t.iter().map(|v| v * v).sum::<f64>().sqrt();
    let diff = (analytic - numeric).iter().map(|v| v * v).sum::<f64>().sqrt();
    let scale = norm(analytic) + norm(numeric);
    if scale == 0.0 {
        0.0
    } else {
        diff / scale
    }
}

impl Network {
    fn inference_cost(&mut self, input: &Tensor, target: &Tensor) -> Result<f64> {
        let output = self.run(input, false)?;
        self.loss.calculate(&output, target)
    }

    fn param_entry(&mut self, layer: usize, param: usize, index: usize) -> Option<&mut f64> {
        self.layers[layer]
            .params_mut()
            .into_iter()
            .nth(param)
            .and_then(|p| p.iter_mut().nth(index))
    }

    /// Compares backward against central differences `(C(+ε) − C(−ε)) / 2ε` for
    /// every parameter and every input element, with dropout disabled.
    pub fn gradient_check(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        epsilon: f64,
    ) -> Result<GradientCheckReport> {
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(Error::config(format!("gradient check step must be positive, got {epsilon}")));
        }

        self.run(input, false)?;
        let analytic = self.backward(target)?;

        let mut checks = Vec::new();

        let mut numeric_input = Tensor::zeros(input.raw_dim());
        let mut probe = input.clone();
        for (index, slot) in numeric_input.iter_mut().enumerate() {
            let original = input.iter().nth(index).copied().unwrap_or_default();
            if let Some(v) = probe.iter_mut().nth(index) {
                *v = original + epsilon;
            }
            let plus = self.inference_cost(&probe, target)?;
            if let Some(v) = probe.iter_mut().nth(index) {
                *v = original - epsilon;
            }
            let minus = self.inference_cost(&probe, target)?;
            if let Some(v) = probe.iter_mut().nth(index) {
                *v = original;
            }
            *slot = (plus - minus) / (2.0 * epsilon);
        }
        checks.push(TensorCheck {
            tensor: "input".to_string(),
            relative_error: relative_error(&analytic.input, &numeric_input),
        });

        let mut grads = analytic.params.iter();
        for layer in 0..self.layers.len() {
            let shapes: Vec<_> = self.layers[layer].params().iter().map(|p| p.raw_dim()).collect();
            for (param, shape) in shapes.into_iter().enumerate() {
                let Some(expected) = grads.next() else {
                    return Err(Error::state("backward returned fewer gradients than parameters"));
                };
                let mut numeric = Tensor::zeros(shape);
                for (index, slot) in numeric.iter_mut().enumerate() {
                    let original = self.param_entry(layer, param, index).copied().unwrap_or_default();
                    if let Some(v) = self.param_entry(layer, param, index) {
                        *v = original + epsilon;
                    }
                    let plus = self.inference_cost(input, target)?;
                    if let Some(v) = self.param_entry(layer, param, index) {
                        *v = original - epsilon;
                    }
                    let minus = self.inference_cost(input, target)?;
                    if let Some(v) = self.param_entry(layer, param, index) {
                        *v = original;
                    }
                    *slot = (plus - minus) / (2.0 * epsilon);
                }
                checks.push(TensorCheck {
                    tensor: format!("{}[{layer}].{param}", self.layers[layer].name()),
                    relative_error: relative_error(expected, &numeric),
                });
            }
        }

        let mut max_relative_error: f64 = 0.0;
        let mut warnings = Vec::new();
        for check in &checks {
            debug!(tensor = %check.tensor, relative_error = check.relative_error, "gradient checked");
            if check.relative_error.is_nan() {
                max_relative_error = f64::NAN;
            } else if !max_relative_error.is_nan() {
                max_relative_error = max_relative_error.max(check.relative_error);
            }
            if check.relative_error.is_nan() || check.relative_error > GRADIENT_CHECK_TOLERANCE {
                let warning = NumericInstabilityWarning {
                    tensor: check.tensor.clone(),
                    relative_error: check.relative_error,
                    tolerance: GRADIENT_CHECK_TOLERANCE,
                };
                warn!("{warning}");
                warnings.push(warning);
            }
        }

        Ok(GradientCheckReport {
            checks,
            max_relative_error,
            warnings,
        })
    }
}
