use std::fmt;
use std::str::FromStr;

use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Tensor;

/// Enum representing different activation function types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    Sigmoid,
    #[serde(rename = "relu")]
    ReLU,
    Tanh,
    /// Normalised over the last axis of the tensor.
    Softmax,
    #[default]
    Linear,
}

impl ActivationType {
    /// Scalar form, used where the function is known to be elementwise.
    ///
    /// Softmax only has a scalar form over a one-element lane, where it is
    /// constantly 1; real lanes go through [`ActivationType::forward`].
    pub(crate) fn apply(&self, x: f64) -> f64 {
        match self {
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::ReLU => x.max(0.0),
            ActivationType::Tanh => x.tanh(),
            ActivationType::Softmax => 1.0,
            ActivationType::Linear => x,
        }
    }

    /// Derivative expressed through the activation's output `a = φ(x)`.
    /// For softmax this is the jacobian diagonal only.
    pub(crate) fn derivative_from_output(&self, a: f64) -> f64 {
        match self {
            ActivationType::Sigmoid | ActivationType::Softmax => a * (1.0 - a),
            ActivationType::ReLU => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::Tanh => 1.0 - a * a,
            ActivationType::Linear => 1.0,
        }
    }

    /// Whether the function can be applied one element at a time.
    pub fn is_elementwise(&self) -> bool {
        !matches!(self, ActivationType::Softmax)
    }

    /// Forward pass over a whole tensor.
    pub fn forward(&self, z: &Tensor) -> Tensor {
        match self {
            ActivationType::Softmax => softmax(z),
            ActivationType::Linear => z.clone(),
            _ => z.mapv(|x| self.apply(x)),
        }
    }

    /// Gradient with respect to the pre-activation `z`, given the cached
    /// pre-activation, the cached output `a` and the gradient of the output.
    pub fn backward(&self, z: &Tensor, a: &Tensor, grad: &Tensor) -> Tensor {
        match self {
            ActivationType::Linear => grad.clone(),
            ActivationType::ReLU => {
                Zip::from(z).and(grad).map_collect(|&z, &g| if z > 0.0 { g } else { 0.0 })
            }
            ActivationType::Softmax => {
                // J·g for every row: a ⊙ (g − Σ g⊙a)
                let last = Axis(a.ndim() - 1);
                let mut out = Tensor::zeros(a.raw_dim());
                Zip::from(out.lanes_mut(last))
                    .and(a.lanes(last))
                    .and(grad.lanes(last))
                    .for_each(|mut out, a, g| {
                        let dot = a.dot(&g);
                        Zip::from(&mut out)
                            .and(&a)
                            .and(&g)
                            .for_each(|o, &a, &g| *o = a * (g - dot));
                    });
                out
            }
            _ => Zip::from(a)
                .and(grad)
                .map_collect(|&a, &g| g * self.derivative_from_output(a)),
        }
    }
}

fn softmax(z: &Tensor) -> Tensor {
    let last = Axis(z.ndim() - 1);
    let mut out = z.clone();
    for mut lane in out.lanes_mut(last) {
        let max = lane.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    out
}

impl FromStr for ActivationType {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(ActivationType::Sigmoid),
            "relu" => Ok(ActivationType::ReLU),
            "tanh" => Ok(ActivationType::Tanh),
            "softmax" => Ok(ActivationType::Softmax),
            "linear" | "identity" => Ok(ActivationType::Linear),
            other => Err(Error::config(format!("unknown activation function '{other}'"))),
        }
    }
}

impl fmt::Display for ActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationType::Sigmoid => "sigmoid",
            ActivationType::ReLU => "relu",
            ActivationType::Tanh => "tanh",
            ActivationType::Softmax => "softmax",
            ActivationType::Linear => "linear",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array2};

    const EPSILON: f64 = 1e-12;

    #[test]
    fn test_activation_functions() {
        // Sigmoid tests
        assert!((ActivationType::Sigmoid.apply(0.0) - 0.5).abs() < EPSILON);

        // ReLU tests
        assert_eq!(ActivationType::ReLU.apply(-1.0), 0.0);
        assert_eq!(ActivationType::ReLU.apply(2.0), 2.0);

        // Tanh tests
        assert!((ActivationType::Tanh.apply(0.0)).abs() < EPSILON);

        // Linear tests
        assert_eq!(ActivationType::Linear.apply(5.0), 5.0);
    }

    #[test]
    fn test_activation_derivatives() {
        let at = |act: ActivationType, x: f64| act.derivative_from_output(act.apply(x));
        assert!((at(ActivationType::Sigmoid, 0.0) - 0.25).abs() < EPSILON);
        assert_eq!(at(ActivationType::ReLU, -1.0), 0.0);
        assert_eq!(at(ActivationType::ReLU, 2.0), 1.0);
        assert!((at(ActivationType::Tanh, 0.0) - 1.0).abs() < EPSILON);
        assert_eq!(at(ActivationType::Linear, 5.0), 1.0);
    }

    #[test]
    fn output_form_matches_central_difference() {
        let h = 1e-6;
        for act in [ActivationType::Sigmoid, ActivationType::Tanh, ActivationType::ReLU] {
            for x in [-1.5, -0.2, 0.3, 2.0] {
                let numeric = (act.apply(x + h) - act.apply(x - h)) / (2.0 * h);
                assert_relative_eq!(act.derivative_from_output(act.apply(x)), numeric, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn scalar_softmax_matches_single_lane_tensor() {
        let z = arr2(&[[-3.0], [0.0], [250.0]]).into_dyn();
        let a = ActivationType::Softmax.forward(&z);
        for (&x, &expected) in z.iter().zip(a.iter()) {
            assert_eq!(ActivationType::Softmax.apply(x), expected);
            // a one-element lane is constant, so its jacobian vanishes
            assert_eq!(ActivationType::Softmax.derivative_from_output(expected), 0.0);
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = arr2(&[[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]]).into_dyn();
        let a = ActivationType::Softmax.forward(&z);
        for row in a.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(a[[1, 0]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn softmax_backward_is_jacobian_product() {
        let z = arr2(&[[0.2, -0.4, 1.1]]).into_dyn();
        let a = ActivationType::Softmax.forward(&z);
        let g = arr2(&[[0.5, -1.0, 2.0]]).into_dyn();
        let dz = ActivationType::Softmax.backward(&z, &a, &g);

        let a2: Array2<f64> = a.clone().into_dimensionality().unwrap();
        for j in 0..3 {
            let mut expected = 0.0;
            for i in 0..3 {
                let kron = if i == j { 1.0 } else { 0.0 };
                expected += g[[0, i]] * a2[[0, i]] * (kron - a2[[0, j]]);
            }
            assert_relative_eq!(dz[[0, j]], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn registry_rejects_unknown_names() {
        assert_eq!("ReLU".parse::<ActivationType>().unwrap(), ActivationType::ReLU);
        assert_eq!("softmax".parse::<ActivationType>().unwrap(), ActivationType::Softmax);
        assert!(matches!(
            "swish".parse::<ActivationType>(),
            Err(Error::Configuration(_))
        ));
    }
}
