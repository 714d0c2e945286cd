use std::fmt;
use std::str::FromStr;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Tensor;

// keeps ln() and the divisions finite
const CLIP: f64 = 1e-12;

/// Cost functions. Costs are summed over the whole batch; averaging per
/// sample is left to the caller (the optimizer scales its learning rate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// ½ Σ (prediction − target)²
    MeanSquaredError,
    /// −Σ target · ln(prediction)
    CategoricalCrossEntropy,
    /// −Σ target · ln(prediction) + (1 − target) · ln(1 − prediction)
    BinaryCrossEntropy,
}

impl Loss {
    pub fn calculate(&self, prediction: &Tensor, target: &Tensor) -> Result<f64> {
        check_shapes(prediction, target)?;
        let cost = match self {
            Loss::MeanSquaredError => {
                0.5 * Zip::from(prediction)
                    .and(target)
                    .fold(0.0, |acc, &p, &y| acc + (p - y).powi(2))
            }
            Loss::CategoricalCrossEntropy => -Zip::from(prediction)
                .and(target)
                .fold(0.0, |acc, &p, &y| acc + y * p.max(CLIP).ln()),
            Loss::BinaryCrossEntropy => -Zip::from(prediction).and(target).fold(0.0, |acc, &p, &y| {
                let p = p.clamp(CLIP, 1.0 - CLIP);
                acc + y * p.ln() + (1.0 - y) * (1.0 - p).ln()
            }),
        };
        Ok(cost)
    }

    /// Derivative of [`Loss::calculate`] with respect to the prediction.
    pub fn derivative(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        check_shapes(prediction, target)?;
        let grad = match self {
            Loss::MeanSquaredError => prediction - target,
            Loss::CategoricalCrossEntropy => {
                Zip::from(prediction).and(target).map_collect(|&p, &y| -y / p.max(CLIP))
            }
            Loss::BinaryCrossEntropy => Zip::from(prediction).and(target).map_collect(|&p, &y| {
                let p = p.clamp(CLIP, 1.0 - CLIP);
                (p - y) / (p * (1.0 - p))
            }),
        };
        Ok(grad)
    }
}

fn check_shapes(prediction: &Tensor, target: &Tensor) -> Result<()> {
    if prediction.shape() != target.shape() {
        return Err(Error::shape(format!(
            "prediction shape {:?} does not match target shape {:?}",
            prediction.shape(),
            target.shape()
        )));
    }
    Ok(())
}

impl FromStr for Loss {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(Loss::MeanSquaredError),
            "cxent" | "categorical_cross_entropy" | "cross_entropy" => Ok(Loss::CategoricalCrossEntropy),
            "bxent" | "binary_cross_entropy" => Ok(Loss::BinaryCrossEntropy),
            other => Err(Error::config(format!("unknown cost function '{other}'"))),
        }
    }
}

impl fmt::Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Loss::MeanSquaredError => "mse",
            Loss::CategoricalCrossEntropy => "cxent",
            Loss::BinaryCrossEntropy => "bxent",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_compute_loss() {
        let test_cases = vec![
            (1.0, 1.0, 0.0),    // Perfect prediction
            (0.5, 1.0, 0.125),  // Moderate error
            (0.0, 1.0, 0.5),    // Large error
        ];

        for (predicted, target, expected_loss) in test_cases {
            let p = arr2(&[[predicted]]).into_dyn();
            let y = arr2(&[[target]]).into_dyn();
            let computed = Loss::MeanSquaredError.calculate(&p, &y).unwrap();
            assert_relative_eq!(computed, expected_loss, epsilon = 1e-12);
        }
    }

    #[test]
    fn cross_entropy_of_confident_hit_is_small() {
        let p = arr2(&[[0.98, 0.01, 0.01]]).into_dyn();
        let y = arr2(&[[1.0, 0.0, 0.0]]).into_dyn();
        let cost = Loss::CategoricalCrossEntropy.calculate(&p, &y).unwrap();
        assert_relative_eq!(cost, -(0.98f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let p = arr2(&[[0.3, 0.6], [0.8, 0.1]]).into_dyn();
        let y = arr2(&[[0.0, 1.0], [1.0, 0.0]]).into_dyn();
        let eps = 1e-6;
        for loss in [Loss::MeanSquaredError, Loss::CategoricalCrossEntropy, Loss::BinaryCrossEntropy] {
            let analytic = loss.derivative(&p, &y).unwrap();
            for (index, &a) in analytic.indexed_iter() {
                let mut plus = p.clone();
                plus[index.clone()] += eps;
                let mut minus = p.clone();
                minus[index.clone()] -= eps;
                let numeric = (loss.calculate(&plus, &y).unwrap() - loss.calculate(&minus, &y).unwrap())
                    / (2.0 * eps);
                assert_relative_eq!(a, numeric, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let p = arr2(&[[0.3, 0.6]]).into_dyn();
        let y = arr2(&[[0.3], [0.6]]).into_dyn();
        assert!(matches!(Loss::MeanSquaredError.calculate(&p, &y), Err(Error::Shape(_))));
    }

    #[test]
    fn registry_names() {
        assert_eq!("cxent".parse::<Loss>().unwrap(), Loss::CategoricalCrossEntropy);
        assert_eq!("MSE".parse::<Loss>().unwrap(), Loss::MeanSquaredError);
        assert!(matches!("hinge".parse::<Loss>(), Err(Error::Configuration(_))));
    }
}
