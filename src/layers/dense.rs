use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;

use super::{check_input, he_normal, require_units, to_matrix, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Fully connected layer: `activation(input · W + b)`.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    neurons: usize,
    inputs: usize,
    activation: ActivationType,
    /// (inputs × neurons)
    weights: Tensor,
    /// (neurons)
    bias: Tensor,
    weight_grads: Tensor,
    bias_grads: Tensor,
    output_shape: Shape,
    cache: Option<DenseCache>,
}

#[derive(Debug, Clone)]
struct DenseCache {
    input: Array2<f64>,
    preactivation: Tensor,
    activation: Tensor,
}

impl DenseLayer {
    pub fn new(neurons: usize, activation: ActivationType) -> Self {
        DenseLayer {
            neurons,
            inputs: 0,
            activation,
            weights: Tensor::zeros(vec![0, neurons]),
            bias: Tensor::zeros(vec![neurons]),
            weight_grads: Tensor::zeros(vec![0, neurons]),
            bias_grads: Tensor::zeros(vec![neurons]),
            output_shape: vec![neurons],
            cache: None,
        }
    }

    pub fn units(&self) -> usize {
        self.neurons
    }

    fn weight_matrix(&self) -> Result<Array2<f64>> {
        to_matrix(self.name(), &self.weights)
    }

    /// Shared tail of both backward entry points; `delta` is dL/d(pre-activation).
    fn backward_delta(&mut self, input: &Array2<f64>, delta: &Tensor) -> Result<Tensor> {
        let delta = to_matrix(self.name(), delta)?;
        let weights = self.weight_matrix()?;

        self.weight_grads = input.t().dot(&delta).into_dyn();
        self.bias_grads = delta.sum_axis(Axis(0)).into_dyn();

        Ok(delta.dot(&weights.t()).into_dyn())
    }
}

impl Layer for DenseLayer {
    fn name(&self) -> &'static str {
        "Dense"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        require_units(self.name(), self.neurons)?;
        let [inputs] = input_shape else {
            return Err(Error::shape(format!(
                "Dense: expected a flat input shape, got {input_shape:?} (add a Flatten layer)"
            )));
        };
        self.inputs = *inputs;
        self.weights = he_normal(&[self.inputs, self.neurons], self.inputs, rng)?;
        self.bias = Array1::zeros(self.neurons).into_dyn();
        self.weight_grads = Tensor::zeros(self.weights.raw_dim());
        self.bias_grads = Tensor::zeros(self.bias.raw_dim());
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &[self.inputs])?;
        let input = to_matrix(self.name(), input)?;
        let bias = self
            .bias
            .view()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|_| Error::not_connected(self.name()))?;

        let preactivation = (input.dot(&self.weight_matrix()?) + &bias).into_dyn();
        let activation = self.activation.forward(&preactivation);
        self.cache = Some(DenseCache {
            input,
            preactivation,
            activation: activation.clone(),
        });
        Ok(activation)
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        let delta = self
            .activation
            .backward(&cache.preactivation, &cache.activation, output_gradient);
        self.backward_delta(&cache.input, &delta)
    }

    fn backward_preactivation(&mut self, delta: &Tensor) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        self.backward_delta(&cache.input, delta)
    }

    fn activation(&self) -> Option<ActivationType> {
        Some(self.activation)
    }

    fn params(&self) -> Vec<&Tensor> {
        vec![&self.weights, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weights, &mut self.bias]
    }

    fn grads(&self) -> Vec<&Tensor> {
        vec![&self.weight_grads, &self.bias_grads]
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Dense {
            units: self.neurons,
            activation: self.activation,
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;
    use rand::SeedableRng;

    fn layer(activation: ActivationType) -> DenseLayer {
        let mut layer = DenseLayer::new(2, activation);
        layer.connect(&[3], &mut StdRng::seed_from_u64(0)).unwrap();
        layer.weights = arr2(&[[1.0, 2.0], [-1.0, -1.0], [0.5, 2.0]]).into_dyn();
        layer.bias = Array1::from(vec![-2.0, -0.5]).into_dyn();
        layer
    }

    #[test]
    fn layer_forward() {
        let mut layer = layer(ActivationType::Sigmoid);
        let inputs = arr2(&[[1.0, 0.5, -0.5], [0.0, 1.0, 0.5]]).into_dyn();
        let outputs = layer.forward(&inputs).unwrap();
        assert_relative_eq!(outputs[[0, 0]], 0.1480471980316895, epsilon = 1e-12);
        assert_relative_eq!(outputs[[0, 1]], 0.5, epsilon = 1e-12);
        assert_relative_eq!(outputs[[1, 0]], 0.0600866501740076, epsilon = 1e-12);
        assert_relative_eq!(outputs[[1, 1]], 0.3775406687981454, epsilon = 1e-12);
    }

    #[test]
    fn layer_backward() {
        let mut layer = layer(ActivationType::Linear);
        let inputs = arr2(&[[1.0, 0.5, -0.5], [0.0, 1.0, 0.5]]).into_dyn();
        layer.forward(&inputs).unwrap();
        let grad = arr2(&[[1.0, 0.0], [0.0, 1.0]]).into_dyn();
        let dx = layer.backward(&grad).unwrap();

        // dx = g · Wᵀ
        assert_eq!(dx, arr2(&[[1.0, -1.0, 0.5], [2.0, -1.0, 2.0]]).into_dyn());
        // dW = xᵀ · g
        assert_eq!(layer.weight_grads, arr2(&[[1.0, 0.0], [0.5, 1.0], [-0.5, 0.5]]).into_dyn());
        assert_eq!(layer.bias_grads, Array1::from(vec![1.0, 1.0]).into_dyn());
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut layer = layer(ActivationType::Tanh);
        let grad = arr2(&[[1.0, 0.0]]).into_dyn();
        assert!(matches!(layer.backward(&grad), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_forward_propagate_invalid_input_size() {
        let mut layer = layer(ActivationType::ReLU);
        let invalid_input = arr2(&[[1.0, 2.0]]).into_dyn();
        assert!(matches!(layer.forward(&invalid_input), Err(Error::Shape(_))));
    }

    #[test]
    fn test_parameter_count() {
        let layer = layer(ActivationType::ReLU);
        assert_eq!(layer.num_params(), 3 * 2 + 2);
    }

    #[test]
    fn rejects_non_flat_input() {
        let mut layer = DenseLayer::new(4, ActivationType::ReLU);
        let err = layer.connect(&[2, 3], &mut StdRng::seed_from_u64(0));
        assert!(matches!(err, Err(Error::Shape(_))));
    }
}
