use ndarray::{concatenate, s, Array1, Array2, Axis, Ix1};
use rand::rngs::StdRng;

use super::{check_input, he_normal, to_matrix, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Highway layer: `y = t⊙φ(x·W_h + b_h) + c⊙x` with transform gate
/// `t = σ(x·W_t + b_t)` and carry gate `c = σ(x·W_c + b_c)`.
///
/// Input and output are both `(batch, n)`. Tying `c = 1 − t` recovers the
/// coupled form.
#[derive(Debug, Clone)]
pub struct HighwayLayer {
    activation: ActivationType,
    size: usize,
    /// (n × 3n): transform branch, transform gate, carry gate.
    weights: Tensor,
    /// (3n)
    bias: Tensor,
    weight_grads: Tensor,
    bias_grads: Tensor,
    shape: Shape,
    cache: Option<HighwayCache>,
}

#[derive(Debug, Clone)]
struct HighwayCache {
    input: Array2<f64>,
    transform_pre: Tensor,
    transform: Tensor,
    gate: Array2<f64>,
    carry: Array2<f64>,
}

impl HighwayLayer {
    pub fn new(activation: ActivationType) -> Self {
        HighwayLayer {
            activation,
            size: 0,
            weights: Tensor::zeros(vec![0, 0]),
            bias: Tensor::zeros(vec![0]),
            weight_grads: Tensor::zeros(vec![0, 0]),
            bias_grads: Tensor::zeros(vec![0]),
            shape: Vec::new(),
            cache: None,
        }
    }
}

impl Layer for HighwayLayer {
    fn name(&self) -> &'static str {
        "Highway"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        let [size] = input_shape else {
            return Err(Error::shape(format!(
                "Highway: expected a flat input shape, got {input_shape:?}"
            )));
        };
        self.size = *size;
        self.shape = input_shape.to_vec();
        let n = self.size;
        self.weights = he_normal(&[n, 3 * n], n, rng)?;
        // Start close to the carry path: transform gate mostly shut, carry gate mostly open.
        let mut bias = Array1::zeros(3 * n);
        bias.slice_mut(s![n..2 * n]).fill(-1.0);
        bias.slice_mut(s![2 * n..]).fill(1.0);
        self.bias = bias.into_dyn();
        self.weight_grads = Tensor::zeros(self.weights.raw_dim());
        self.bias_grads = Tensor::zeros(self.bias.raw_dim());
        Ok(self.shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.shape)?;
        let x = to_matrix(self.name(), input)?;
        let weights = to_matrix(self.name(), &self.weights)?;
        let bias = self
            .bias
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| Error::not_connected(self.name()))?;

        let n = self.size;
        let z = x.dot(&weights) + &bias;
        let transform_pre = z.slice(s![.., ..n]).to_owned().into_dyn();
        let transform = self.activation.forward(&transform_pre);
        let gate = z.slice(s![.., n..2 * n]).mapv(|v| ActivationType::Sigmoid.apply(v));
        let carry = z.slice(s![.., 2 * n..]).mapv(|v| ActivationType::Sigmoid.apply(v));

        let h = to_matrix(self.name(), &transform)?;
        let output = &gate * &h + &carry * &x;

        self.cache = Some(HighwayCache {
            input: x,
            transform_pre,
            transform,
            gate,
            carry,
        });
        Ok(output.into_dyn())
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        let g = to_matrix(self.name(), output_gradient)?;
        let h = to_matrix(self.name(), &cache.transform)?;
        let x = &cache.input;
        let t = &cache.gate;
        let c = &cache.carry;
        let sigmoid_prime = |v: &f64| v * (1.0 - v);

        let d_transform = (&g * t).into_dyn();
        let d_transform_pre = self
            .activation
            .backward(&cache.transform_pre, &cache.transform, &d_transform);
        let d_transform_pre = to_matrix(self.name(), &d_transform_pre)?;
        let d_gate_pre = &g * &h * &t.map(sigmoid_prime);
        let d_carry_pre = &g * x * &c.map(sigmoid_prime);

        let dz = concatenate(
            Axis(1),
            &[d_transform_pre.view(), d_gate_pre.view(), d_carry_pre.view()],
        )
        .map_err(|e| Error::shape(format!("Highway: {e}")))?;

        let weights = to_matrix(self.name(), &self.weights)?;
        self.weight_grads = x.t().dot(&dz).into_dyn();
        self.bias_grads = dz.sum_axis(Axis(0)).into_dyn();

        Ok((dz.dot(&weights.t()) + &g * c).into_dyn())
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
        LayerSpec::Highway {
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

    #[test]
    fn closed_gate_carries_input() {
        let mut layer = HighwayLayer::new(ActivationType::Tanh);
        layer.connect(&[3], &mut StdRng::seed_from_u64(1)).unwrap();
        layer.weights.fill(0.0);
        layer.bias = Array1::from(vec![0.0, 0.0, 0.0, -50.0, -50.0, -50.0, 50.0, 50.0, 50.0]).into_dyn();

        let input = arr2(&[[0.3, -1.2, 2.0]]).into_dyn();
        let output = layer.forward(&input).unwrap();
        for (o, i) in output.iter().zip(input.iter()) {
            assert_relative_eq!(*o, *i, epsilon = 1e-12);
        }
    }

    #[test]
    fn parameter_shapes() {
        let mut layer = HighwayLayer::new(ActivationType::ReLU);
        let out = layer.connect(&[5], &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(out, vec![5]);
        assert_eq!(layer.weights.shape(), &[5, 15]);
        assert_eq!(layer.bias.shape(), &[15]);
        assert_eq!(layer.num_params(), 90);
    }

    #[test]
    fn gradient_reaches_all_three_blocks() {
        let mut layer = HighwayLayer::new(ActivationType::Tanh);
        layer.connect(&[2], &mut StdRng::seed_from_u64(3)).unwrap();
        layer.bias.fill(0.0);
        layer.forward(&arr2(&[[0.5, -0.8], [1.1, 0.2]]).into_dyn()).unwrap();
        layer.backward(&arr2(&[[1.0, -1.0], [0.5, 2.0]]).into_dyn()).unwrap();

        for block in 0..3 {
            let grads = layer.bias_grads.slice(s![2 * block..2 * (block + 1)]);
            assert!(grads.iter().any(|g| g.abs() > 1e-6), "block {block} got no gradient");
        }
    }

    #[test]
    fn shut_transform_and_carry_output_zero() {
        let mut layer = HighwayLayer::new(ActivationType::Linear);
        layer.connect(&[2], &mut StdRng::seed_from_u64(4)).unwrap();
        layer.weights.fill(0.0);
        layer.bias = Array1::from(vec![0.0, 0.0, -60.0, -60.0, -60.0, -60.0]).into_dyn();
        let output = layer.forward(&arr2(&[[3.0, -4.0]]).into_dyn()).unwrap();
        for o in output.iter() {
            assert_relative_eq!(*o, 0.0, epsilon = 1e-12);
        }
    }
}
