use ndarray::{concatenate, s, stack, Array1, Array2, Array3, ArrayView2, Axis, Ix1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use tracing::debug;

use super::{check_input, he_normal, require_units, to_matrix, to_rank3, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Validates a `(time, features)` sample shape and the recurrent activation.
pub(super) fn sequence_shape(
    layer: &str,
    input_shape: &[usize],
    units: usize,
    activation: ActivationType,
) -> Result<(usize, usize)> {
    require_units(layer, units)?;
    if !activation.is_elementwise() {
        return Err(Error::config(format!(
            "{layer}: {activation} cannot be used as a recurrent activation"
        )));
    }
    match input_shape {
        [steps, features] if *steps > 0 && *features > 0 => Ok((*steps, *features)),
        _ => Err(Error::shape(format!(
            "{layer}: expected input shape (time, features), got {input_shape:?}"
        ))),
    }
}

pub(super) fn sequence_output_shape(steps: usize, units: usize, return_seq: bool) -> Shape {
    if return_seq {
        vec![steps, units]
    } else {
        vec![units]
    }
}

/// Stacks per-step hidden states into `(batch, time, units)`, or returns the
/// last one when the full sequence is not requested.
pub(super) fn emit(layer: &str, states: &[Array2<f64>], return_seq: bool) -> Result<Tensor> {
    if return_seq {
        let views: Vec<ArrayView2<f64>> = states.iter().map(|h| h.view()).collect();
        Ok(stack(Axis(1), &views)
            .map_err(|e| Error::shape(format!("{layer}: {e}")))?
            .into_dyn())
    } else {
        states
            .last()
            .map(|h| h.clone().into_dyn())
            .ok_or_else(|| Error::shape(format!("{layer}: empty sequence")))
    }
}

/// Expands the incoming gradient to one `(batch, units)` slice per step;
/// without `return_seq` every step but the last gets zeros.
pub(super) fn sequence_gradient(
    layer: &str,
    output_gradient: &Tensor,
    steps: usize,
    units: usize,
    return_seq: bool,
) -> Result<Array3<f64>> {
    let expected = sequence_output_shape(steps, units, return_seq);
    check_input(layer, output_gradient, &expected)?;
    if return_seq {
        return to_rank3(layer, output_gradient);
    }
    let last = to_matrix(layer, output_gradient)?;
    let batch = last.nrows();
    let mut grads = Array3::zeros((batch, steps, units));
    grads.slice_mut(s![.., steps - 1, ..]).assign(&last);
    Ok(grads)
}

pub(super) fn vector<'a>(layer: &str, tensor: &'a Tensor) -> Result<ndarray::ArrayView1<'a, f64>> {
    tensor
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| Error::not_connected(layer))
}

/// Elman recurrent layer: `h_t = φ([x_t, h_{t−1}]·W + b)`.
///
/// Input is `(batch, time, features)`; output is `(batch, time, units)` with
/// `return_seq`, otherwise the last hidden state `(batch, units)`.
#[derive(Debug, Clone)]
pub struct RecurrentLayer {
    units: usize,
    activation: ActivationType,
    return_seq: bool,
    inputs: usize,
    steps: usize,
    /// ((inputs + units) × units)
    weights: Tensor,
    bias: Tensor,
    weight_grads: Tensor,
    bias_grads: Tensor,
    output_shape: Shape,
    cache: Option<Vec<RecurrentStep>>,
}

#[derive(Debug, Clone)]
struct RecurrentStep {
    /// `[x_t, h_{t−1}]`
    joined: Array2<f64>,
    hidden: Array2<f64>,
}

impl RecurrentLayer {
    pub fn new(units: usize, activation: ActivationType, return_seq: bool) -> Self {
        RecurrentLayer {
            units,
            activation,
            return_seq,
            inputs: 0,
            steps: 0,
            weights: Tensor::zeros(vec![0, units]),
            bias: Tensor::zeros(vec![units]),
            weight_grads: Tensor::zeros(vec![0, units]),
            bias_grads: Tensor::zeros(vec![units]),
            output_shape: Vec::new(),
            cache: None,
        }
    }

    fn bind(&mut self, input_shape: &[usize]) -> Result<()> {
        let (steps, inputs) = sequence_shape(self.name(), input_shape, self.units, self.activation)?;
        self.steps = steps;
        self.inputs = inputs;
        self.output_shape = sequence_output_shape(steps, self.units, self.return_seq);
        Ok(())
    }

    fn set_parameters(&mut self, weights: Tensor, bias: Tensor) {
        self.weight_grads = Tensor::zeros(weights.raw_dim());
        self.bias_grads = Tensor::zeros(bias.raw_dim());
        self.weights = weights;
        self.bias = bias;
    }
}

impl Layer for RecurrentLayer {
    fn name(&self) -> &'static str {
        "SimpleRecurrent"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        self.bind(input_shape)?;
        let fan_in = self.inputs + self.units;
        let weights = he_normal(&[fan_in, self.units], fan_in, rng)?;
        self.set_parameters(weights, Array1::zeros(self.units).into_dyn());
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &[self.steps, self.inputs])?;
        let x = to_rank3(self.name(), input)?;
        let weights = to_matrix(self.name(), &self.weights)?;
        let bias = vector(self.name(), &self.bias)?;

        let batch = x.shape()[0];
        let mut hidden = Array2::zeros((batch, self.units));
        let mut steps = Vec::with_capacity(self.steps);
        for t in 0..self.steps {
            let joined = concatenate(Axis(1), &[x.slice(s![.., t, ..]), hidden.view()])
                .map_err(|e| Error::shape(format!("SimpleRecurrent: {e}")))?;
            hidden = (joined.dot(&weights) + &bias).mapv(|v| self.activation.apply(v));
            steps.push(RecurrentStep {
                joined,
                hidden: hidden.clone(),
            });
        }

        let states: Vec<Array2<f64>> = steps.iter().map(|step| step.hidden.clone()).collect();
        self.cache = Some(steps);
        emit(self.name(), &states, self.return_seq)
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let steps = self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        let grads = sequence_gradient(self.name(), output_gradient, self.steps, self.units, self.return_seq)?;
        let weights = to_matrix(self.name(), &self.weights)?;

        let batch = grads.shape()[0];
        let mut weight_grads = Array2::<f64>::zeros(weights.raw_dim());
        let mut bias_grads = Array1::<f64>::zeros(self.units);
        let mut input_grads = Array3::<f64>::zeros((batch, self.steps, self.inputs));
        let mut carry = Array2::<f64>::zeros((batch, self.units));

        for (t, step) in steps.iter().enumerate().rev() {
            let dh = &grads.slice(s![.., t, ..]) + &carry;
            let delta = dh * step.hidden.mapv(|a| self.activation.derivative_from_output(a));
            weight_grads += &step.joined.t().dot(&delta);
            bias_grads += &delta.sum_axis(Axis(0));
            let d_joined = delta.dot(&weights.t());
            input_grads
                .slice_mut(s![.., t, ..])
                .assign(&d_joined.slice(s![.., ..self.inputs]));
            carry = d_joined.slice(s![.., self.inputs..]).to_owned();
        }

        self.weight_grads = weight_grads.into_dyn();
        self.bias_grads = bias_grads.into_dyn();
        Ok(input_grads.into_dyn())
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
        LayerSpec::SimpleRecurrent {
            units: self.units,
            activation: self.activation,
            return_seq: self.return_seq,
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// Echo-state reservoir: a [`RecurrentLayer`] whose weights are drawn once,
/// rescaled so the recurrent block has the requested spectral radius, and
/// never trained.
#[derive(Debug, Clone)]
pub struct ReservoirLayer {
    inner: RecurrentLayer,
    spectral_radius: f64,
    seed: Option<u64>,
}

impl ReservoirLayer {
    pub fn new(units: usize, activation: ActivationType, spectral_radius: f64, return_seq: bool) -> Self {
        ReservoirLayer {
            inner: RecurrentLayer::new(units, activation, return_seq),
            spectral_radius,
            seed: None,
        }
    }

    /// Fixes the generator so the same reservoir can be rebuilt.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

impl Layer for ReservoirLayer {
    fn name(&self) -> &'static str {
        "Reservoir"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        if !(self.spectral_radius > 0.0 && self.spectral_radius.is_finite()) {
            return Err(Error::config(format!(
                "Reservoir: spectral radius must be positive, got {}",
                self.spectral_radius
            )));
        }
        self.inner.bind(input_shape)?;

        let seed = *self.seed.get_or_insert_with(|| rng.random());
        let mut local = StdRng::seed_from_u64(seed);
        let (inputs, units) = (self.inner.inputs, self.inner.units);
        let uniform = Uniform::new_inclusive(-1.0, 1.0).map_err(|e| Error::config(e.to_string()))?;

        let mut weights = Array2::from_shape_fn((inputs + units, units), |_| uniform.sample(&mut local));
        let bias = Array1::from_shape_fn(units, |_| uniform.sample(&mut local));

        let radius = spectral_radius(&weights.slice(s![inputs.., ..]).to_owned());
        if radius > 0.0 {
            let scale = self.spectral_radius / radius;
            weights.slice_mut(s![inputs.., ..]).mapv_inplace(|w| w * scale);
        }
        debug!(units, seed, estimated_radius = radius, "reservoir initialized");

        self.inner.set_parameters(weights.into_dyn(), bias.into_dyn());
        Ok(self.inner.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        self.inner.output_shape()
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.inner.forward(input)
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        self.inner.backward(output_gradient)
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Reservoir {
            units: self.inner.units,
            activation: self.inner.activation,
            spectral_radius: self.spectral_radius,
            return_seq: self.inner.return_seq,
            seed: self.seed,
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// Power-iteration estimate of the largest absolute eigenvalue, taken as the
/// geometric mean growth rate over the second half of the iterations.
fn spectral_radius(matrix: &Array2<f64>) -> f64 {
    const ITERATIONS: usize = 200;
    let n = matrix.nrows();
    let mut v = Array1::from_elem(n, 1.0 / (n as f64).sqrt());

    let mut log_growth = 0.0;
    for i in 0..ITERATIONS {
        let w = v.dot(matrix);
        let norm = w.dot(&w).sqrt();
        if norm == 0.0 {
            return 0.0;
        }
        if i >= ITERATIONS / 2 {
            log_growth += norm.ln();
        }
        v = w / norm;
    }
    (log_growth / (ITERATIONS - ITERATIONS / 2) as f64).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array};

    #[test]
    fn last_state_only_without_return_seq() {
        let mut layer = RecurrentLayer::new(3, ActivationType::Tanh, false);
        let out = layer.connect(&[4, 2], &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out, vec![3]);

        let input = Array::from_shape_fn((5, 4, 2), |(b, t, f)| (b + t + f) as f64 * 0.1).into_dyn();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), &[5, 3]);

        let dx = layer.backward(&Tensor::ones(output.raw_dim())).unwrap();
        assert_eq!(dx.shape(), input.shape());
    }

    #[test]
    fn full_sequence_with_return_seq() {
        let mut layer = RecurrentLayer::new(2, ActivationType::Sigmoid, true);
        assert_eq!(layer.connect(&[3, 1], &mut StdRng::seed_from_u64(0)).unwrap(), vec![3, 2]);
        let input = Tensor::zeros(vec![2, 3, 1]);
        assert_eq!(layer.forward(&input).unwrap().shape(), &[2, 3, 2]);
    }

    #[test]
    fn linear_unroll_matches_hand_computation() {
        let mut layer = RecurrentLayer::new(1, ActivationType::Linear, true);
        layer.connect(&[2, 1], &mut StdRng::seed_from_u64(0)).unwrap();
        layer.weights = arr2(&[[2.0], [0.5]]).into_dyn();
        layer.bias = Array1::from(vec![1.0]).into_dyn();

        // h1 = 2·1 + 1 = 3, h2 = 2·2 + 0.5·3 + 1 = 6.5
        let input = Array::from_shape_vec((1, 2, 1), vec![1.0, 2.0]).unwrap().into_dyn();
        let output = layer.forward(&input).unwrap();
        assert_relative_eq!(output[[0, 0, 0]], 3.0);
        assert_relative_eq!(output[[0, 1, 0]], 6.5);
    }

    #[test]
    fn softmax_is_rejected() {
        let mut layer = RecurrentLayer::new(2, ActivationType::Softmax, false);
        let err = layer.connect(&[3, 1], &mut StdRng::seed_from_u64(0));
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn reservoir_is_scaled_and_frozen() {
        let mut layer = ReservoirLayer::new(20, ActivationType::Tanh, 0.9, false);
        layer.connect(&[5, 3], &mut StdRng::seed_from_u64(3)).unwrap();
        assert!(layer.params().is_empty());
        assert_eq!(layer.num_params(), 0);

        let weights = to_matrix("test", &layer.inner.weights).unwrap();
        let recurrent = weights.slice(s![3.., ..]).to_owned();
        assert_relative_eq!(spectral_radius(&recurrent), 0.9, epsilon = 1e-9);
    }

    #[test]
    fn reservoir_seed_reproduces_weights() {
        let mut first = ReservoirLayer::new(6, ActivationType::Tanh, 0.5, true);
        first.connect(&[2, 2], &mut StdRng::seed_from_u64(1)).unwrap();
        let LayerSpec::Reservoir { seed: Some(seed), .. } = first.spec() else {
            panic!("seed not recorded");
        };

        let mut second = ReservoirLayer::new(6, ActivationType::Tanh, 0.5, true).with_seed(seed);
        second.connect(&[2, 2], &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(first.inner.weights, second.inner.weights);
        assert_eq!(first.inner.bias, second.inner.bias);
    }
}
