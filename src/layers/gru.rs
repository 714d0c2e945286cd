use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;

use super::recurrent::{emit, sequence_gradient, sequence_output_shape, sequence_shape, vector};
use super::{check_input, he_normal, to_matrix, to_rank3, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Gated recurrent unit.
///
/// ```text
/// [z, r] = σ([x_t, h_{t−1}]·W_g + b_g)
/// n      = φ([x_t, r⊙h_{t−1}]·W_n + b_n)
/// h_t    = (1 − z)⊙n + z⊙h_{t−1}
/// ```
#[derive(Debug, Clone)]
pub struct GruLayer {
    units: usize,
    activation: ActivationType,
    return_seq: bool,
    inputs: usize,
    steps: usize,
    /// ((inputs + units) × 2·units), update gate columns first.
    gate_weights: Tensor,
    gate_bias: Tensor,
    /// ((inputs + units) × units)
    candidate_weights: Tensor,
    candidate_bias: Tensor,
    grads: [Tensor; 4],
    output_shape: Shape,
    cache: Option<Vec<GruStep>>,
}

#[derive(Debug, Clone)]
struct GruStep {
    gate_in: Array2<f64>,
    candidate_in: Array2<f64>,
    prev_hidden: Array2<f64>,
    update: Array2<f64>,
    reset: Array2<f64>,
    candidate: Array2<f64>,
    hidden: Array2<f64>,
}

impl GruLayer {
    pub fn new(units: usize, activation: ActivationType, return_seq: bool) -> Self {
        GruLayer {
            units,
            activation,
            return_seq,
            inputs: 0,
            steps: 0,
            gate_weights: Tensor::zeros(vec![0, 2 * units]),
            gate_bias: Tensor::zeros(vec![2 * units]),
            candidate_weights: Tensor::zeros(vec![0, units]),
            candidate_bias: Tensor::zeros(vec![units]),
            grads: Default::default(),
            output_shape: Vec::new(),
            cache: None,
        }
    }
}

impl Layer for GruLayer {
    fn name(&self) -> &'static str {
        "GRU"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        let (steps, inputs) = sequence_shape(self.name(), input_shape, self.units, self.activation)?;
        self.steps = steps;
        self.inputs = inputs;
        self.output_shape = sequence_output_shape(steps, self.units, self.return_seq);

        let fan_in = inputs + self.units;
        self.gate_weights = he_normal(&[fan_in, 2 * self.units], fan_in, rng)?;
        self.gate_bias = Array1::zeros(2 * self.units).into_dyn();
        self.candidate_weights = he_normal(&[fan_in, self.units], fan_in, rng)?;
        self.candidate_bias = Array1::zeros(self.units).into_dyn();
        self.grads = [
            Tensor::zeros(self.gate_weights.raw_dim()),
            Tensor::zeros(self.gate_bias.raw_dim()),
            Tensor::zeros(self.candidate_weights.raw_dim()),
            Tensor::zeros(self.candidate_bias.raw_dim()),
        ];
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &[self.steps, self.inputs])?;
        let x = to_rank3(self.name(), input)?;
        let gate_weights = to_matrix(self.name(), &self.gate_weights)?;
        let gate_bias = vector(self.name(), &self.gate_bias)?;
        let candidate_weights = to_matrix(self.name(), &self.candidate_weights)?;
        let candidate_bias = vector(self.name(), &self.candidate_bias)?;
        let u = self.units;

        let batch = x.shape()[0];
        let mut hidden = Array2::<f64>::zeros((batch, u));
        let mut steps = Vec::with_capacity(self.steps);
        for t in 0..self.steps {
            let x_t = x.slice(s![.., t, ..]);
            let gate_in = concatenate(Axis(1), &[x_t, hidden.view()])
                .map_err(|e| Error::shape(format!("GRU: {e}")))?;
            let gates = (gate_in.dot(&gate_weights) + &gate_bias).mapv(|v| ActivationType::Sigmoid.apply(v));
            let update = gates.slice(s![.., ..u]).to_owned();
            let reset = gates.slice(s![.., u..]).to_owned();

            let reset_hidden = &reset * &hidden;
            let candidate_in = concatenate(Axis(1), &[x_t, reset_hidden.view()])
                .map_err(|e| Error::shape(format!("GRU: {e}")))?;
            let candidate =
                (candidate_in.dot(&candidate_weights) + &candidate_bias).mapv(|v| self.activation.apply(v));

            let prev_hidden = hidden;
            hidden = &update.mapv(|z| 1.0 - z) * &candidate + &update * &prev_hidden;

            steps.push(GruStep {
                gate_in,
                candidate_in,
                prev_hidden,
                update,
                reset,
                candidate,
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
        let gate_weights = to_matrix(self.name(), &self.gate_weights)?;
        let candidate_weights = to_matrix(self.name(), &self.candidate_weights)?;
        let (inputs, act) = (self.inputs, self.activation);

        let batch = grads.shape()[0];
        let mut d_gate_weights = Array2::<f64>::zeros(gate_weights.raw_dim());
        let mut d_gate_bias = Array1::<f64>::zeros(2 * self.units);
        let mut d_candidate_weights = Array2::<f64>::zeros(candidate_weights.raw_dim());
        let mut d_candidate_bias = Array1::<f64>::zeros(self.units);
        let mut input_grads = Array3::<f64>::zeros((batch, self.steps, inputs));
        let mut dh_next = Array2::<f64>::zeros((batch, self.units));

        for (t, step) in steps.iter().enumerate().rev() {
            let dh = &grads.slice(s![.., t, ..]) + &dh_next;

            let d_candidate = &dh * &step.update.mapv(|z| 1.0 - z);
            let d_update = &dh * &(&step.prev_hidden - &step.candidate);
            let mut d_prev = &dh * &step.update;

            // candidate branch
            let d_candidate_pre = d_candidate * step.candidate.mapv(|a| act.derivative_from_output(a));
            d_candidate_weights += &step.candidate_in.t().dot(&d_candidate_pre);
            d_candidate_bias += &d_candidate_pre.sum_axis(Axis(0));
            let d_candidate_in = d_candidate_pre.dot(&candidate_weights.t());
            let mut dx = d_candidate_in.slice(s![.., ..inputs]).to_owned();
            let d_reset_hidden = d_candidate_in.slice(s![.., inputs..]);
            let d_reset = &d_reset_hidden * &step.prev_hidden;
            d_prev += &(&d_reset_hidden * &step.reset);

            // gates
            let d_update_pre = d_update * step.update.mapv(|z| z * (1.0 - z));
            let d_reset_pre = d_reset * step.reset.mapv(|r| r * (1.0 - r));
            let d_gates = concatenate(Axis(1), &[d_update_pre.view(), d_reset_pre.view()])
                .map_err(|e| Error::shape(format!("GRU: {e}")))?;
            d_gate_weights += &step.gate_in.t().dot(&d_gates);
            d_gate_bias += &d_gates.sum_axis(Axis(0));
            let d_gate_in = d_gates.dot(&gate_weights.t());
            dx += &d_gate_in.slice(s![.., ..inputs]);
            d_prev += &d_gate_in.slice(s![.., inputs..]);

            input_grads.slice_mut(s![.., t, ..]).assign(&dx);
            dh_next = d_prev;
        }

        self.grads = [
            d_gate_weights.into_dyn(),
            d_gate_bias.into_dyn(),
            d_candidate_weights.into_dyn(),
            d_candidate_bias.into_dyn(),
        ];
        Ok(input_grads.into_dyn())
    }

    fn params(&self) -> Vec<&Tensor> {
        vec![
            &self.gate_weights,
            &self.gate_bias,
            &self.candidate_weights,
            &self.candidate_bias,
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![
            &mut self.gate_weights,
            &mut self.gate_bias,
            &mut self.candidate_weights,
            &mut self.candidate_bias,
        ]
    }

    fn grads(&self) -> Vec<&Tensor> {
        self.grads.iter().collect()
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Gru {
            units: self.units,
            activation: self.activation,
            return_seq: self.return_seq,
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
