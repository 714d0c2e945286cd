use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;

use super::recurrent::{emit, sequence_gradient, sequence_output_shape, sequence_shape, vector};
use super::{check_input, he_normal, to_matrix, to_rank3, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Long short-term memory layer.
///
/// Gates `f, i, o` use the sigmoid; the candidate `c̃` and the cell output use
/// `activation`. `W` is `((inputs + units) × 4·units)` laid out as `[f, i, o, c̃]`.
#[derive(Debug, Clone)]
pub struct LstmLayer {
    units: usize,
    activation: ActivationType,
    return_seq: bool,
    inputs: usize,
    steps: usize,
    weights: Tensor,
    bias: Tensor,
    weight_grads: Tensor,
    bias_grads: Tensor,
    output_shape: Shape,
    cache: Option<Vec<LstmStep>>,
}

#[derive(Debug, Clone)]
struct LstmStep {
    joined: Array2<f64>,
    forget: Array2<f64>,
    input: Array2<f64>,
    output: Array2<f64>,
    candidate: Array2<f64>,
    prev_cell: Array2<f64>,
    /// `φ(C_t)`
    cell_out: Array2<f64>,
    hidden: Array2<f64>,
}

fn sigmoid(z: &Array2<f64>) -> Array2<f64> {
    z.mapv(|v| ActivationType::Sigmoid.apply(v))
}

fn sigmoid_grad(gate: &Array2<f64>) -> Array2<f64> {
    gate.mapv(|v| v * (1.0 - v))
}

impl LstmLayer {
    pub fn new(units: usize, activation: ActivationType, return_seq: bool) -> Self {
        LstmLayer {
            units,
            activation,
            return_seq,
            inputs: 0,
            steps: 0,
            weights: Tensor::zeros(vec![0, 4 * units]),
            bias: Tensor::zeros(vec![4 * units]),
            weight_grads: Tensor::zeros(vec![0, 4 * units]),
            bias_grads: Tensor::zeros(vec![4 * units]),
            output_shape: Vec::new(),
            cache: None,
        }
    }
}

impl Layer for LstmLayer {
    fn name(&self) -> &'static str {
        "LSTM"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        let (steps, inputs) = sequence_shape(self.name(), input_shape, self.units, self.activation)?;
        self.steps = steps;
        self.inputs = inputs;
        self.output_shape = sequence_output_shape(steps, self.units, self.return_seq);

        let fan_in = inputs + self.units;
        self.weights = he_normal(&[fan_in, 4 * self.units], fan_in, rng)?;
        let mut bias = Array1::zeros(4 * self.units);
        // forget gate starts open
        bias.slice_mut(s![..self.units]).fill(1.0);
        self.bias = bias.into_dyn();
        self.weight_grads = Tensor::zeros(self.weights.raw_dim());
        self.bias_grads = Tensor::zeros(self.bias.raw_dim());
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
        let u = self.units;

        let batch = x.shape()[0];
        let mut hidden = Array2::<f64>::zeros((batch, u));
        let mut cell = Array2::<f64>::zeros((batch, u));
        let mut steps = Vec::with_capacity(self.steps);
        for t in 0..self.steps {
            let joined = concatenate(Axis(1), &[x.slice(s![.., t, ..]), hidden.view()])
                .map_err(|e| Error::shape(format!("LSTM: {e}")))?;
            let z = joined.dot(&weights) + &bias;

            let forget = sigmoid(&z.slice(s![.., ..u]).to_owned());
            let input_gate = sigmoid(&z.slice(s![.., u..2 * u]).to_owned());
            let output = sigmoid(&z.slice(s![.., 2 * u..3 * u]).to_owned());
            let candidate = z.slice(s![.., 3 * u..]).mapv(|v| self.activation.apply(v));

            let prev_cell = cell;
            cell = &forget * &prev_cell + &input_gate * &candidate;
            let cell_out = cell.mapv(|v| self.activation.apply(v));
            hidden = &output * &cell_out;

            steps.push(LstmStep {
                joined,
                forget,
                input: input_gate,
                output,
                candidate,
                prev_cell,
                cell_out,
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
        let act = self.activation;

        let batch = grads.shape()[0];
        let mut weight_grads = Array2::<f64>::zeros(weights.raw_dim());
        let mut bias_grads = Array1::<f64>::zeros(4 * self.units);
        let mut input_grads = Array3::<f64>::zeros((batch, self.steps, self.inputs));
        let mut dh_next = Array2::<f64>::zeros((batch, self.units));
        let mut dc_next = Array2::<f64>::zeros((batch, self.units));

        for (t, step) in steps.iter().enumerate().rev() {
            let dh = &grads.slice(s![.., t, ..]) + &dh_next;
            let dc = &dh * &step.output * &step.cell_out.mapv(|a| act.derivative_from_output(a)) + &dc_next;

            let d_output = &dh * &step.cell_out * sigmoid_grad(&step.output);
            let d_forget = &dc * &step.prev_cell * sigmoid_grad(&step.forget);
            let d_input = &dc * &step.candidate * sigmoid_grad(&step.input);
            let d_candidate =
                &dc * &step.input * &step.candidate.mapv(|a| act.derivative_from_output(a));

            let dz = concatenate(
                Axis(1),
                &[d_forget.view(), d_input.view(), d_output.view(), d_candidate.view()],
            )
            .map_err(|e| Error::shape(format!("LSTM: {e}")))?;

            weight_grads += &step.joined.t().dot(&dz);
            bias_grads += &dz.sum_axis(Axis(0));
            let d_joined = dz.dot(&weights.t());
            input_grads
                .slice_mut(s![.., t, ..])
                .assign(&d_joined.slice(s![.., ..self.inputs]));
            dh_next = d_joined.slice(s![.., self.inputs..]).to_owned();
            dc_next = dc * &step.forget;
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
        LayerSpec::Lstm {
            units: self.units,
            activation: self.activation,
            return_seq: self.return_seq,
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use rand::SeedableRng;

    #[test]
    fn parameter_layout() {
        let mut layer = LstmLayer::new(3, ActivationType::Tanh, false);
        assert_eq!(layer.connect(&[6, 2], &mut StdRng::seed_from_u64(0)).unwrap(), vec![3]);
        assert_eq!(layer.weights.shape(), &[5, 12]);
        assert_eq!(layer.bias.shape(), &[12]);
        assert_eq!(layer.num_params(), 5 * 12 + 12);
    }

    #[test]
    fn hidden_state_is_bounded() {
        let mut layer = LstmLayer::new(4, ActivationType::Tanh, true);
        layer.connect(&[10, 3], &mut StdRng::seed_from_u64(5)).unwrap();
        let input = Array::from_shape_fn((2, 10, 3), |(b, t, f)| ((b + 2 * t + 3 * f) as f64).sin() * 5.0).into_dyn();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), &[2, 10, 4]);
        assert!(output.iter().all(|h| h.abs() < 1.0));
    }

    #[test]
    fn backward_twice_fails() {
        let mut layer = LstmLayer::new(2, ActivationType::Tanh, false);
        layer.connect(&[3, 1], &mut StdRng::seed_from_u64(0)).unwrap();
        let output = layer.forward(&Tensor::ones(vec![1, 3, 1])).unwrap();
        let grad = Tensor::ones(output.raw_dim());
        layer.backward(&grad).unwrap();
        assert!(matches!(layer.backward(&grad), Err(Error::InvalidState(_))));
    }
}
