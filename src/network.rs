use ndarray::{Array1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::hyperparameters::{EpochRecord, Evaluation, FitConfig, History};
use crate::layers::{InputLayer, Layer, Shape};
use crate::loss::Loss;
use crate::optimizer::Optimizer;
use crate::Tensor;

/// Mutable layer stack, consumed by [`NetworkBuilder::finalize`].
///
/// ```
/// use strata::{ActivationType, Loss, NetworkBuilder, Optimizer, OptimizerConfig};
/// use strata::layers::DenseLayer;
///
/// let network = NetworkBuilder::new(&[2])
///     .with_seed(7)
///     .add(DenseLayer::new(12, ActivationType::Sigmoid))
///     .add(DenseLayer::new(2, ActivationType::Sigmoid))
///     .finalize(Loss::CategoricalCrossEntropy, Optimizer::new(OptimizerConfig::adam(0.01))?)?;
/// assert_eq!(network.output_shape(), &[2]);
/// # Ok::<(), strata::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    input_shape: Shape,
    layers: Vec<Box<dyn Layer>>,
    seed: Option<u64>,
}

impl NetworkBuilder {
    /// Starts a stack whose first layer declares the per-sample input shape.
    pub fn new(input_shape: &[usize]) -> Self {
        NetworkBuilder {
            input_shape: input_shape.to_vec(),
            layers: vec![Box::new(InputLayer::new(input_shape))],
            seed: None,
        }
    }

    /// Seeds parameter initialization, dropout masks and epoch shuffling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn add(self, layer: impl Layer + 'static) -> Self {
        self.add_boxed(Box::new(layer))
    }

    pub fn add_boxed(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Removes the most recently added layer. The input layer cannot be removed.
    pub fn pop(&mut self) -> Result<Box<dyn Layer>> {
        if self.layers.len() <= 1 {
            return Err(Error::state("cannot pop the input layer"));
        }
        self.layers
            .pop()
            .ok_or_else(|| Error::state("cannot pop the input layer"))
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    /// Infers every layer's shape, initializes parameters and binds the loss
    /// and optimizer. The returned network's architecture is fixed.
    pub fn finalize(self, loss: Loss, mut optimizer: Optimizer) -> Result<Network> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut layers = self.layers;
        connect_all(&mut layers, &self.input_shape, &mut rng)?;

        let shapes: Vec<Vec<usize>> = layers
            .iter()
            .flat_map(|layer| layer.params())
            .map(|p| p.shape().to_vec())
            .collect();
        let shape_refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
        optimizer.attach(&shape_refs);

        let softmax_shortcut = loss == Loss::CategoricalCrossEntropy
            && layers.last().and_then(|layer| layer.activation()) == Some(ActivationType::Softmax);

        let shuffler = fastrand::Rng::with_seed(rng.random());
        let network = Network {
            input_shape: self.input_shape,
            layers,
            loss,
            optimizer,
            rng,
            shuffler,
            softmax_shortcut,
            last_output: None,
        };
        debug!(
            layers = network.layers.len(),
            params = network.num_params(),
            loss = %network.loss,
            softmax_shortcut,
            "network finalized"
        );
        Ok(network)
    }
}

fn connect_all(layers: &mut [Box<dyn Layer>], input_shape: &[usize], rng: &mut StdRng) -> Result<()> {
    let mut shape = input_shape.to_vec();
    for (index, layer) in layers.iter_mut().enumerate() {
        shape = layer.connect(&shape, rng)?;
        debug!(
            index,
            layer = layer.name(),
            output = ?shape,
            params = layer.num_params(),
            "layer connected"
        );
    }
    Ok(())
}

/// Gradients produced by one [`Network::backward`] call.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// dL/d(network input)
    pub input: Tensor,
    /// One entry per parameter tensor, in [`Network::get_weights`] order.
    pub params: Vec<Tensor>,
}

/// A finalized network: fixed architecture, loss and optimizer.
#[derive(Debug, Clone)]
pub struct Network {
    pub(crate) input_shape: Shape,
    pub(crate) layers: Vec<Box<dyn Layer>>,
    pub(crate) loss: Loss,
    pub(crate) optimizer: Optimizer,
    rng: StdRng,
    shuffler: fastrand::Rng,
    softmax_shortcut: bool,
    last_output: Option<Tensor>,
}

impl Network {
    pub(crate) fn run(&mut self, input: &Tensor, training: bool) -> Result<Tensor> {
        let mut current = input.clone();
        for layer in &mut self.layers {
            layer.set_training(training);
            current = layer.forward(&current)?;
        }
        self.last_output = Some(current.clone());
        Ok(current)
    }

    /// Training-mode forward pass; the result is kept for [`Network::backward`].
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.run(input, true)
    }

    /// Inference-mode forward pass (dropout disabled).
    pub fn predict(&mut self, input: &Tensor) -> Result<Tensor> {
        self.run(input, false)
    }

    pub fn last_output(&self) -> Option<&Tensor> {
        self.last_output.as_ref()
    }

    /// Back-propagates the loss of the last forward pass against `target`.
    ///
    /// A softmax output layer trained with categorical cross-entropy receives
    /// `prediction − target` directly as its pre-activation gradient.
    pub fn backward(&mut self, target: &Tensor) -> Result<Gradients> {
        let prediction = self
            .last_output
            .as_ref()
            .ok_or_else(|| Error::state("backward called before forward"))?;

        let (mut gradient, skip) = if self.softmax_shortcut {
            if prediction.shape() != target.shape() {
                return Err(Error::shape(format!(
                    "prediction {:?} and target {:?} differ in shape",
                    prediction.shape(),
                    target.shape()
                )));
            }
            let delta = prediction - target;
            let last = self
                .layers
                .last_mut()
                .ok_or_else(|| Error::state("network has no layers"))?;
            (last.backward_preactivation(&delta)?, 1)
        } else {
            (self.loss.derivative(prediction, target)?, 0)
        };

        let depth = self.layers.len() - skip;
        for layer in self.layers[..depth].iter_mut().rev() {
            gradient = layer.backward(&gradient)?;
        }

        let params = self
            .layers
            .iter()
            .flat_map(|layer| layer.grads())
            .cloned()
            .collect();
        Ok(Gradients { input: gradient, params })
    }

    /// One forward/backward/update cycle. Returns the mean per-sample cost.
    pub fn train_on_batch(&mut self, input: &Tensor, target: &Tensor) -> Result<f64> {
        let batch = input.shape().first().copied().unwrap_or(0);
        if batch == 0 {
            return Err(Error::shape("empty batch"));
        }
        let output = self.forward(input)?;
        let cost = self.loss.calculate(&output, target)?;
        let gradients = self.backward(target)?;

        let params: Vec<&mut Tensor> = self
            .layers
            .iter_mut()
            .flat_map(|layer| layer.params_mut())
            .collect();
        self.optimizer.optimize(params, &gradients.params, batch)?;
        Ok(cost / batch as f64)
    }

    /// Mini-batch training. Samples are shuffled jointly with their targets
    /// when requested; the last partial batch is kept.
    pub fn fit(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        config: &FitConfig,
        validation: Option<(&Tensor, &Tensor)>,
    ) -> Result<History> {
        if config.batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        let samples = sample_count(input, target)?;

        let mut history = History::with_capacity(config.epochs);
        let mut order: Vec<usize> = (0..samples).collect();
        for epoch in 0..config.epochs {
            if config.shuffle {
                self.shuffler.shuffle(&mut order);
            }

            let mut total = 0.0;
            for (index, batch) in order.chunks(config.batch_size).enumerate() {
                let x = input.select(Axis(0), batch);
                let y = target.select(Axis(0), batch);
                let cost = self.train_on_batch(&x, &y)?;
                debug!(epoch, batch = index, cost, "batch trained");
                total += cost * batch.len() as f64;
            }
            let cost = total / samples as f64;

            let accuracy = if config.classify {
                self.evaluate(input, target, true)?.accuracy
            } else {
                None
            };
            let validation = validation
                .map(|(x, y)| self.evaluate(x, y, config.classify))
                .transpose()?;

            info!(
                epoch,
                cost,
                accuracy = ?accuracy,
                validation_cost = ?validation.map(|v| v.cost),
                "epoch complete"
            );
            history.push(EpochRecord {
                epoch,
                cost,
                accuracy,
                validation,
            });
        }
        Ok(history)
    }

    /// Inference-mode cost (mean per sample) and, when `classify` is set,
    /// argmax accuracy. Single-unit outputs are thresholded at 0.5 instead.
    pub fn evaluate(&mut self, input: &Tensor, target: &Tensor, classify: bool) -> Result<Evaluation> {
        let samples = sample_count(input, target)?;
        let output = self.predict(input)?;
        let cost = self.loss.calculate(&output, target)? / samples as f64;
        let accuracy = if classify {
            Some(accuracy(&output, target)?)
        } else {
            None
        };
        Ok(Evaluation { cost, accuracy })
    }

    /// Copies of every parameter tensor, layer by layer.
    pub fn get_weights(&self) -> Vec<Tensor> {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .cloned()
            .collect()
    }

    /// All parameters concatenated into one vector, in [`Network::get_weights`] order.
    pub fn get_weights_unfolded(&self) -> Array1<f64> {
        self.layers
            .iter()
            .flat_map(|layer| layer.params())
            .flat_map(|p| p.iter().copied())
            .collect()
    }

    /// Replaces every parameter tensor. Nothing is written unless all shapes match.
    pub fn set_weights(&mut self, weights: Vec<Tensor>) -> Result<()> {
        {
            let current: Vec<&Tensor> = self.layers.iter().flat_map(|layer| layer.params()).collect();
            if current.len() != weights.len() {
                return Err(Error::shape(format!(
                    "expected {} weight tensors, got {}",
                    current.len(),
                    weights.len()
                )));
            }
            for (index, (have, new)) in current.iter().zip(&weights).enumerate() {
                if have.shape() != new.shape() {
                    return Err(Error::shape(format!(
                        "weight tensor {index}: expected shape {:?}, got {:?}",
                        have.shape(),
                        new.shape()
                    )));
                }
            }
        }

        let params = self.layers.iter_mut().flat_map(|layer| layer.params_mut());
        for (param, new) in params.zip(weights) {
            *param = new;
        }
        Ok(())
    }

    /// Inverse of [`Network::get_weights_unfolded`].
    pub fn set_weights_folded(&mut self, flat: &[f64]) -> Result<()> {
        let expected = self.num_params();
        if flat.len() != expected {
            return Err(Error::shape(format!(
                "expected {expected} weights, got {}",
                flat.len()
            )));
        }

        let mut values = flat.iter();
        for param in self.layers.iter_mut().flat_map(|layer| layer.params_mut()) {
            for (p, &v) in param.iter_mut().zip(values.by_ref()) {
                *p = v;
            }
        }
        Ok(())
    }

    /// Re-initializes every parameter and clears the optimizer state.
    pub fn shuffle(&mut self) -> Result<()> {
        connect_all(&mut self.layers, &self.input_shape, &mut self.rng)?;
        self.optimizer.reset();
        self.last_output = None;
        debug!(params = self.num_params(), "parameters re-initialized");
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(|layer| layer.num_params()).sum()
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        self.layers
            .last()
            .map(|layer| layer.output_shape())
            .unwrap_or(self.input_shape.as_slice())
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }
}

fn sample_count(input: &Tensor, target: &Tensor) -> Result<usize> {
    let samples = input.shape().first().copied().unwrap_or(0);
    if samples == 0 || target.shape().first() != Some(&samples) {
        return Err(Error::shape(format!(
            "input {:?} and target {:?} must share a non-empty batch axis",
            input.shape(),
            target.shape()
        )));
    }
    Ok(samples)
}

/// Fraction of last-axis lanes whose argmax agrees.
fn accuracy(output: &Tensor, target: &Tensor) -> Result<f64> {
    if output.shape() != target.shape() || output.ndim() < 2 {
        return Err(Error::shape(format!(
            "cannot score output {:?} against target {:?}",
            output.shape(),
            target.shape()
        )));
    }
    let last = Axis(output.ndim() - 1);
    let binary = output.len_of(last) == 1;

    let mut hits = 0usize;
    let mut total = 0usize;
    for (out, want) in output.lanes(last).into_iter().zip(target.lanes(last)) {
        let hit = if binary {
            (out[0] > 0.5) == (want[0] > 0.5)
        } else {
            argmax(out.iter()) == argmax(want.iter())
        };
        hits += usize::from(hit);
        total += 1;
    }
    Ok(hits as f64 / total.max(1) as f64)
}

fn argmax<'a>(values: impl Iterator<Item = &'a f64>) -> Option<usize> {
    values
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{DenseLayer, DropoutLayer};
    use crate::optimizer::OptimizerConfig;
    use ndarray::arr2;

    fn network(loss: Loss) -> Network {
        NetworkBuilder::new(&[3])
            .with_seed(11)
            .add(DenseLayer::new(4, ActivationType::Tanh))
            .add(DenseLayer::new(2, ActivationType::Softmax))
            .finalize(loss, Optimizer::new(OptimizerConfig::sgd(0.1)).unwrap())
            .unwrap()
    }

    #[test]
    fn pop_never_removes_input() {
        let mut builder = NetworkBuilder::new(&[2]).add(DenseLayer::new(3, ActivationType::ReLU));
        assert_eq!(builder.pop().unwrap().name(), "Dense");
        assert!(matches!(builder.pop(), Err(Error::InvalidState(_))));
        assert_eq!(builder.layers().len(), 1);
    }

    #[test]
    fn finalize_reports_incompatible_layers() {
        let result = NetworkBuilder::new(&[2, 3])
            .add(DenseLayer::new(3, ActivationType::ReLU))
            .finalize(Loss::MeanSquaredError, Optimizer::from_name("sgd").unwrap());
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn backward_before_forward_fails() {
        let mut net = network(Loss::MeanSquaredError);
        let y = arr2(&[[1.0, 0.0]]).into_dyn();
        assert!(matches!(net.backward(&y), Err(Error::InvalidState(_))));
    }

    #[test]
    fn shortcut_only_for_softmax_cross_entropy() {
        assert!(network(Loss::CategoricalCrossEntropy).softmax_shortcut);
        assert!(!network(Loss::MeanSquaredError).softmax_shortcut);
    }

    #[test]
    fn same_seed_same_parameters() {
        let a = network(Loss::MeanSquaredError);
        let b = network(Loss::MeanSquaredError);
        assert_eq!(a.get_weights(), b.get_weights());
    }

    #[test]
    fn set_weights_is_atomic() {
        let mut net = network(Loss::MeanSquaredError);
        let before = net.get_weights();
        let mut bad = before.clone();
        bad[0] = Tensor::zeros(vec![3, 4]);
        bad[3] = Tensor::zeros(vec![5]);
        assert!(matches!(net.set_weights(bad), Err(Error::Shape(_))));
        assert_eq!(net.get_weights(), before);

        assert!(net.set_weights_folded(&[0.0; 3]).is_err());
        assert_eq!(net.get_weights(), before);
    }

    #[test]
    fn shuffle_reinitializes() {
        let mut net = network(Loss::MeanSquaredError);
        let before = net.get_weights_unfolded();
        net.shuffle().unwrap();
        assert_eq!(net.get_weights_unfolded().len(), before.len());
        assert_ne!(net.get_weights_unfolded(), before);
    }

    #[test]
    fn predict_disables_dropout() {
        let mut net = NetworkBuilder::new(&[50])
            .with_seed(3)
            .add(DropoutLayer::new(0.5))
            .finalize(Loss::MeanSquaredError, Optimizer::from_name("sgd").unwrap())
            .unwrap();
        let x = Tensor::ones(vec![2, 50]);
        assert_eq!(net.predict(&x).unwrap(), x);
        assert_ne!(net.forward(&x).unwrap(), x);
    }

    #[test]
    fn accuracy_by_argmax_and_threshold() {
        let out = arr2(&[[0.9, 0.1], [0.2, 0.8], [0.6, 0.4]]).into_dyn();
        let y = arr2(&[[1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]).into_dyn();
        assert!((accuracy(&out, &y).unwrap() - 2.0 / 3.0).abs() < 1e-12);

        let out = arr2(&[[0.7], [0.2]]).into_dyn();
        let y = arr2(&[[1.0], [1.0]]).into_dyn();
        assert_eq!(accuracy(&out, &y).unwrap(), 0.5);
    }

    #[test]
    fn mismatched_batch_axis_is_rejected() {
        let mut net = network(Loss::MeanSquaredError);
        let x = Tensor::zeros(vec![4, 3]);
        let y = Tensor::zeros(vec![3, 2]);
        let err = net.fit(&x, &y, &FitConfig::new(1, 2), None);
        assert!(matches!(err, Err(Error::Shape(_))));
    }
}
