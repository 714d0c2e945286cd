use rand::rngs::StdRng;
use rand::Rng;

use super::{check_input, Layer, LayerSpec, Shape};
use crate::error::{Error, Result};
use crate::Tensor;

/// Inverted dropout: zeroes each activation with probability `rate` while
/// training and rescales the survivors, so inference is the identity.
#[derive(Debug, Clone)]
pub struct DropoutLayer {
    dropout_rate: f64,
    scale: f64,
    shape: Shape,
    is_training: bool,
    rng: fastrand::Rng,
    mask: Option<DropoutMask>,
}

#[derive(Debug, Clone)]
enum DropoutMask {
    Identity,
    Mask(Tensor),
}

impl DropoutLayer {
    pub fn new(dropout_rate: f64) -> Self {
        DropoutLayer {
            dropout_rate,
            scale: 1.0 / (1.0 - dropout_rate), // Scale factor for training
            shape: Vec::new(),
            is_training: true,
            rng: fastrand::Rng::with_seed(0),
            mask: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.dropout_rate
    }
}

impl Layer for DropoutLayer {
    fn name(&self) -> &'static str {
        "DropOut"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::config(format!(
                "DropOut: rate must lie in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        self.shape = input_shape.to_vec();
        self.rng = fastrand::Rng::with_seed(rng.random());
        Ok(self.shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.shape)?;
        if !self.is_training || self.dropout_rate == 0.0 {
            // During inference, just pass through
            self.mask = Some(DropoutMask::Identity);
            return Ok(input.clone());
        }

        let keep = 1.0 - self.dropout_rate;
        let scale = self.scale;
        let rng = &mut self.rng;
        let mask = Tensor::from_shape_fn(input.raw_dim(), |_| if rng.f64() < keep { scale } else { 0.0 });
        let output = input * &mask;
        self.mask = Some(DropoutMask::Mask(mask));
        Ok(output)
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        match self.mask.take() {
            Some(DropoutMask::Mask(mask)) => Ok(output_gradient * &mask),
            Some(DropoutMask::Identity) => Ok(output_gradient.clone()),
            None => Err(Error::no_forward(self.name())),
        }
    }

    fn set_training(&mut self, is_training: bool) {
        self.is_training = is_training;
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Dropout { rate: self.dropout_rate }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, ArrayD, IxDyn};
    use rand::SeedableRng;

    fn connected(rate: f64) -> DropoutLayer {
        let mut layer = DropoutLayer::new(rate);
        layer.connect(&[50], &mut StdRng::seed_from_u64(7)).unwrap();
        layer
    }

    #[test]
    fn zero_rate_is_identity() {
        let mut layer = connected(0.0);
        let input = Array2::from_shape_fn((4, 50), |(i, j)| (i * 50 + j) as f64 * 0.01).into_dyn();
        assert_eq!(layer.forward(&input).unwrap(), input);
        let grad = input.mapv(|x| x - 1.0);
        assert_eq!(layer.backward(&grad).unwrap(), grad);
    }

    #[test]
    fn mask_is_scaled_and_reused_in_backward() {
        let mut layer = connected(0.5);
        let input = ArrayD::ones(IxDyn(&[8, 50]));
        let output = layer.forward(&input).unwrap();
        assert!(output.iter().all(|&x| x == 0.0 || x == 2.0));
        let dropped = output.iter().filter(|&&x| x == 0.0).count();
        assert!(dropped > 100 && dropped < 300);

        let grad = ArrayD::ones(IxDyn(&[8, 50]));
        assert_eq!(layer.backward(&grad).unwrap(), output);
    }

    #[test]
    fn inference_mode_passes_through() {
        let mut layer = connected(0.9);
        layer.set_training(false);
        let input = ArrayD::from_elem(IxDyn(&[3, 50]), 0.25);
        assert_eq!(layer.forward(&input).unwrap(), input);
    }

    #[test]
    fn invalid_rate_is_a_configuration_error() {
        let mut layer = DropoutLayer::new(1.0);
        let err = layer.connect(&[4], &mut StdRng::seed_from_u64(0));
        assert!(matches!(err, Err(Error::Configuration(_))));
    }
}
