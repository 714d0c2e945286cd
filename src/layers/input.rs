use rand::rngs::StdRng;

use super::{check_input, Layer, LayerSpec, Shape};
use crate::error::{Error, Result};
use crate::Tensor;

/// First layer of every network; declares and checks the sample shape.
#[derive(Debug, Clone)]
pub struct InputLayer {
    shape: Shape,
    /// Batch size of the last forward pass.
    batch: Option<usize>,
}

impl InputLayer {
    pub fn new(shape: &[usize]) -> Self {
        InputLayer {
            shape: shape.to_vec(),
            batch: None,
        }
    }
}

impl Layer for InputLayer {
    fn name(&self) -> &'static str {
        "Input"
    }

    fn connect(&mut self, input_shape: &[usize], _rng: &mut StdRng) -> Result<Shape> {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(Error::config(format!("Input: invalid shape {:?}", self.shape)));
        }
        if input_shape != self.shape.as_slice() {
            return Err(Error::shape(format!(
                "Input: declared shape {:?} but received {:?}",
                self.shape, input_shape
            )));
        }
        Ok(self.shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.shape)?;
        self.batch = Some(input.shape()[0]);
        Ok(input.clone())
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let batch = self.batch.take().ok_or_else(|| Error::no_forward(self.name()))?;
        check_input(self.name(), output_gradient, &self.shape)?;
        if output_gradient.shape()[0] != batch {
            return Err(Error::shape(format!(
                "Input: gradient batch {} does not match forward batch {batch}",
                output_gradient.shape()[0]
            )));
        }
        Ok(output_gradient.clone())
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Input { shape: self.shape.clone() }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn connected() -> InputLayer {
        let mut layer = InputLayer::new(&[3]);
        layer.connect(&[3], &mut StdRng::seed_from_u64(0)).unwrap();
        layer
    }

    #[test]
    fn backward_requires_forward() {
        let mut layer = connected();
        let grad = Tensor::ones(vec![2, 3]);
        assert!(matches!(layer.backward(&grad), Err(Error::InvalidState(_))));

        layer.forward(&Tensor::zeros(vec![2, 3])).unwrap();
        assert_eq!(layer.backward(&grad).unwrap(), grad);
        assert!(matches!(layer.backward(&grad), Err(Error::InvalidState(_))));
    }

    #[test]
    fn backward_checks_batch() {
        let mut layer = connected();
        layer.forward(&Tensor::zeros(vec![2, 3])).unwrap();
        let grad = Tensor::ones(vec![4, 3]);
        assert!(matches!(layer.backward(&grad), Err(Error::Shape(_))));
    }
}
