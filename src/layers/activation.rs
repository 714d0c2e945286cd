use rand::rngs::StdRng;

use super::{check_input, Layer, LayerSpec, Shape};
use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::Tensor;

/// Applies an activation function on its own, keeping the shape.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    function: ActivationType,
    shape: Shape,
    cache: Option<(Tensor, Tensor)>,
}

impl ActivationLayer {
    pub fn new(function: ActivationType) -> Self {
        ActivationLayer {
            function,
            shape: Vec::new(),
            cache: None,
        }
    }
}

impl Layer for ActivationLayer {
    fn name(&self) -> &'static str {
        "Activation"
    }

    fn connect(&mut self, input_shape: &[usize], _rng: &mut StdRng) -> Result<Shape> {
        self.shape = input_shape.to_vec();
        Ok(self.shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.shape)?;
        let output = self.function.forward(input);
        self.cache = Some((input.clone(), output.clone()));
        Ok(output)
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let (input, output) = self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        Ok(self.function.backward(&input, &output, output_gradient))
    }

    fn backward_preactivation(&mut self, delta: &Tensor) -> Result<Tensor> {
        self.cache.take().ok_or_else(|| Error::no_forward(self.name()))?;
        Ok(delta.clone())
    }

    fn activation(&self) -> Option<ActivationType> {
        Some(self.function)
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Activation { function: self.function }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
