use rand::rngs::StdRng;

use super::{batched, check_input, Layer, LayerSpec, Shape};
use crate::error::{Error, Result};
use crate::Tensor;

/// Collapses every non-batch axis into one.
#[derive(Debug, Clone, Default)]
pub struct FlattenLayer {
    input_shape: Shape,
    output_shape: Shape,
    batch: Option<usize>,
}

impl FlattenLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for FlattenLayer {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn connect(&mut self, input_shape: &[usize], _rng: &mut StdRng) -> Result<Shape> {
        self.input_shape = input_shape.to_vec();
        self.output_shape = vec![input_shape.iter().product()];
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.input_shape)?;
        let batch = input.shape()[0];
        self.batch = Some(batch);
        reshape(input, &batched(batch, &self.output_shape))
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let batch = self.batch.take().ok_or_else(|| Error::no_forward(self.name()))?;
        reshape(output_gradient, &batched(batch, &self.input_shape))
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Flatten
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// Reinterprets each sample under a new shape with the same element count.
#[derive(Debug, Clone)]
pub struct ReshapeLayer {
    input_shape: Shape,
    target: Shape,
    batch: Option<usize>,
}

impl ReshapeLayer {
    pub fn new(target: &[usize]) -> Self {
        ReshapeLayer {
            input_shape: Vec::new(),
            target: target.to_vec(),
            batch: None,
        }
    }
}

impl Layer for ReshapeLayer {
    fn name(&self) -> &'static str {
        "Reshape"
    }

    fn connect(&mut self, input_shape: &[usize], _rng: &mut StdRng) -> Result<Shape> {
        let have: usize = input_shape.iter().product();
        let want: usize = self.target.iter().product();
        if self.target.is_empty() || have != want {
            return Err(Error::shape(format!(
                "Reshape: cannot reshape {input_shape:?} ({have} elements) into {:?} ({want} elements)",
                self.target
            )));
        }
        self.input_shape = input_shape.to_vec();
        Ok(self.target.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.target
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.input_shape)?;
        let batch = input.shape()[0];
        self.batch = Some(batch);
        reshape(input, &batched(batch, &self.target))
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let batch = self.batch.take().ok_or_else(|| Error::no_forward(self.name()))?;
        reshape(output_gradient, &batched(batch, &self.input_shape))
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Reshape { shape: self.target.clone() }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

fn reshape(tensor: &Tensor, shape: &ndarray::IxDyn) -> Result<Tensor> {
    tensor
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(shape.clone())
        .map_err(|e| Error::shape(format!("cannot reshape {:?} into {:?}: {e}", tensor.shape(), shape)))
}
