use ndarray::Array4;
use rand::rngs::StdRng;

use super::{check_input, to_rank4, Layer, LayerSpec, Shape};
use crate::error::{Error, Result};
use crate::Tensor;

/// Non-overlapping `size × size` max pooling over `(batch, channels, x, y)`.
///
/// Trailing rows and columns that do not fill a whole window are dropped.
#[derive(Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: usize,
    input_shape: Shape,
    output_shape: Shape,
    /// Flat `x * width + y` position of each window's maximum.
    max_indices: Option<Array4<usize>>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: usize) -> Self {
        MaxPoolLayer {
            pool_size,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            max_indices: None,
        }
    }
}

impl Layer for MaxPoolLayer {
    fn name(&self) -> &'static str {
        "Pool"
    }

    fn connect(&mut self, input_shape: &[usize], _rng: &mut StdRng) -> Result<Shape> {
        if self.pool_size == 0 {
            return Err(Error::config("Pool: window size must be positive"));
        }
        let &[channels, height, width] = input_shape else {
            return Err(Error::shape(format!(
                "Pool: expected input shape (channels, x, y), got {input_shape:?}"
            )));
        };
        if height < self.pool_size || width < self.pool_size {
            return Err(Error::shape(format!(
                "Pool: window {0}x{0} does not fit input {height}x{width}",
                self.pool_size
            )));
        }
        self.input_shape = input_shape.to_vec();
        self.output_shape = vec![channels, height / self.pool_size, width / self.pool_size];
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        check_input(self.name(), input, &self.input_shape)?;
        let input = to_rank4(self.name(), input)?;
        let (batch, channels, _, width) = input.dim();
        let (out_h, out_w) = (self.output_shape[1], self.output_shape[2]);
        let f = self.pool_size;

        let mut output = Array4::<f64>::zeros((batch, channels, out_h, out_w));
        let mut max_indices = Array4::<usize>::zeros((batch, channels, out_h, out_w));

        // Perform max pooling
        for ((b, c, i, j), out) in output.indexed_iter_mut() {
            // start from the window's first element so the index never leaves it
            let mut max_idx = (i * f) * width + j * f;
            let mut max_val = input[[b, c, i * f, j * f]];
            for u in i * f..(i + 1) * f {
                for v in j * f..(j + 1) * f {
                    let val = input[[b, c, u, v]];
                    if val > max_val {
                        max_val = val;
                        max_idx = u * width + v;
                    }
                }
            }
            *out = max_val;
            max_indices[[b, c, i, j]] = max_idx;
        }

        self.max_indices = Some(max_indices);
        Ok(output.into_dyn())
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let max_indices = self.max_indices.take().ok_or_else(|| Error::no_forward(self.name()))?;
        let grad = to_rank4(self.name(), output_gradient)?;
        if grad.dim() != max_indices.dim() {
            return Err(Error::shape(format!(
                "Pool: gradient shape {:?} does not match output {:?}",
                grad.shape(),
                max_indices.shape()
            )));
        }

        let (batch, channels) = (grad.shape()[0], grad.shape()[1]);
        let (height, width) = (self.input_shape[1], self.input_shape[2]);
        let mut input_gradient = Array4::<f64>::zeros((batch, channels, height, width));
        for ((b, c, i, j), &idx) in max_indices.indexed_iter() {
            input_gradient[[b, c, idx / width, idx % width]] += grad[[b, c, i, j]];
        }
        Ok(input_gradient.into_dyn())
    }

    fn spec(&self) -> LayerSpec {
        LayerSpec::Pool { size: self.pool_size }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
