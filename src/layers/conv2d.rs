use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, Array4, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{check_input, he_normal, to_rank4, Layer, LayerSpec, Shape};
use crate::error::{Error, Result};
use crate::Tensor;

/// Border handling of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvMode {
    /// No padding; output shrinks by `filter − 1`.
    #[default]
    Valid,
    /// Pads `filter − 1` on both sides; output grows by `filter − 1`.
    Full,
    /// Pads `filter − 1` in total (extra on the far side); output keeps its size.
    Same,
}

impl ConvMode {
    /// (before, after) padding along one axis for a filter of `size`.
    fn padding(&self, size: usize) -> (usize, usize) {
        match self {
            ConvMode::Valid => (0, 0),
            ConvMode::Full => (size - 1, size - 1),
            ConvMode::Same => {
                let total = size - 1;
                (total / 2, total - total / 2)
            }
        }
    }
}

impl FromStr for ConvMode {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "valid" => Ok(ConvMode::Valid),
            "full" => Ok(ConvMode::Full),
            "same" => Ok(ConvMode::Same),
            _ => Err(Error::config(format!("unknown convolution mode '{name}'"))),
        }
    }
}

impl fmt::Display for ConvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConvMode::Valid => "valid",
            ConvMode::Full => "full",
            ConvMode::Same => "same",
        };
        f.write_str(name)
    }
}

/// 2-D cross-correlation over `(batch, channels, x, y)` inputs, stride 1.
#[derive(Debug, Clone)]
pub struct Conv2DLayer {
    filters: usize,
    kernel_size: (usize, usize),
    mode: ConvMode,
    /// (channels, x, y)
    input_shape: (usize, usize, usize),
    output_shape: Shape,
    /// ((before, after) along x, (before, after) along y)
    padding: ((usize, usize), (usize, usize)),
    /// (filters × channels × fx × fy)
    weights: Tensor,
    bias: Tensor,
    weight_grads: Tensor,
    bias_grads: Tensor,
    /// im2col matrix of the last input
    cols: Option<(usize, Array2<f64>)>,
}

impl Conv2DLayer {
    pub fn new(filters: usize, filter_x: usize, filter_y: usize, mode: ConvMode) -> Self {
        Conv2DLayer {
            filters,
            kernel_size: (filter_x, filter_y),
            mode,
            input_shape: (0, 0, 0),
            output_shape: Vec::new(),
            padding: ((0, 0), (0, 0)),
            weights: Tensor::zeros(vec![filters, 0, filter_x, filter_y]),
            bias: Tensor::zeros(vec![filters]),
            weight_grads: Tensor::zeros(vec![filters, 0, filter_x, filter_y]),
            bias_grads: Tensor::zeros(vec![filters]),
            cols: None,
        }
    }

    fn patch_len(&self) -> usize {
        self.input_shape.0 * self.kernel_size.0 * self.kernel_size.1
    }

    fn output_hw(&self) -> (usize, usize) {
        (self.output_shape[1], self.output_shape[2])
    }

    /// Filters as a (filters × channels·fx·fy) matrix.
    fn filter_matrix(&self) -> Result<Array2<f64>> {
        to_rank4(self.name(), &self.weights)?
            .into_shape_with_order((self.filters, self.patch_len()))
            .map_err(|e| Error::shape(format!("Conv: {e}")))
    }

    /// One row per output position `(b, i, j)`, one column per `(c, u, v)`
    /// filter tap, read from the padded input.
    fn im2col(&self, input: &Array4<f64>) -> Array2<f64> {
        let (batch, _, height, width) = input.dim();
        let ((top, _), (left, _)) = self.padding;
        let (fx, fy) = self.kernel_size;
        let (out_h, out_w) = self.output_hw();

        let mut cols = Array2::zeros((batch * out_h * out_w, self.patch_len()));
        for ((row, col), value) in cols.indexed_iter_mut() {
            let (b, i, j) = (row / (out_h * out_w), (row / out_w) % out_h, row % out_w);
            let (c, u, v) = (col / (fx * fy), (col / fy) % fx, col % fy);
            // position in the unpadded input
            let (x, y) = ((i + u).wrapping_sub(top), (j + v).wrapping_sub(left));
            if x < height && y < width {
                *value = input[[b, c, x, y]];
            }
        }
        cols
    }

    /// Adjoint of [`Conv2DLayer::im2col`]: sums each column entry back onto the
    /// input position it was read from, discarding the padding.
    fn col2im(&self, cols: &Array2<f64>, batch: usize) -> Array4<f64> {
        let (channels, height, width) = self.input_shape;
        let ((top, _), (left, _)) = self.padding;
        let (fx, fy) = self.kernel_size;
        let (out_h, out_w) = self.output_hw();

        let mut image = Array4::zeros((batch, channels, height, width));
        for ((row, col), &value) in cols.indexed_iter() {
            let (b, i, j) = (row / (out_h * out_w), (row / out_w) % out_h, row % out_w);
            let (c, u, v) = (col / (fx * fy), (col / fy) % fx, col % fy);
            let (x, y) = ((i + u).wrapping_sub(top), (j + v).wrapping_sub(left));
            if x < height && y < width {
                image[[b, c, x, y]] += value;
            }
        }
        image
    }
}

impl Layer for Conv2DLayer {
    fn name(&self) -> &'static str {
        "Conv"
    }

    fn connect(&mut self, input_shape: &[usize], rng: &mut StdRng) -> Result<Shape> {
        let (fx, fy) = self.kernel_size;
        if self.filters == 0 || fx == 0 || fy == 0 {
            return Err(Error::config("Conv: filter count and filter sizes must be positive"));
        }
        let &[channels, height, width] = input_shape else {
            return Err(Error::shape(format!(
                "Conv: expected input shape (channels, x, y), got {input_shape:?}"
            )));
        };
        if self.mode == ConvMode::Valid && (fx > height || fy > width) {
            return Err(Error::shape(format!(
                "Conv: {fx}x{fy} filter does not fit {height}x{width} input in valid mode"
            )));
        }

        let (pad_x, pad_y) = (self.mode.padding(fx), self.mode.padding(fy));
        let out_h = height + pad_x.0 + pad_x.1 + 1 - fx;
        let out_w = width + pad_y.0 + pad_y.1 + 1 - fy;

        self.input_shape = (channels, height, width);
        self.padding = (pad_x, pad_y);
        self.output_shape = vec![self.filters, out_h, out_w];
        self.weights = he_normal(&[self.filters, channels, fx, fy], channels * fx * fy, rng)?;
        self.bias = Array1::zeros(self.filters).into_dyn();
        self.weight_grads = Tensor::zeros(self.weights.raw_dim());
        self.bias_grads = Tensor::zeros(self.bias.raw_dim());
        Ok(self.output_shape.clone())
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let (channels, height, width) = self.input_shape;
        check_input(self.name(), input, &[channels, height, width])?;
        let input = to_rank4(self.name(), input)?;
        let batch = input.shape()[0];
        let (out_h, out_w) = self.output_hw();

        let cols = self.im2col(&input);
        let bias = self
            .bias
            .view()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|_| Error::not_connected(self.name()))?;
        // (rows × filters), rows ordered (b, i, j)
        let output = cols.dot(&self.filter_matrix()?.t()) + &bias;
        let output = output
            .into_shape_with_order((batch, out_h, out_w, self.filters))
            .map_err(|e| Error::shape(format!("Conv: {e}")))?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();

        self.cols = Some((batch, cols));
        Ok(output.into_dyn())
    }

    fn backward(&mut self, output_gradient: &Tensor) -> Result<Tensor> {
        let (batch, cols) = self.cols.take().ok_or_else(|| Error::no_forward(self.name()))?;
        check_input(self.name(), output_gradient, &self.output_shape)?;
        let (out_h, out_w) = self.output_hw();

        let grad = to_rank4(self.name(), output_gradient)?
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch * out_h * out_w, self.filters))
            .map_err(|e| Error::shape(format!("Conv: {e}")))?;

        let filters = self.filter_matrix()?;
        let (channels, _, _) = self.input_shape;
        let (fx, fy) = self.kernel_size;
        self.weight_grads = grad
            .t()
            .dot(&cols)
            .into_shape_with_order((self.filters, channels, fx, fy))
            .map_err(|e| Error::shape(format!("Conv: {e}")))?
            .into_dyn();
        self.bias_grads = grad.sum_axis(Axis(0)).into_dyn();

        let d_cols = grad.dot(&filters);
        Ok(self.col2im(&d_cols, batch).into_dyn())
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
        LayerSpec::Conv {
            filters: self.filters,
            filter_x: self.kernel_size.0,
            filter_y: self.kernel_size.1,
            mode: self.mode,
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
    use ndarray::Array;
    use rand::SeedableRng;

    fn connected(filters: usize, size: usize, mode: ConvMode, input: &[usize]) -> Conv2DLayer {
        let mut layer = Conv2DLayer::new(filters, size, size, mode);
        layer.connect(input, &mut StdRng::seed_from_u64(0)).unwrap();
        layer
    }

    #[test]
    fn output_shapes_per_mode() {
        assert_eq!(connected(4, 3, ConvMode::Valid, &[1, 8, 8]).output_shape(), &[4, 6, 6]);
        assert_eq!(connected(4, 3, ConvMode::Full, &[1, 8, 8]).output_shape(), &[4, 10, 10]);
        assert_eq!(connected(4, 3, ConvMode::Same, &[1, 8, 8]).output_shape(), &[4, 8, 8]);
        assert_eq!(connected(2, 2, ConvMode::Same, &[3, 5, 5]).output_shape(), &[2, 5, 5]);
    }

    #[test]
    fn valid_mode_rejects_oversized_filter() {
        let mut layer = Conv2DLayer::new(1, 5, 5, ConvMode::Valid);
        let err = layer.connect(&[1, 4, 4], &mut StdRng::seed_from_u64(0));
        assert!(matches!(err, Err(Error::Shape(_))));
    }

    #[test]
    fn forward_is_cross_correlation() {
        let mut layer = connected(1, 2, ConvMode::Valid, &[1, 3, 3]);
        layer.weights = Array::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        layer.bias = Array1::from(vec![0.5]).into_dyn();

        let input = Array::from_shape_vec((1, 1, 3, 3), (1..=9).map(f64::from).collect())
            .unwrap()
            .into_dyn();
        let output = layer.forward(&input).unwrap();
        // top-left: 1·1 + 2·2 + 3·4 + 4·5 + 0.5
        assert_relative_eq!(output[[0, 0, 0, 0]], 37.5);
        assert_relative_eq!(output[[0, 0, 0, 1]], 47.5);
        assert_relative_eq!(output[[0, 0, 1, 0]], 67.5);
        assert_relative_eq!(output[[0, 0, 1, 1]], 77.5);
    }

    #[test]
    fn same_mode_identity_kernel() {
        let mut layer = connected(1, 3, ConvMode::Same, &[1, 4, 4]);
        let mut kernel = Array4::zeros((1, 1, 3, 3));
        kernel[[0, 0, 1, 1]] = 1.0;
        layer.weights = kernel.into_dyn();

        let input = Array::from_shape_fn((2, 1, 4, 4), |(b, _, x, y)| (b * 16 + x * 4 + y) as f64).into_dyn();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output, input);

        let grad = input.mapv(|v| v * 2.0);
        let dx = layer.backward(&grad).unwrap();
        assert_eq!(dx, grad);
        assert_relative_eq!(layer.bias_grads[[0]], grad.sum());
    }

    #[test]
    fn mode_registry() {
        assert_eq!("same".parse::<ConvMode>().unwrap(), ConvMode::Same);
        assert_eq!(ConvMode::Full.to_string(), "full");
        assert!(matches!("circular".parse::<ConvMode>(), Err(Error::Configuration(_))));
    }
}
