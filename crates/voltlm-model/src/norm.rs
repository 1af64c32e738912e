//! Layer normalization

use aprender::autograd::Tensor;
use aprender::nn::Module;

/// Epsilon added to the variance for numerical stability
const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization over the last dimension with learnable gain and bias
///
/// Normalizes each vector along the trailing dimension to zero mean and unit
/// variance, then applies the learned elementwise affine transform. Used in
/// the post-norm position of every attention and feed-forward block.
#[derive(Debug)]
pub struct LayerNorm {
    /// Learnable gain, shape [dim]
    weight: Tensor,
    /// Learnable bias, shape [dim]
    bias: Tensor,
    dim: usize,
}

impl LayerNorm {
    /// Create a layer norm over vectors of length `dim` (gain 1, bias 0)
    pub fn new(dim: usize) -> Self {
        Self {
            weight: Tensor::ones(&[dim]),
            bias: Tensor::zeros(&[dim]),
            dim,
        }
    }

    /// Normalize over the last dimension
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [..., dim]
    ///
    /// # Returns
    /// Tensor with the same shape as the input
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let shape = x.shape();
        let last = shape[shape.len() - 1];
        debug_assert_eq!(last, self.dim);

        let rows: usize = shape[..shape.len() - 1].iter().product();
        let x_data = x.data();
        let gamma = self.weight.data();
        let beta = self.bias.data();

        let mut output = vec![0.0; x_data.len()];
        for r in 0..rows {
            let offset = r * last;
            let row = &x_data[offset..offset + last];

            let mean: f32 = row.iter().sum::<f32>() / last as f32;
            let var: f32 = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / last as f32;
            let inv_std = 1.0 / (var + LAYER_NORM_EPS).sqrt();

            for i in 0..last {
                output[offset + i] = (row[i] - mean) * inv_std * gamma[i] + beta[i];
            }
        }

        Tensor::new(&output, shape)
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Tensor {
        LayerNorm::forward(self, input)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}
