//! Causal multi-head self-attention

use crate::config::VoltConfig;
use crate::init::derive_seed;
use crate::norm::LayerNorm;
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Dropout, Linear, Module};

/// Additive bias applied to scores at padded key positions
///
/// Large enough to zero the position out after softmax while keeping the
/// row finite even when every key in it is padded.
pub(crate) const PADDING_MASK_BIAS: f32 = -1e9;

// Helper functions replicating tensor operations aprender does not expose
// for the 4D attention layout.

/// Reshape [batch, seq, embed] -> [batch, heads, seq, head_dim]
fn split_heads(x: &Tensor, batch: usize, seq_len: usize, num_heads: usize, head_dim: usize) -> Tensor {
    let mut output = vec![0.0; batch * num_heads * seq_len * head_dim];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..num_heads {
                for d in 0..head_dim {
                    let in_idx = b * seq_len * (num_heads * head_dim)
                        + s * (num_heads * head_dim)
                        + h * head_dim
                        + d;
                    let out_idx = b * num_heads * seq_len * head_dim
                        + h * seq_len * head_dim
                        + s * head_dim
                        + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, num_heads, seq_len, head_dim])
}

/// Reshape [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
fn merge_heads(x: &Tensor, batch: usize, seq_len: usize, num_heads: usize, head_dim: usize) -> Tensor {
    let embed_dim = num_heads * head_dim;
    let mut output = vec![0.0; batch * seq_len * embed_dim];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..num_heads {
                for d in 0..head_dim {
                    let in_idx = b * num_heads * seq_len * head_dim
                        + h * seq_len * head_dim
                        + s * head_dim
                        + d;
                    let out_idx = b * seq_len * embed_dim + s * embed_dim + h * head_dim + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, seq_len, embed_dim])
}

/// Transpose the last two dimensions
fn transpose_last_two(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let ndim = shape.len();

    let last = shape[ndim - 1];
    let second_last = shape[ndim - 2];

    let mut new_shape = shape.to_vec();
    new_shape[ndim - 2] = last;
    new_shape[ndim - 1] = second_last;

    let batch_size: usize = shape[..ndim - 2].iter().product();
    let matrix_size = last * second_last;

    let mut output = vec![0.0; x.data().len()];
    let x_data = x.data();

    for b in 0..batch_size {
        let offset = b * matrix_size;
        for i in 0..second_last {
            for j in 0..last {
                output[offset + j * second_last + i] = x_data[offset + i * last + j];
            }
        }
    }

    Tensor::new(&output, &new_shape)
}

/// Batched matrix multiplication for 4D tensors [batch, heads, m, k] @ [batch, heads, k, n]
fn matmul_batched_4d(a: &Tensor, b: &Tensor) -> Tensor {
    let a_shape = a.shape();
    let b_shape = b.shape();

    let (batch, heads, m, k) = (a_shape[0], a_shape[1], a_shape[2], a_shape[3]);
    let n = b_shape[3];

    let mut output = vec![0.0; batch * heads * m * n];
    let a_data = a.data();
    let b_data = b.data();

    for b_idx in 0..batch {
        for h in 0..heads {
            let a_off = b_idx * heads * m * k + h * m * k;
            let b_off = b_idx * heads * k * n + h * k * n;
            let out_off = b_idx * heads * m * n + h * m * n;
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for k_idx in 0..k {
                        sum += a_data[a_off + i * k + k_idx] * b_data[b_off + k_idx * n + j];
                    }
                    output[out_off + i * n + j] = sum;
                }
            }
        }
    }

    Tensor::new(&output, &[batch, heads, m, n])
}

/// Scale a tensor by a scalar
fn scale_tensor(x: &Tensor, scale: f32) -> Tensor {
    let data: Vec<f32> = x.data().iter().map(|&v| v * scale).collect();
    Tensor::new(&data, x.shape())
}

/// Softmax over the last dimension
pub(crate) fn softmax_last_dim(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let last_dim = shape[shape.len() - 1];
    let batch_size: usize = shape[..shape.len() - 1].iter().product();

    let mut output = vec![0.0; x.data().len()];
    let x_data = x.data();

    for b in 0..batch_size {
        let offset = b * last_dim;
        let slice = &x_data[offset..offset + last_dim];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_vals: Vec<f32> = slice.iter().map(|&v| (v - max_val).exp()).collect();
        let sum: f32 = exp_vals.iter().sum();

        for i in 0..last_dim {
            output[offset + i] = if sum > 0.0 { exp_vals[i] / sum } else { 0.0 };
        }
    }

    Tensor::new(&output, shape)
}

/// Add the causal and padding biases to raw attention scores
///
/// The causal term is applied unconditionally: position i may only attend to
/// positions j <= i. The padding term adds [`PADDING_MASK_BIAS`] to every
/// score whose key position has `attention_mask == 0`.
fn apply_attention_biases(scores: &Tensor, attention_mask: Option<&Tensor>) -> Tensor {
    let shape = scores.shape();
    let (batch, heads, q_len, k_len) = (shape[0], shape[1], shape[2], shape[3]);

    let mut data = scores.data().to_vec();
    let mask_data = attention_mask.map(|m| m.data());

    for b in 0..batch {
        for h in 0..heads {
            let off = b * heads * q_len * k_len + h * q_len * k_len;
            for q in 0..q_len {
                for k in 0..k_len {
                    let idx = off + q * k_len + k;
                    if k > q {
                        data[idx] = f32::NEG_INFINITY;
                    } else if let Some(mask) = mask_data {
                        if mask[b * k_len + k] == 0.0 {
                            data[idx] += PADDING_MASK_BIAS;
                        }
                    }
                }
            }
        }
    }

    Tensor::new(&data, shape)
}

/// Multi-head self-attention with an unconditional causal mask
///
/// Post-norm block: the residual sum of the block input and the projected
/// attention output is layer-normalized on the way out. This ordering is
/// part of the checkpoint contract and must not be switched to pre-norm.
#[derive(Debug)]
pub struct CausalSelfAttention {
    /// Query projection: hidden -> hidden
    q_proj: Linear,
    /// Key projection: hidden -> hidden
    k_proj: Linear,
    /// Value projection: hidden -> hidden
    v_proj: Linear,
    /// Output projection: hidden -> hidden
    out_proj: Linear,
    norm: LayerNorm,
    attn_dropout: Option<Dropout>,
    resid_dropout: Option<Dropout>,
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,
    training: bool,
}

impl CausalSelfAttention {
    /// Create an attention block for layer `layer_idx`
    pub fn new(config: &VoltConfig, layer_idx: usize) -> Self {
        let make_dropout = |salt: u64| {
            (config.dropout > 0.0).then(|| {
                match derive_seed(config.seed, salt + 16 * layer_idx as u64) {
                    Some(s) => Dropout::with_seed(config.dropout, s),
                    None => Dropout::new(config.dropout),
                }
            })
        };

        Self {
            q_proj: Linear::new(config.hidden_size, config.hidden_size),
            k_proj: Linear::new(config.hidden_size, config.hidden_size),
            v_proj: Linear::new(config.hidden_size, config.hidden_size),
            out_proj: Linear::new(config.hidden_size, config.hidden_size),
            norm: LayerNorm::new(config.hidden_size),
            attn_dropout: make_dropout(5),
            resid_dropout: make_dropout(6),
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            hidden_size: config.hidden_size,
            training: true,
        }
    }

    /// Toggle training mode (controls both dropout sites)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for dropout in [self.attn_dropout.as_mut(), self.resid_dropout.as_mut()]
            .into_iter()
            .flatten()
        {
            if training {
                dropout.train();
            } else {
                dropout.eval();
            }
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input hidden state [batch, seq_len, hidden]
    /// * `attention_mask` - Optional 0/1 padding mask [batch, seq_len]
    ///
    /// # Returns
    /// Output hidden state [batch, seq_len, hidden]
    pub fn forward(&self, x: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let shape = x.shape();
        if shape.len() != 3 {
            anyhow::bail!("expected 3D input [batch, seq_len, hidden], got shape {:?}", shape);
        }
        let (batch_size, seq_len) = (shape[0], shape[1]);

        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);

        let q = split_heads(&q, batch_size, seq_len, self.num_heads, self.head_dim);
        let k = split_heads(&k, batch_size, seq_len, self.num_heads, self.head_dim);
        let v = split_heads(&v, batch_size, seq_len, self.num_heads, self.head_dim);

        // Scores: Q @ K^T / sqrt(head_dim)
        let k_t = transpose_last_two(&k);
        let scores = matmul_batched_4d(&q, &k_t);
        let scores = scale_tensor(&scores, 1.0 / (self.head_dim as f32).sqrt());

        let scores = apply_attention_biases(&scores, attention_mask);
        let weights = softmax_last_dim(&scores);

        let weights = match (&self.attn_dropout, self.training) {
            (Some(dropout), true) => dropout.forward(&weights),
            _ => weights,
        };

        let context = matmul_batched_4d(&weights, &v);
        let context = merge_heads(&context, batch_size, seq_len, self.num_heads, self.head_dim);

        let projected = self.out_proj.forward(&context);
        let projected = match (&self.resid_dropout, self.training) {
            (Some(dropout), true) => dropout.forward(&projected),
            _ => projected,
        };

        // Post-norm: residual add, then layer norm.
        let residual = projected.add(x);
        Ok(self.norm.forward(&residual))
    }

    /// Number of attention heads
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Dimension of a single head
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

impl Module for CausalSelfAttention {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward(input, None).expect("attention forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters());
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params.extend(self.norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters_mut());
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params.extend(self.norm.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VoltConfig {
        VoltConfig {
            vocab_size: 32,
            max_position_embeddings: 16,
            hidden_size: 16,
            num_attention_heads: 4,
            num_hidden_layers: 1,
            intermediate_size: 32,
            dropout: 0.0,
            seed: Some(7),
            ..VoltConfig::default()
        }
    }

    #[test]
    fn test_attention_output_shape() {
        let attn = CausalSelfAttention::new(&test_config(), 0);
        let x = Tensor::ones(&[2, 5, 16]);
        let y = attn.forward(&x, None).unwrap();
        assert_eq!(y.shape(), &[2, 5, 16]);
    }

    #[test]
    fn test_causal_bias_is_unconditional() {
        // Scores above the diagonal become -inf even without a padding mask.
        let scores = Tensor::ones(&[1, 1, 3, 3]);
        let biased = apply_attention_biases(&scores, None);
        let data = biased.data();
        assert_eq!(data[0 * 3 + 1], f32::NEG_INFINITY);
        assert_eq!(data[0 * 3 + 2], f32::NEG_INFINITY);
        assert_eq!(data[1 * 3 + 2], f32::NEG_INFINITY);
        assert_eq!(data[1 * 3 + 0], 1.0);
        assert_eq!(data[2 * 3 + 2], 1.0);
    }

    #[test]
    fn test_padding_bias_applied_to_masked_keys() {
        let scores = Tensor::zeros(&[1, 1, 2, 2]);
        let mask = Tensor::new(&[1.0, 0.0], &[1, 2]);
        let biased = apply_attention_biases(&scores, Some(&mask));
        let data = biased.data();
        // Row 1 may attend to key 0 (kept) and key 1 (padded).
        assert_eq!(data[1 * 2 + 0], 0.0);
        assert_eq!(data[1 * 2 + 1], PADDING_MASK_BIAS);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 0.5, 0.5, 0.5], &[2, 3]);
        let y = softmax_last_dim(&x);
        for row in y.data().chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_attention_weights_respect_causality() {
        // With the causal bias in place the first position attends only to
        // itself, so its output is independent of later positions.
        let attn = CausalSelfAttention::new(&test_config(), 0);

        let a = vec![0.1; 2 * 16];
        let b = {
            let mut b = a.clone();
            for v in &mut b[16..] {
                *v = 5.0;
            }
            b
        };
        let xa = Tensor::new(&a, &[1, 2, 16]);
        let xb = Tensor::new(&b, &[1, 2, 16]);

        let ya = attn.forward(&xa, None).unwrap();
        let yb = attn.forward(&xb, None).unwrap();

        for i in 0..16 {
            assert!(
                (ya.data()[i] - yb.data()[i]).abs() < 1e-5,
                "position 0 changed when position 1 was perturbed"
            );
        }
    }

    #[test]
    fn test_split_merge_roundtrip() {
        let x = Tensor::new(&(0..24).map(|v| v as f32).collect::<Vec<_>>(), &[1, 3, 8]);
        let split = split_heads(&x, 1, 3, 2, 4);
        let merged = merge_heads(&split, 1, 3, 2, 4);
        assert_eq!(merged.data(), x.data());
    }

    #[test]
    fn test_matmul_batched_4d_identity() {
        let a = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let eye = Tensor::new(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let out = matmul_batched_4d(&a, &eye);
        assert_eq!(out.data(), a.data());
    }
}
