//! Position-wise feed-forward block

use crate::config::VoltConfig;
use crate::init::derive_seed;
use crate::norm::LayerNorm;
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Dropout, Linear, Module};

/// GELU activation (tanh approximation)
fn gelu(x: &Tensor) -> Tensor {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    let data: Vec<f32> = x
        .data()
        .iter()
        .map(|&v| 0.5 * v * (1.0 + (SQRT_2_OVER_PI * (v + 0.044715 * v * v * v)).tanh()))
        .collect();
    Tensor::new(&data, x.shape())
}

/// Feed-forward block: expansion, GELU, projection, dropout, post-norm
///
/// Same post-norm convention as the attention block: residual add with the
/// block input, then layer norm.
#[derive(Debug)]
pub struct FeedForward {
    /// Expansion layer: hidden -> intermediate
    c_fc: Linear,
    /// Projection layer: intermediate -> hidden
    c_proj: Linear,
    norm: LayerNorm,
    dropout: Option<Dropout>,
    training: bool,
}

impl FeedForward {
    /// Create a feed-forward block for layer `layer_idx`
    pub fn new(config: &VoltConfig, layer_idx: usize) -> Self {
        let dropout = (config.dropout > 0.0).then(|| {
            match derive_seed(config.seed, 7 + 16 * layer_idx as u64) {
                Some(s) => Dropout::with_seed(config.dropout, s),
                None => Dropout::new(config.dropout),
            }
        });

        Self {
            c_fc: Linear::new(config.hidden_size, config.intermediate_size),
            c_proj: Linear::new(config.intermediate_size, config.hidden_size),
            norm: LayerNorm::new(config.hidden_size),
            dropout,
            training: true,
        }
    }

    /// Toggle training mode (controls dropout)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if let Some(ref mut dropout) = self.dropout {
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
    ///
    /// # Returns
    /// Output hidden state with the same shape
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let expanded = self.c_fc.forward(x);
        let activated = gelu(&expanded);
        let projected = self.c_proj.forward(&activated);

        let projected = match (&self.dropout, self.training) {
            (Some(dropout), true) => dropout.forward(&projected),
            _ => projected,
        };

        let residual = projected.add(x);
        Ok(self.norm.forward(&residual))
    }
}

impl Module for FeedForward {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward(input).expect("feed-forward pass failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters());
        params.extend(self.c_proj.parameters());
        params.extend(self.norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters_mut());
        params.extend(self.c_proj.parameters_mut());
        params.extend(self.norm.parameters_mut());
        params
    }
}
