//! Model assembly: transformer stack, LM head, domain head, loss

use crate::attention::{softmax_last_dim, CausalSelfAttention};
use crate::config::{ConfigError, VoltConfig};
use crate::embeddings::VoltEmbeddings;
use crate::feedforward::FeedForward;
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use aprender::nn::{Linear, Module};

/// Label value excluded from the language-modeling loss
pub const IGNORE_INDEX: i64 = -100;

/// Fixed weight of the auxiliary domain-classification loss
pub const DOMAIN_LOSS_WEIGHT: f32 = 0.1;

/// One transformer layer: causal self-attention followed by feed-forward
///
/// Both sub-blocks are post-norm; there are no skip connections spanning
/// more than one layer.
#[derive(Debug)]
pub struct Block {
    attn: CausalSelfAttention,
    ffn: FeedForward,
}

impl Block {
    /// Create the block for layer `layer_idx`
    pub fn new(config: &VoltConfig, layer_idx: usize) -> Self {
        Self {
            attn: CausalSelfAttention::new(config, layer_idx),
            ffn: FeedForward::new(config, layer_idx),
        }
    }

    /// Forward pass through attention and feed-forward
    pub fn forward(&self, x: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let x = self.attn.forward(x, attention_mask)?;
        self.ffn.forward(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.attn.set_training(training);
        self.ffn.set_training(training);
    }
}

/// Forward-pass output
#[derive(Debug)]
pub struct ModelOutput {
    /// Next-token logits, shape [batch, seq_len, vocab_size]
    pub logits: Tensor,
    /// Domain-classifier logits, shape [batch, num_domains], when the
    /// domain head is enabled
    pub domain_logits: Option<Tensor>,
}

/// Training-pass output
pub struct TrainingOutput {
    /// Total loss as a scalar tensor (lm + weighted domain loss)
    pub loss: Tensor,
    /// Language-modeling cross-entropy
    pub lm_loss: f32,
    /// Domain cross-entropy, when domain ids were supplied
    pub domain_loss: Option<f32>,
    /// Number of label positions that contributed to the LM loss
    pub target_tokens: usize,
}

/// Causal transformer language model for energy-sector text
///
/// Embeddings -> N post-norm (attention, feed-forward) blocks -> untied
/// linear LM head, plus an optional domain classifier over the mean-pooled
/// final hidden state.
#[derive(Debug)]
pub struct VoltLM {
    config: VoltConfig,
    embeddings: VoltEmbeddings,
    blocks: Vec<Block>,
    /// LM head, untied from the token embedding table
    lm_head: Linear,
    domain_head: Option<Linear>,
    training: bool,
}

impl VoltLM {
    /// Build a model from a configuration
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the configuration is invalid; validation
    /// happens before any weight is allocated.
    pub fn new(config: VoltConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let embeddings = VoltEmbeddings::new(&config);
        let blocks = (0..config.num_hidden_layers)
            .map(|i| Block::new(&config, i))
            .collect();
        let lm_head = Linear::new(config.hidden_size, config.vocab_size);
        let domain_head = config
            .use_domain_embeddings
            .then(|| Linear::new(config.hidden_size, config.num_domains));

        Ok(Self {
            config,
            embeddings,
            blocks,
            lm_head,
            domain_head,
            training: true,
        })
    }

    /// The model configuration
    pub fn config(&self) -> &VoltConfig {
        &self.config
    }

    /// Toggle training mode across every dropout site
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.embeddings.set_training(training);
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }

    /// Whether the model is in training mode
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Forward pass producing logits
    ///
    /// # Arguments
    /// * `input_ids` - Token ids [batch, seq_len]
    /// * `attention_mask` - Optional 0/1 padding mask [batch, seq_len]
    /// * `domain_ids` - Optional per-example domain ids [batch]
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        domain_ids: Option<&Tensor>,
    ) -> Result<ModelOutput> {
        let mut hidden = self
            .embeddings
            .forward(input_ids, domain_ids)
            .context("embedding forward failed")?;

        for block in &self.blocks {
            hidden = block.forward(&hidden, attention_mask)?;
        }

        let logits = self.lm_head.forward(&hidden);
        let domain_logits = self
            .domain_head
            .as_ref()
            .map(|head| head.forward(&mean_pool(&hidden, attention_mask)));

        Ok(ModelOutput {
            logits,
            domain_logits,
        })
    }

    /// Forward pass with loss computation
    ///
    /// The LM loss is the causal cross-entropy between logits shifted left by
    /// one position and labels shifted left by one position; label index 0 is
    /// never a target. Positions whose label equals [`IGNORE_INDEX`] or whose
    /// `attention_mask` entry is 0 are excluded. When `domain_ids` are
    /// supplied and the domain head is enabled, the total loss adds the
    /// domain cross-entropy at [`DOMAIN_LOSS_WEIGHT`].
    ///
    /// # Arguments
    /// * `input_ids` - Token ids [batch, seq_len]
    /// * `attention_mask` - Optional 0/1 padding mask [batch, seq_len]
    /// * `labels` - Target ids [batch, seq_len]; [`IGNORE_INDEX`] masks a position
    /// * `domain_ids` - Optional per-example domain ids [batch]
    pub fn forward_training(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: &Tensor,
        domain_ids: Option<&Tensor>,
    ) -> Result<TrainingOutput> {
        if labels.shape() != input_ids.shape() {
            anyhow::bail!(
                "labels shape {:?} does not match input_ids shape {:?}",
                labels.shape(),
                input_ids.shape()
            );
        }

        let output = self.forward(input_ids, attention_mask, domain_ids)?;
        let (lm_loss, target_tokens) = causal_lm_loss(&output.logits, labels, attention_mask);

        let domain_loss = match (&output.domain_logits, domain_ids) {
            (Some(domain_logits), Some(ids)) => {
                Some(classification_loss(domain_logits, ids))
            }
            _ => None,
        };

        let total = lm_loss + DOMAIN_LOSS_WEIGHT * domain_loss.unwrap_or(0.0);

        Ok(TrainingOutput {
            loss: Tensor::new(&[total], &[1]),
            lm_loss,
            domain_loss,
            target_tokens,
        })
    }
}

/// Mask-aware mean pooling over the sequence dimension
///
/// Padded positions (mask 0) are excluded from the mean. Without a mask the
/// plain mean over all positions is used.
fn mean_pool(hidden: &Tensor, attention_mask: Option<&Tensor>) -> Tensor {
    let shape = hidden.shape();
    let (batch, seq_len, dim) = (shape[0], shape[1], shape[2]);
    let data = hidden.data();
    let mask = attention_mask.map(|m| m.data());

    let mut pooled = vec![0.0; batch * dim];
    for b in 0..batch {
        let mut count: f32 = 0.0;
        for t in 0..seq_len {
            let keep = mask.map_or(true, |m| m[b * seq_len + t] != 0.0);
            if !keep {
                continue;
            }
            count += 1.0;
            let row = &data[(b * seq_len + t) * dim..(b * seq_len + t + 1) * dim];
            for (p, &v) in pooled[b * dim..(b + 1) * dim].iter_mut().zip(row.iter()) {
                *p += v;
            }
        }
        let denom = count.max(1.0);
        for p in &mut pooled[b * dim..(b + 1) * dim] {
            *p /= denom;
        }
    }

    Tensor::new(&pooled, &[batch, dim])
}

/// Shifted causal cross-entropy
///
/// Returns the mean negative log-likelihood over contributing positions and
/// the number of such positions.
fn causal_lm_loss(
    logits: &Tensor,
    labels: &Tensor,
    attention_mask: Option<&Tensor>,
) -> (f32, usize) {
    let shape = logits.shape();
    let (batch, seq_len, vocab) = (shape[0], shape[1], shape[2]);
    let logits_data = logits.data();
    let labels_data = labels.data();
    let mask = attention_mask.map(|m| m.data());

    let mut total = 0.0;
    let mut count = 0usize;

    for b in 0..batch {
        for t in 0..seq_len.saturating_sub(1) {
            // Predict position t+1 from position t.
            let target = labels_data[b * seq_len + t + 1] as i64;
            if target == IGNORE_INDEX {
                continue;
            }
            if let Some(m) = mask {
                if m[b * seq_len + t + 1] == 0.0 {
                    continue;
                }
            }
            let target = target as usize;
            debug_assert!(target < vocab);

            let row = &logits_data[(b * seq_len + t) * vocab..(b * seq_len + t + 1) * vocab];
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &v| a.max(v));
            let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
            total += -(row[target] - max - log_sum);
            count += 1;
        }
    }

    if count == 0 {
        (0.0, 0)
    } else {
        (total / count as f32, count)
    }
}

/// Mean cross-entropy for the domain classifier
fn classification_loss(logits: &Tensor, targets: &Tensor) -> f32 {
    let shape = logits.shape();
    let (batch, classes) = (shape[0], shape[1]);
    let probs = softmax_last_dim(logits);
    let probs_data = probs.data();
    let targets_data = targets.data();

    let mut total = 0.0;
    for b in 0..batch {
        let target = targets_data[b] as usize;
        debug_assert!(target < classes);
        total += -(probs_data[b * classes + target].max(1e-12)).ln();
    }
    total / batch as f32
}

impl Module for VoltLM {
    fn forward(&self, input: &Tensor) -> Tensor {
        VoltLM::forward(self, input, None, None)
            .expect("model forward failed")
            .logits
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.embeddings.parameters();
        for block in &self.blocks {
            params.extend(block.attn.parameters());
            params.extend(block.ffn.parameters());
        }
        params.extend(self.lm_head.parameters());
        if let Some(ref head) = self.domain_head {
            params.extend(head.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.embeddings.parameters_mut();
        for block in &mut self.blocks {
            params.extend(block.attn.parameters_mut());
            params.extend(block.ffn.parameters_mut());
        }
        params.extend(self.lm_head.parameters_mut());
        if let Some(ref mut head) = self.domain_head {
            params.extend(head.parameters_mut());
        }
        params
    }
}
