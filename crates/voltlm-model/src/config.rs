//! Model configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by configuration validation
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("hidden_size {hidden_size} is not divisible by num_attention_heads {num_attention_heads}")]
    HiddenSizeNotDivisible {
        hidden_size: usize,
        num_attention_heads: usize,
    },
    #[error("dropout must be in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("{0} must be greater than zero")]
    ZeroDimension(&'static str),
    #[error("num_domains must be greater than zero when domain embeddings are enabled")]
    ZeroDomains,
    #[error("config vocab_size {config} does not match tokenizer vocab_size {tokenizer}")]
    VocabSizeMismatch { config: usize, tokenizer: usize },
}

/// Transformer model configuration
///
/// Constructed once through [`VoltConfig::new`] or a size preset, validated
/// eagerly, and passed by reference into the model and trainer. The fields
/// are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltConfig {
    /// Vocabulary size (must match the tokenizer in use)
    pub vocab_size: usize,
    /// Maximum sequence length the position table supports
    pub max_position_embeddings: usize,
    /// Embedding / hidden dimension
    pub hidden_size: usize,
    /// Number of attention heads
    pub num_attention_heads: usize,
    /// Number of transformer layers
    pub num_hidden_layers: usize,
    /// Feed-forward inner dimension
    pub intermediate_size: usize,
    /// Dropout probability applied to embeddings, attention and MLP outputs
    pub dropout: f32,
    /// Beginning-of-sequence token id
    pub bos_token_id: u32,
    /// End-of-sequence token id
    pub eos_token_id: u32,
    /// Padding token id
    pub pad_token_id: u32,
    /// Whether to add a per-example domain embedding and classifier head
    pub use_domain_embeddings: bool,
    /// Number of content domains (only meaningful when domain embeddings are enabled)
    pub num_domains: usize,
    /// Random seed for weight initialization and dropout (None = non-deterministic)
    pub seed: Option<u64>,
}

impl Default for VoltConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8192,
            max_position_embeddings: 512,
            hidden_size: 256,
            num_attention_heads: 8,
            num_hidden_layers: 6,
            intermediate_size: 1024,
            dropout: 0.1,
            bos_token_id: 0,
            eos_token_id: 1,
            pad_token_id: 2,
            use_domain_embeddings: false,
            num_domains: 8,
            seed: None,
        }
    }
}

impl VoltConfig {
    /// Create a validated configuration
    ///
    /// # Arguments
    /// * `vocab_size` - Vocabulary size, must match the tokenizer
    /// * `max_position_embeddings` - Maximum supported sequence length
    /// * `hidden_size` - Embedding dimension
    /// * `num_attention_heads` - Attention head count
    /// * `num_hidden_layers` - Transformer layer count
    ///
    /// The remaining fields take their [`Default`] values and can be set
    /// with struct-update syntax before calling [`VoltConfig::validate`].
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when any invariant is violated.
    pub fn new(
        vocab_size: usize,
        max_position_embeddings: usize,
        hidden_size: usize,
        num_attention_heads: usize,
        num_hidden_layers: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            vocab_size,
            max_position_embeddings,
            hidden_size,
            num_attention_heads,
            num_hidden_layers,
            intermediate_size: hidden_size * 4,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Smallest preset, intended for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            vocab_size: 8192,
            max_position_embeddings: 128,
            hidden_size: 64,
            num_attention_heads: 4,
            num_hidden_layers: 2,
            intermediate_size: 256,
            ..Self::default()
        }
    }

    /// Small preset for single-machine experiments
    pub fn small() -> Self {
        Self {
            vocab_size: 8192,
            max_position_embeddings: 256,
            hidden_size: 128,
            num_attention_heads: 4,
            num_hidden_layers: 4,
            intermediate_size: 512,
            ..Self::default()
        }
    }

    /// Base preset, the default production shape
    pub fn base() -> Self {
        Self::default()
    }

    /// Validate all configuration invariants
    ///
    /// # Errors
    /// Returns the first violated invariant as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vocab_size == 0 {
            return Err(ConfigError::ZeroDimension("vocab_size"));
        }
        if self.max_position_embeddings == 0 {
            return Err(ConfigError::ZeroDimension("max_position_embeddings"));
        }
        if self.hidden_size == 0 {
            return Err(ConfigError::ZeroDimension("hidden_size"));
        }
        if self.num_attention_heads == 0 {
            return Err(ConfigError::ZeroDimension("num_attention_heads"));
        }
        if self.num_hidden_layers == 0 {
            return Err(ConfigError::ZeroDimension("num_hidden_layers"));
        }
        if self.intermediate_size == 0 {
            return Err(ConfigError::ZeroDimension("intermediate_size"));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConfigError::HiddenSizeNotDivisible {
                hidden_size: self.hidden_size,
                num_attention_heads: self.num_attention_heads,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidDropout(self.dropout));
        }
        if self.use_domain_embeddings && self.num_domains == 0 {
            return Err(ConfigError::ZeroDomains);
        }
        Ok(())
    }

    /// Dimension of a single attention head
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Check that the configured vocabulary matches the tokenizer in use
    ///
    /// # Errors
    /// Returns [`ConfigError::VocabSizeMismatch`] on disagreement.
    pub fn validate_vocab_size(&self, tokenizer_vocab_size: usize) -> Result<(), ConfigError> {
        if self.vocab_size != tokenizer_vocab_size {
            return Err(ConfigError::VocabSizeMismatch {
                config: self.vocab_size,
                tokenizer: tokenizer_vocab_size,
            });
        }
        Ok(())
    }
}
