//! Training configuration structures
//!
//! Hyperparameters load from a JSON file with three sections: model
//! architecture, training loop, and optimizer. CLI flags override individual
//! fields after loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use voltlm_model::{ConfigError, VoltConfig};

/// Complete training configuration loaded from file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfigFile {
    /// Model architecture
    pub model: ModelSection,
    /// Training loop hyperparameters
    pub training: TrainingSection,
    /// Optimizer and scheduler hyperparameters
    pub optimizer: OptimizerSection,
}

/// Model architecture section
///
/// The vocabulary size and special token ids are not part of the file; they
/// come from the tokenizer at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Maximum sequence length
    pub max_position_embeddings: usize,
    /// Embedding dimension
    pub hidden_size: usize,
    /// Attention head count
    pub num_attention_heads: usize,
    /// Transformer layer count
    pub num_hidden_layers: usize,
    /// Feed-forward inner dimension
    pub intermediate_size: usize,
    /// Dropout probability
    pub dropout: f32,
    /// Enable the domain embedding and classifier head
    pub use_domain_embeddings: bool,
    /// Number of content domains
    pub num_domains: usize,
}

impl ModelSection {
    /// Named size preset (`tiny`, `small` or `base`)
    pub fn preset(name: &str) -> Result<Self> {
        let config = match name {
            "tiny" => VoltConfig::tiny(),
            "small" => VoltConfig::small(),
            "base" => VoltConfig::base(),
            other => anyhow::bail!("unknown model size preset: {other}"),
        };
        Ok(Self::from_model_config(&config))
    }

    fn from_model_config(config: &VoltConfig) -> Self {
        Self {
            max_position_embeddings: config.max_position_embeddings,
            hidden_size: config.hidden_size,
            num_attention_heads: config.num_attention_heads,
            num_hidden_layers: config.num_hidden_layers,
            intermediate_size: config.intermediate_size,
            dropout: config.dropout,
            use_domain_embeddings: config.use_domain_embeddings,
            num_domains: config.num_domains,
        }
    }

    /// Combine this section with tokenizer-derived fields into a validated
    /// model configuration
    pub fn to_model_config(
        &self,
        vocab_size: usize,
        bos_token_id: u32,
        eos_token_id: u32,
        pad_token_id: u32,
        seed: Option<u64>,
    ) -> Result<VoltConfig, ConfigError> {
        let config = VoltConfig {
            vocab_size,
            max_position_embeddings: self.max_position_embeddings,
            hidden_size: self.hidden_size,
            num_attention_heads: self.num_attention_heads,
            num_hidden_layers: self.num_hidden_layers,
            intermediate_size: self.intermediate_size,
            dropout: self.dropout,
            bos_token_id,
            eos_token_id,
            pad_token_id,
            use_domain_embeddings: self.use_domain_embeddings,
            num_domains: self.num_domains,
            seed,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        Self::from_model_config(&VoltConfig::base())
    }
}

/// Training-loop section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    /// Micro-batch size
    pub batch_size: usize,
    /// Number of passes over the training set
    pub num_epochs: usize,
    /// Micro-batches per optimizer step
    pub accumulation_steps: usize,
    /// Global gradient-norm clip threshold
    pub max_grad_norm: f32,
    /// Optimizer steps between validation runs (0 = disabled)
    pub eval_steps: usize,
    /// Optimizer steps between step checkpoints (0 = disabled)
    pub save_steps: usize,
    /// Number of step checkpoints kept on disk
    pub save_total_limit: usize,
    /// Optimizer steps between metric log lines (0 = quiet)
    pub log_interval: usize,
    /// Enable the dynamic loss scaler
    pub mixed_precision: bool,
    /// Seed for shuffling, initialization and monitoring samples
    pub seed: u64,
    /// Prompt used for the monitoring sample printed at each evaluation
    pub monitor_prompt: String,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            batch_size: 16,
            num_epochs: 3,
            accumulation_steps: 1,
            max_grad_norm: 1.0,
            eval_steps: 250,
            save_steps: 500,
            save_total_limit: 3,
            log_interval: 50,
            mixed_precision: false,
            seed: 42,
            monitor_prompt: "Grid demand in the region".to_string(),
        }
    }
}

/// Optimizer and scheduler section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Weight decay
    pub weight_decay: f32,
    /// AdamW beta1
    pub beta1: f32,
    /// AdamW beta2
    pub beta2: f32,
    /// AdamW epsilon
    pub eps: f32,
    /// Linear warmup steps
    pub warmup_steps: usize,
    /// Floor of the cosine decay
    pub min_lr: f32,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            warmup_steps: 200,
            min_lr: 1e-5,
        }
    }
}

impl Default for TrainConfigFile {
    fn default() -> Self {
        Self {
            model: ModelSection::default(),
            training: TrainingSection::default(),
            optimizer: OptimizerSection::default(),
        }
    }
}

impl TrainConfigFile {
    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: TrainConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
