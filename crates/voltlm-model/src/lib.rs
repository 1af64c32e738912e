//! Core causal transformer language model for voltlm
//!
//! This crate provides the model half of the training/generation core:
//! - Token, position and optional domain embeddings
//! - Multi-head causal self-attention (post-norm)
//! - GELU feed-forward blocks (post-norm)
//! - Untied LM head and optional domain classifier
//! - Autoregressive generation with greedy, top-k and nucleus sampling
//! - Checkpoint save/load as a self-describing directory artifact
//!
//! # Example
//!
//! ```no_run
//! use voltlm_model::{GenerationConfig, VoltConfig, VoltLM};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let config = VoltConfig {
//!     seed: Some(42),
//!     ..VoltConfig::tiny()
//! };
//! let mut model = VoltLM::new(config)?;
//! model.set_training(false);
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let prompt = [0u32, 15, 42];
//! let generated = voltlm_model::generate(&model, &prompt, &GenerationConfig::default(), &mut rng)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod feedforward;
mod init;
pub mod generate;
pub mod model;
pub mod norm;
pub mod stability;

/// Model configuration and its validation errors
pub use config::{ConfigError, VoltConfig};

/// The model and its forward/training outputs
pub use model::{ModelOutput, TrainingOutput, VoltLM, DOMAIN_LOSS_WEIGHT, IGNORE_INDEX};

/// Runtime errors raised by forward passes and generation
pub use error::ModelError;

/// Autoregressive decoding
pub use generate::{generate, GenerationConfig};

/// Checkpoint persistence
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointError};

/// Result type alias for error handling
pub use anyhow::Result;
