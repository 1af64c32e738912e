//! Runtime error taxonomy for the model crate

use thiserror::Error;

/// Errors raised by forward passes and generation
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("sequence length {len} exceeds max_position_embeddings {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("token id {id} is outside the vocabulary of size {vocab_size}")]
    TokenIdOutOfRange { id: u32, vocab_size: usize },
    #[error("domain id {id} is outside [0, {num_domains})")]
    DomainIdOutOfRange { id: u32, num_domains: usize },
    #[error("prompt must contain at least one token")]
    EmptyPrompt,
    #[error("temperature must be positive, got {0}")]
    InvalidTemperature(f32),
    #[error("top_p must be in (0, 1], got {0}")]
    InvalidTopP(f32),
}
