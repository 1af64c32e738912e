//! Checkpoint save/load
//!
//! A checkpoint is a directory holding the model weights in SafeTensors
//! format next to a JSON manifest with the full configuration. Loading never
//! mutates an existing model: it always constructs a fresh instance that
//! owns its deserialized parameters.

use crate::config::VoltConfig;
use crate::model::VoltLM;
use anyhow::{Context, Result};
use aprender::nn::serialize::{load_model, save_model};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Weights file name inside a checkpoint directory
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Manifest file name inside a checkpoint directory
pub const CONFIG_FILE: &str = "config.json";

/// Checkpoint format version
const CHECKPOINT_VERSION: u32 = 1;

/// Errors raised while loading a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint file not found: {0}")]
    MissingFile(PathBuf),
    #[error("checkpoint format version {found} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("checkpoint vocab_size {checkpoint} does not match tokenizer vocab_size {tokenizer}")]
    VocabSizeMismatch { checkpoint: usize, tokenizer: usize },
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),
}

/// Self-describing checkpoint manifest
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointManifest {
    version: u32,
    config: VoltConfig,
}

/// Save model weights and configuration to `dir`
///
/// Creates the directory if needed. Any I/O or serialization failure is
/// fatal; no partial cleanup is attempted.
pub fn save_checkpoint(model: &VoltLM, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create checkpoint directory: {}", dir.display()))?;

    let weights_path = dir.join(WEIGHTS_FILE);
    save_model(model, &weights_path)
        .map_err(|e| anyhow::anyhow!("failed to save weights to {}: {}", weights_path.display(), e))?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        config: model.config().clone(),
    };
    let json = serde_json::to_string_pretty(&manifest).context("failed to serialize manifest")?;
    let manifest_path = dir.join(CONFIG_FILE);
    fs::write(&manifest_path, json)
        .with_context(|| format!("failed to write manifest: {}", manifest_path.display()))?;

    Ok(())
}

/// Load a model from a checkpoint directory
///
/// # Arguments
/// * `dir` - Checkpoint directory created by [`save_checkpoint`]
/// * `tokenizer_vocab_size` - When provided, the stored vocabulary size must
///   match it exactly
///
/// # Returns
/// A new model instance in eval mode that exclusively owns its parameters.
///
/// # Errors
/// [`CheckpointError::MissingFile`] for absent files,
/// [`CheckpointError::VersionMismatch`] for format skew,
/// [`CheckpointError::VocabSizeMismatch`] when the stored vocabulary does
/// not match the tokenizer in use, [`CheckpointError::Corrupt`] for
/// undecodable content.
pub fn load_checkpoint(dir: &Path, tokenizer_vocab_size: Option<usize>) -> Result<VoltLM> {
    let manifest_path = dir.join(CONFIG_FILE);
    if !manifest_path.exists() {
        return Err(CheckpointError::MissingFile(manifest_path).into());
    }

    let json = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read manifest: {}", manifest_path.display()))?;
    let manifest: CheckpointManifest = serde_json::from_str(&json)
        .map_err(|e| CheckpointError::Corrupt(format!("manifest: {e}")))?;

    if manifest.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            expected: CHECKPOINT_VERSION,
            found: manifest.version,
        }
        .into());
    }

    if let Some(vocab) = tokenizer_vocab_size {
        if manifest.config.vocab_size != vocab {
            return Err(CheckpointError::VocabSizeMismatch {
                checkpoint: manifest.config.vocab_size,
                tokenizer: vocab,
            }
            .into());
        }
    }

    let weights_path = dir.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(CheckpointError::MissingFile(weights_path).into());
    }

    let mut model = VoltLM::new(manifest.config)
        .map_err(|e| CheckpointError::Corrupt(format!("stored config invalid: {e}")))?;
    load_model(&mut model, &weights_path)
        .map_err(|e| CheckpointError::Corrupt(format!("weights: {e}")))?;

    model.set_training(false);
    Ok(model)
}
