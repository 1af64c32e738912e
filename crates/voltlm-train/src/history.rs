//! Append-only training history

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One history record
///
/// Step records carry the train loss; evaluation records additionally carry
/// the validation loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Optimizer step the record was taken at
    pub step: usize,
    /// Epoch the record was taken in
    pub epoch: usize,
    /// Training loss (averaged over the accumulation window)
    pub loss: f32,
    /// Learning rate after the step
    pub learning_rate: f32,
    /// Validation loss, present on evaluation records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f32>,
}

/// Ordered log of training progress
///
/// Records are only ever appended; existing entries are never rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    records: Vec<HistoryRecord>,
}

impl TrainingHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step record
    pub fn record_step(&mut self, step: usize, epoch: usize, loss: f32, learning_rate: f32) {
        self.records.push(HistoryRecord {
            step,
            epoch,
            loss,
            learning_rate,
            eval_loss: None,
        });
    }

    /// Append an evaluation record
    pub fn record_eval(
        &mut self,
        step: usize,
        epoch: usize,
        loss: f32,
        learning_rate: f32,
        eval_loss: f32,
    ) {
        self.records.push(HistoryRecord {
            step,
            epoch,
            loss,
            learning_rate,
            eval_loss: Some(eval_loss),
        });
    }

    /// All records in append order
    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the history as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.records)
            .context("failed to serialize training history")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write history: {}", path.display()))?;
        Ok(())
    }

    /// Load a history written by [`TrainingHistory::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history: {}", path.display()))?;
        let records: Vec<HistoryRecord> =
            serde_json::from_str(&json).context("failed to parse training history")?;
        Ok(Self { records })
    }
}
