//! Pre-tokenized dataset loading
//!
//! The data-preparation pipeline hands the trainer JSONL files of
//! pre-tokenized records at a fixed sequence length. Loading validates the
//! record invariants up front so that shape errors surface before any model
//! is constructed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use voltlm_model::IGNORE_INDEX;

/// Training split file name inside the data directory
pub const TRAIN_FILE: &str = "train.jsonl";
/// Validation split file name inside the data directory
pub const VAL_FILE: &str = "val.jsonl";

/// Errors raised while locating or validating the dataset
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no preprocessed dataset found at {0}")]
    NotFound(PathBuf),
    #[error("invalid example at line {line}: {reason}")]
    InvalidExample { line: usize, reason: String },
}

/// One pre-tokenized example
///
/// All three sequences have the same fixed length. Padding positions carry
/// `attention_mask == 0` and a label of [`IGNORE_INDEX`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    /// Input token ids
    pub input_ids: Vec<u32>,
    /// 0/1 padding mask
    pub attention_mask: Vec<u8>,
    /// Next-token targets; [`IGNORE_INDEX`] masks a position
    pub labels: Vec<i64>,
    /// Optional content-domain id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<u32>,
}

/// An in-memory split of pre-tokenized examples
pub struct Dataset {
    examples: Vec<TrainingExample>,
    seq_len: usize,
}

impl Dataset {
    /// Load a JSONL split
    ///
    /// # Arguments
    /// * `path` - Path to the `.jsonl` file
    /// * `max_seq_len` - Upper bound on the per-example sequence length
    ///
    /// # Errors
    /// [`DataError::NotFound`] when the file is absent;
    /// [`DataError::InvalidExample`] when any record violates the length
    /// invariants (the three sequences must share one fixed length, at most
    /// `max_seq_len`, identical across the whole split).
    pub fn load(path: &Path, max_seq_len: usize) -> Result<Self> {
        if !path.exists() {
            return Err(DataError::NotFound(path.to_path_buf()).into());
        }

        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open dataset: {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut examples = Vec::new();
        let mut seq_len = None;

        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let example: TrainingExample =
                serde_json::from_str(&line).map_err(|e| DataError::InvalidExample {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;

            validate_example(&example, idx + 1, max_seq_len)?;

            match seq_len {
                None => seq_len = Some(example.input_ids.len()),
                Some(expected) if expected != example.input_ids.len() => {
                    return Err(DataError::InvalidExample {
                        line: idx + 1,
                        reason: format!(
                            "sequence length {} differs from the split's fixed length {}",
                            example.input_ids.len(),
                            expected
                        ),
                    }
                    .into());
                }
                Some(_) => {}
            }

            examples.push(example);
        }

        if examples.is_empty() {
            return Err(DataError::NotFound(path.to_path_buf()).into());
        }

        Ok(Self {
            seq_len: seq_len.unwrap_or(0),
            examples,
        })
    }

    /// Check token and domain ids against the model vocabulary
    ///
    /// Run after the tokenizer is known but before training starts.
    pub fn validate_against(&self, vocab_size: usize, num_domains: usize) -> Result<()> {
        for (idx, example) in self.examples.iter().enumerate() {
            if let Some(&id) = example.input_ids.iter().find(|&&id| id as usize >= vocab_size) {
                return Err(DataError::InvalidExample {
                    line: idx + 1,
                    reason: format!("input id {id} outside vocabulary of size {vocab_size}"),
                }
                .into());
            }
            if let Some(&label) = example
                .labels
                .iter()
                .find(|&&l| l != IGNORE_INDEX && (l < 0 || l as usize >= vocab_size))
            {
                return Err(DataError::InvalidExample {
                    line: idx + 1,
                    reason: format!("label {label} outside vocabulary of size {vocab_size}"),
                }
                .into());
            }
            if let Some(domain) = example.domain_id {
                if domain as usize >= num_domains {
                    return Err(DataError::InvalidExample {
                        line: idx + 1,
                        reason: format!("domain id {domain} outside [0, {num_domains})"),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// True when the split holds no examples
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// The split's fixed sequence length
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Example at `index`
    pub fn get(&self, index: usize) -> &TrainingExample {
        &self.examples[index]
    }

    /// True when every example carries a domain id
    pub fn has_domain_ids(&self) -> bool {
        self.examples.iter().all(|e| e.domain_id.is_some())
    }

    /// Build a split directly from records (used by tests and tools)
    pub fn from_examples(examples: Vec<TrainingExample>) -> Result<Self> {
        let seq_len = examples.first().map_or(0, |e| e.input_ids.len());
        for (idx, example) in examples.iter().enumerate() {
            validate_example(example, idx + 1, usize::MAX)?;
            if example.input_ids.len() != seq_len {
                return Err(DataError::InvalidExample {
                    line: idx + 1,
                    reason: "mixed sequence lengths".to_string(),
                }
                .into());
            }
        }
        Ok(Self { examples, seq_len })
    }
}

fn validate_example(example: &TrainingExample, line: usize, max_seq_len: usize) -> Result<()> {
    let len = example.input_ids.len();
    if len == 0 {
        return Err(DataError::InvalidExample {
            line,
            reason: "empty input_ids".to_string(),
        }
        .into());
    }
    if example.attention_mask.len() != len || example.labels.len() != len {
        return Err(DataError::InvalidExample {
            line,
            reason: format!(
                "length mismatch: input_ids {}, attention_mask {}, labels {}",
                len,
                example.attention_mask.len(),
                example.labels.len()
            ),
        }
        .into());
    }
    if len > max_seq_len {
        return Err(DataError::InvalidExample {
            line,
            reason: format!("sequence length {len} exceeds maximum {max_seq_len}"),
        }
        .into());
    }
    if let Some(&bad) = example.attention_mask.iter().find(|&&m| m > 1) {
        return Err(DataError::InvalidExample {
            line,
            reason: format!("attention_mask value {bad} is not 0/1"),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_jsonl(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".jsonl")
            .tempfile()
            .expect("temp file");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        file.flush().expect("flush");
        file
    }

    #[test]
    fn test_load_valid_split() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1,2,3,4],"attention_mask":[1,1,1,0],"labels":[1,2,3,-100]}"#,
            r#"{"input_ids":[5,6,7,8],"attention_mask":[1,1,1,1],"labels":[5,6,7,8],"domain_id":2}"#,
        ]);
        let dataset = Dataset::load(file.path(), 8).expect("load");
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.seq_len(), 4);
        assert!(!dataset.has_domain_ids());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = Dataset::load(Path::new("/nonexistent/train.jsonl"), 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::NotFound(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let file =
            write_jsonl(&[r#"{"input_ids":[1,2,3],"attention_mask":[1,1],"labels":[1,2,3]}"#]);
        let err = Dataset::load(file.path(), 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::InvalidExample { line: 1, .. })
        ));
    }

    #[test]
    fn test_over_length_rejected() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1,2,3,4,5],"attention_mask":[1,1,1,1,1],"labels":[1,2,3,4,5]}"#,
        ]);
        assert!(Dataset::load(file.path(), 4).is_err());
    }

    #[test]
    fn test_mixed_lengths_rejected() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1,2],"attention_mask":[1,1],"labels":[1,2]}"#,
            r#"{"input_ids":[1,2,3],"attention_mask":[1,1,1],"labels":[1,2,3]}"#,
        ]);
        assert!(Dataset::load(file.path(), 8).is_err());
    }

    #[test]
    fn test_validate_against_vocab() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1,99],"attention_mask":[1,1],"labels":[1,99]}"#,
        ]);
        let dataset = Dataset::load(file.path(), 8).expect("load");
        assert!(dataset.validate_against(100, 1).is_ok());
        assert!(dataset.validate_against(50, 1).is_err());
    }

    #[test]
    fn test_validate_against_domains() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1],"attention_mask":[1],"labels":[1],"domain_id":5}"#,
        ]);
        let dataset = Dataset::load(file.path(), 8).expect("load");
        assert!(dataset.validate_against(10, 6).is_ok());
        assert!(dataset.validate_against(10, 5).is_err());
    }

    #[test]
    fn test_ignore_index_labels_accepted() {
        let file = write_jsonl(&[
            r#"{"input_ids":[1,2],"attention_mask":[1,0],"labels":[1,-100]}"#,
        ]);
        let dataset = Dataset::load(file.path(), 8).expect("load");
        assert!(dataset.validate_against(10, 1).is_ok());
    }
}
