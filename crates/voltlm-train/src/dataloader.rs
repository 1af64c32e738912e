//! Batching over pre-tokenized examples

use crate::dataset::Dataset;
use anyhow::Result;
use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// One training batch as device tensors
pub struct Batch {
    /// Token ids [batch, seq]
    pub input_ids: Tensor,
    /// 0/1 padding mask [batch, seq]
    pub attention_mask: Tensor,
    /// Next-token targets [batch, seq]
    pub labels: Tensor,
    /// Per-example domain ids [batch], present when every example has one
    pub domain_ids: Option<Tensor>,
    /// Number of examples in the batch
    pub size: usize,
}

/// DataLoader state for checkpointing
///
/// Restoring the cursor and seed resumes iteration at the same point in the
/// same shuffled order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderState {
    /// Index of the next example in the shuffled order
    pub cursor: usize,
    /// Shuffle seed
    pub rng_seed: u64,
    /// Completed reshuffles
    pub epochs_completed: u64,
}

/// Sequential batcher with per-epoch shuffling
///
/// Batches are produced synchronously on the training thread; an epoch ends
/// when fewer than `batch_size` examples remain (the tail is dropped, so
/// every optimizer step sees a full batch).
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    rng_seed: u64,
    epochs_completed: u64,
}

impl DataLoader {
    /// Create a loader over `dataset`
    ///
    /// # Errors
    /// Fails when the batch size is zero or larger than the dataset.
    pub fn new(dataset: Dataset, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be greater than zero");
        }
        if dataset.len() < batch_size {
            anyhow::bail!(
                "dataset holds {} examples, fewer than batch_size {}",
                dataset.len(),
                batch_size
            );
        }

        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            batch_size,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
            rng_seed: seed,
            epochs_completed: 0,
        };
        loader.order.shuffle(&mut loader.rng);
        Ok(loader)
    }

    /// Next batch, or None when the epoch is exhausted
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor + self.batch_size > self.order.len() {
            return None;
        }

        let indices = &self.order[self.cursor..self.cursor + self.batch_size];
        self.cursor += self.batch_size;

        let seq_len = self.dataset.seq_len();
        let mut input_ids = Vec::with_capacity(self.batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(self.batch_size * seq_len);
        let mut labels = Vec::with_capacity(self.batch_size * seq_len);
        let with_domains = self.dataset.has_domain_ids();
        let mut domain_ids = Vec::with_capacity(self.batch_size);

        for &idx in indices {
            let example = self.dataset.get(idx);
            input_ids.extend(example.input_ids.iter().map(|&id| id as f32));
            attention_mask.extend(example.attention_mask.iter().map(|&m| m as f32));
            labels.extend(example.labels.iter().map(|&l| l as f32));
            if with_domains {
                domain_ids.push(example.domain_id.unwrap_or(0) as f32);
            }
        }

        let shape = [self.batch_size, seq_len];
        Some(Batch {
            input_ids: Tensor::new(&input_ids, &shape),
            attention_mask: Tensor::new(&attention_mask, &shape),
            labels: Tensor::new(&labels, &shape),
            domain_ids: with_domains.then(|| Tensor::new(&domain_ids, &[self.batch_size])),
            size: self.batch_size,
        })
    }

    /// Start a new epoch: reshuffle and rewind
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.epochs_completed += 1;
        self.order.shuffle(&mut self.rng);
    }

    /// Full batches per epoch
    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// The split's fixed sequence length
    pub fn seq_len(&self) -> usize {
        self.dataset.seq_len()
    }

    /// Snapshot the iteration state for checkpointing
    pub fn state(&self) -> DataLoaderState {
        DataLoaderState {
            cursor: self.cursor,
            rng_seed: self.rng_seed,
            epochs_completed: self.epochs_completed,
        }
    }

    /// Restore a previously snapshotted state
    ///
    /// Replays the shuffles of the completed epochs so the order matches the
    /// one the snapshot was taken in.
    pub fn restore_state(&mut self, state: &DataLoaderState) {
        self.rng_seed = state.rng_seed;
        self.rng = StdRng::seed_from_u64(state.rng_seed);
        self.order = (0..self.dataset.len()).collect();
        self.order.shuffle(&mut self.rng);
        for _ in 0..state.epochs_completed {
            self.order.shuffle(&mut self.rng);
        }
        self.epochs_completed = state.epochs_completed;
        self.cursor = state.cursor.min(self.order.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TrainingExample;

    fn example(start: u32, domain: Option<u32>) -> TrainingExample {
        TrainingExample {
            input_ids: vec![start, start + 1, start + 2],
            attention_mask: vec![1, 1, 0],
            labels: vec![start as i64, (start + 1) as i64, -100],
            domain_id: domain,
        }
    }

    fn dataset(n: u32, with_domains: bool) -> Dataset {
        let examples = (0..n)
            .map(|i| example(i * 10, with_domains.then_some(i % 3)))
            .collect();
        Dataset::from_examples(examples).expect("valid examples")
    }

    #[test]
    fn test_batch_shapes() {
        let mut loader = DataLoader::new(dataset(6, false), 2, 42).unwrap();
        let batch = loader.next_batch().expect("first batch");
        assert_eq!(batch.input_ids.shape(), &[2, 3]);
        assert_eq!(batch.attention_mask.shape(), &[2, 3]);
        assert_eq!(batch.labels.shape(), &[2, 3]);
        assert!(batch.domain_ids.is_none());
    }

    #[test]
    fn test_domain_ids_present_when_all_examples_have_them() {
        let mut loader = DataLoader::new(dataset(4, true), 2, 42).unwrap();
        let batch = loader.next_batch().expect("batch");
        let domains = batch.domain_ids.expect("domain tensor");
        assert_eq!(domains.shape(), &[2]);
    }

    #[test]
    fn test_epoch_drops_partial_tail() {
        let mut loader = DataLoader::new(dataset(7, false), 2, 42).unwrap();
        let mut batches = 0;
        while loader.next_batch().is_some() {
            batches += 1;
        }
        assert_eq!(batches, 3);
        assert_eq!(loader.batches_per_epoch(), 3);
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let mut loader = DataLoader::new(dataset(4, false), 2, 42).unwrap();
        while loader.next_batch().is_some() {}
        loader.reset();
        assert!(loader.next_batch().is_some());
    }

    #[test]
    fn test_shuffle_is_seed_deterministic() {
        let mut a = DataLoader::new(dataset(8, false), 2, 7).unwrap();
        let mut b = DataLoader::new(dataset(8, false), 2, 7).unwrap();
        let batch_a = a.next_batch().unwrap();
        let batch_b = b.next_batch().unwrap();
        assert_eq!(batch_a.input_ids.data(), batch_b.input_ids.data());
    }

    #[test]
    fn test_state_roundtrip_resumes_same_order() {
        let mut loader = DataLoader::new(dataset(8, false), 2, 7).unwrap();
        loader.next_batch();
        let state = loader.state();
        let expected = loader.next_batch().unwrap();

        let mut resumed = DataLoader::new(dataset(8, false), 2, 0).unwrap();
        resumed.restore_state(&state);
        let actual = resumed.next_batch().unwrap();
        assert_eq!(expected.input_ids.data(), actual.input_ids.data());
    }

    #[test]
    fn test_labels_keep_ignore_index() {
        let mut loader = DataLoader::new(dataset(2, false), 2, 1).unwrap();
        let batch = loader.next_batch().unwrap();
        assert!(batch.labels.data().iter().any(|&l| l == -100.0));
    }

    #[test]
    fn test_batch_size_larger_than_dataset_rejected() {
        assert!(DataLoader::new(dataset(2, false), 3, 1).is_err());
    }
}
