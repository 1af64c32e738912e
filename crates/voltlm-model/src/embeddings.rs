//! Token, position and domain embeddings

use crate::config::VoltConfig;
use crate::error::ModelError;
use crate::init::{derive_seed, init_normal, EMBEDDING_INIT_STD};
use crate::norm::LayerNorm;
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Dropout, Module};

/// A learned lookup table mapping integer ids to embedding vectors
#[derive(Debug)]
pub struct EmbeddingTable {
    /// Weight matrix, shape [num_embeddings, embedding_dim]
    weight: Tensor,
    num_embeddings: usize,
    embedding_dim: usize,
}

impl EmbeddingTable {
    /// Create a table of `num_embeddings` vectors of length `embedding_dim`
    pub fn new(num_embeddings: usize, embedding_dim: usize, seed: Option<u64>) -> Self {
        Self {
            weight: init_normal(&[num_embeddings, embedding_dim], EMBEDDING_INIT_STD, seed),
            num_embeddings,
            embedding_dim,
        }
    }

    /// Copy the embedding row for `id` into `out`
    ///
    /// The caller is responsible for bounds-checking `id`.
    fn copy_row(&self, id: usize, out: &mut [f32]) {
        let row = &self.weight.data()[id * self.embedding_dim..(id + 1) * self.embedding_dim];
        out.copy_from_slice(row);
    }

    /// Number of rows in the table
    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }
}

impl Module for EmbeddingTable {
    fn forward(&self, input: &Tensor) -> Tensor {
        // Lookup for a flat id tensor; the combined embedding path below is
        // the one exercised by the model.
        let ids: Vec<usize> = input.data().iter().map(|&v| v as usize).collect();
        let mut out = vec![0.0; ids.len() * self.embedding_dim];
        for (i, &id) in ids.iter().enumerate() {
            self.copy_row(id, &mut out[i * self.embedding_dim..(i + 1) * self.embedding_dim]);
        }
        let mut shape = input.shape().to_vec();
        shape.push(self.embedding_dim);
        Tensor::new(&out, &shape)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight]
    }
}

/// Combined input embedding: token + position [+ domain], layer norm, dropout
///
/// Position ids default to `0..seq_len`. The optional domain embedding is a
/// single vector per example, broadcast across the sequence.
#[derive(Debug)]
pub struct VoltEmbeddings {
    token: EmbeddingTable,
    position: EmbeddingTable,
    domain: Option<EmbeddingTable>,
    norm: LayerNorm,
    dropout: Option<Dropout>,
    vocab_size: usize,
    max_position_embeddings: usize,
    num_domains: usize,
    hidden_size: usize,
    training: bool,
}

impl VoltEmbeddings {
    /// Build the embedding stack described by `config`
    pub fn new(config: &VoltConfig) -> Self {
        let token = EmbeddingTable::new(
            config.vocab_size,
            config.hidden_size,
            derive_seed(config.seed, 1),
        );
        let position = EmbeddingTable::new(
            config.max_position_embeddings,
            config.hidden_size,
            derive_seed(config.seed, 2),
        );
        let domain = config.use_domain_embeddings.then(|| {
            EmbeddingTable::new(
                config.num_domains,
                config.hidden_size,
                derive_seed(config.seed, 3),
            )
        });
        let dropout = (config.dropout > 0.0).then(|| match derive_seed(config.seed, 4) {
            Some(s) => Dropout::with_seed(config.dropout, s),
            None => Dropout::new(config.dropout),
        });

        Self {
            token,
            position,
            domain,
            norm: LayerNorm::new(config.hidden_size),
            dropout,
            vocab_size: config.vocab_size,
            max_position_embeddings: config.max_position_embeddings,
            num_domains: config.num_domains,
            hidden_size: config.hidden_size,
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

    /// Embed a batch of token ids
    ///
    /// # Arguments
    /// * `input_ids` - Token ids as a [batch, seq_len] tensor
    /// * `domain_ids` - Optional per-example domain ids, shape [batch]
    ///
    /// # Returns
    /// Hidden state of shape [batch, seq_len, hidden_size]
    ///
    /// # Errors
    /// * [`ModelError::SequenceTooLong`] when `seq_len > max_position_embeddings`
    /// * [`ModelError::TokenIdOutOfRange`] / [`ModelError::DomainIdOutOfRange`]
    ///   for ids outside their tables
    pub fn forward(&self, input_ids: &Tensor, domain_ids: Option<&Tensor>) -> Result<Tensor> {
        let shape = input_ids.shape();
        if shape.len() != 2 {
            anyhow::bail!("expected 2D input_ids [batch, seq_len], got shape {:?}", shape);
        }
        let (batch_size, seq_len) = (shape[0], shape[1]);

        if seq_len > self.max_position_embeddings {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                max: self.max_position_embeddings,
            }
            .into());
        }

        let ids_data = input_ids.data();
        let hidden = self.hidden_size;
        let mut output = vec![0.0; batch_size * seq_len * hidden];
        let mut row = vec![0.0; hidden];

        for b in 0..batch_size {
            for t in 0..seq_len {
                let id = ids_data[b * seq_len + t] as u32;
                if id as usize >= self.vocab_size {
                    return Err(ModelError::TokenIdOutOfRange {
                        id,
                        vocab_size: self.vocab_size,
                    }
                    .into());
                }

                let out = &mut output[(b * seq_len + t) * hidden..(b * seq_len + t + 1) * hidden];
                self.token.copy_row(id as usize, out);
                self.position.copy_row(t, &mut row);
                for (o, r) in out.iter_mut().zip(row.iter()) {
                    *o += r;
                }
            }
        }

        if let (Some(table), Some(ids)) = (self.domain.as_ref(), domain_ids) {
            let domain_data = ids.data();
            for b in 0..batch_size {
                let id = domain_data[b] as u32;
                if id as usize >= self.num_domains {
                    return Err(ModelError::DomainIdOutOfRange {
                        id,
                        num_domains: self.num_domains,
                    }
                    .into());
                }
                table.copy_row(id as usize, &mut row);
                for t in 0..seq_len {
                    let out =
                        &mut output[(b * seq_len + t) * hidden..(b * seq_len + t + 1) * hidden];
                    for (o, r) in out.iter_mut().zip(row.iter()) {
                        *o += r;
                    }
                }
            }
        }

        let summed = Tensor::new(&output, &[batch_size, seq_len, hidden]);
        let normed = self.norm.forward(&summed);

        let result = match (&self.dropout, self.training) {
            (Some(dropout), true) => dropout.forward(&normed),
            _ => normed,
        };
        Ok(result)
    }
}

impl Module for VoltEmbeddings {
    fn forward(&self, input: &Tensor) -> Tensor {
        VoltEmbeddings::forward(self, input, None).expect("embedding forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.token.parameters();
        params.extend(self.position.parameters());
        if let Some(ref domain) = self.domain {
            params.extend(domain.parameters());
        }
        params.extend(self.norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.token.parameters_mut();
        params.extend(self.position.parameters_mut());
        if let Some(ref mut domain) = self.domain {
            params.extend(domain.parameters_mut());
        }
        params.extend(self.norm.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VoltConfig {
        VoltConfig {
            vocab_size: 50,
            max_position_embeddings: 8,
            hidden_size: 16,
            num_attention_heads: 4,
            num_hidden_layers: 1,
            intermediate_size: 32,
            dropout: 0.0,
            seed: Some(42),
            ..VoltConfig::default()
        }
    }

    #[test]
    fn test_embeddings_output_shape() {
        let emb = VoltEmbeddings::new(&test_config());
        let ids = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let out = emb.forward(&ids, None).unwrap();
        assert_eq!(out.shape(), &[2, 3, 16]);
    }

    #[test]
    fn test_sequence_too_long() {
        let emb = VoltEmbeddings::new(&test_config());
        let ids = Tensor::zeros(&[1, 9]);
        let err = emb.forward(&ids, None).unwrap_err();
        let model_err = err.downcast_ref::<ModelError>().expect("typed error");
        assert_eq!(
            *model_err,
            ModelError::SequenceTooLong { len: 9, max: 8 }
        );
    }

    #[test]
    fn test_token_id_out_of_range() {
        let emb = VoltEmbeddings::new(&test_config());
        let ids = Tensor::new(&[49.0, 50.0], &[1, 2]);
        let err = emb.forward(&ids, None).unwrap_err();
        assert!(err.downcast_ref::<ModelError>().is_some());
    }

    #[test]
    fn test_domain_embedding_broadcast() {
        let config = VoltConfig {
            use_domain_embeddings: true,
            num_domains: 4,
            ..test_config()
        };
        let emb = VoltEmbeddings::new(&config);
        let ids = Tensor::new(&[1.0, 2.0, 3.0], &[1, 3]);
        let domains = Tensor::new(&[2.0], &[1]);

        let with_domain = emb.forward(&ids, Some(&domains)).unwrap();
        let without = emb.forward(&ids, None).unwrap();
        assert_eq!(with_domain.shape(), without.shape());
        // The domain vector shifts every position.
        assert_ne!(with_domain.data(), without.data());
    }

    #[test]
    fn test_domain_id_out_of_range() {
        let config = VoltConfig {
            use_domain_embeddings: true,
            num_domains: 4,
            ..test_config()
        };
        let emb = VoltEmbeddings::new(&config);
        let ids = Tensor::new(&[1.0], &[1, 1]);
        let domains = Tensor::new(&[4.0], &[1]);
        assert!(emb.forward(&ids, Some(&domains)).is_err());
    }

    #[test]
    fn test_deterministic_with_seed() {
        let a = VoltEmbeddings::new(&test_config());
        let b = VoltEmbeddings::new(&test_config());
        let ids = Tensor::new(&[7.0, 8.0], &[1, 2]);
        assert_eq!(
            a.forward(&ids, None).unwrap().data(),
            b.forward(&ids, None).unwrap().data()
        );
    }
}
