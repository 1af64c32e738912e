//! BPE tokenizer surface for voltlm
//!
//! The training and generation core consumes a tokenizer through this thin
//! wrapper: vocabulary size, bos/eos/pad ids, and encode/decode. The BPE
//! implementation itself comes from `aprender::text::tokenize::BpeTokenizer`.
//!
//! # Example
//!
//! ```no_run
//! use voltlm_tokenizer::Tokenizer;
//!
//! let corpus = ["grid load forecast", "solar output projection"];
//! let tokenizer = Tokenizer::train_from_iterator(corpus.iter(), 500)?;
//!
//! let ids = tokenizer.encode("grid load")?;
//! let text = tokenizer.decode(&ids)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod special_tokens;

pub use special_tokens::SpecialTokens;

use anyhow::{Context, Result};
use aprender::text::tokenize::BpeTokenizer;
use std::path::Path;

/// Serialized tokenizer payload: vocabulary plus merge rules
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TokenizerData {
    /// Token to id mapping
    pub vocabulary: std::collections::HashMap<String, u32>,
    /// BPE merge rules
    pub merges: Vec<(String, String)>,
}

/// Tokenizer combining BPE with the voltlm special tokens
#[derive(Debug, Clone)]
pub struct Tokenizer {
    bpe: BpeTokenizer,
    special: SpecialTokens,
}

impl Tokenizer {
    /// Train a new tokenizer from an iterator of text
    ///
    /// Special tokens are appended to the trained vocabulary so that every
    /// tokenizer produced here can mark sequence boundaries and padding.
    ///
    /// # Arguments
    /// * `text_iterator` - Iterator over training text
    /// * `vocab_size` - Target vocabulary size (before special tokens)
    pub fn train_from_iterator<I, S>(text_iterator: I, vocab_size: usize) -> Result<Self>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        let corpus_owned: Vec<String> = text_iterator.map(|s| s.as_ref().to_string()).collect();
        let corpus: Vec<&str> = corpus_owned.iter().map(|s| s.as_str()).collect();

        let bpe = BpeTokenizer::train(&corpus, vocab_size)
            .map_err(|e| anyhow::anyhow!("failed to train BPE tokenizer: {}", e))?;

        Ok(Self::with_special_tokens(bpe))
    }

    /// Train a tokenizer from all `.txt` files in a directory
    ///
    /// # Errors
    /// Fails when the directory cannot be read, contains no `.txt` files, or
    /// BPE training fails.
    pub fn train_from_directory(data_dir: &Path, vocab_size: usize) -> Result<Self> {
        use std::fs;

        let mut texts = Vec::new();
        let entries = fs::read_dir(data_dir)
            .with_context(|| format!("failed to read directory: {}", data_dir.display()))?;

        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("txt") {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read file: {}", path.display()))?;
                texts.push(content);
            }
        }

        if texts.is_empty() {
            anyhow::bail!("no .txt files found in directory: {}", data_dir.display());
        }

        Self::train_from_iterator(texts.iter(), vocab_size)
    }

    /// Rebuild the BPE table with the special tokens appended to the vocabulary
    fn with_special_tokens(bpe: BpeTokenizer) -> Self {
        let special = SpecialTokens::new();
        let mut vocab = bpe.vocab().clone();
        let merges = bpe.merges().to_vec();

        let mut next_id = vocab.values().copied().max().map_or(0, |m| m + 1);
        for token in special.all() {
            if !vocab.contains_key(token) {
                vocab.insert(token.to_string(), next_id);
                next_id += 1;
            }
        }

        Self {
            bpe: BpeTokenizer::from_vocab(vocab, merges),
            special,
        }
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.bpe
            .encode(text)
            .map_err(|e| anyhow::anyhow!("encoding failed: {}", e))
    }

    /// Encode text, wrapping it in bos/eos markers
    pub fn encode_with_bounds(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.bos_id()?];
        ids.extend(self.encode(text)?);
        ids.push(self.eos_id()?);
        Ok(ids)
    }

    /// Decode token ids to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.bpe
            .decode(ids)
            .map_err(|e| anyhow::anyhow!("decoding failed: {}", e))
    }

    /// Vocabulary size, special tokens included
    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// The special token set in use
    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    /// Id of the beginning-of-sequence token
    pub fn bos_id(&self) -> Result<u32> {
        self.token_id(self.special.bos())
    }

    /// Id of the end-of-sequence token
    pub fn eos_id(&self) -> Result<u32> {
        self.token_id(self.special.eos())
    }

    /// Id of the padding token
    pub fn pad_id(&self) -> Result<u32> {
        self.token_id(self.special.pad())
    }

    fn token_id(&self, token: &str) -> Result<u32> {
        self.bpe
            .token_to_id(token)
            .ok_or_else(|| anyhow::anyhow!("special token not found in vocabulary: {}", token))
    }

    /// Load a tokenizer from `tokenizer.json` inside a directory
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        use std::fs;

        let tokenizer_file = path.as_ref().join("tokenizer.json");
        if !tokenizer_file.exists() {
            anyhow::bail!("tokenizer file not found: {}", tokenizer_file.display());
        }

        let content = fs::read_to_string(&tokenizer_file).with_context(|| {
            format!("failed to read tokenizer file: {}", tokenizer_file.display())
        })?;
        let data: TokenizerData =
            serde_json::from_str(&content).context("failed to parse tokenizer JSON")?;

        let bpe = BpeTokenizer::from_vocab(data.vocabulary, data.merges);
        Ok(Self {
            bpe,
            special: SpecialTokens::new(),
        })
    }

    /// Save the tokenizer as `tokenizer.json` inside a directory
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::fs;

        let path = path.as_ref();
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))?;

        let data = TokenizerData {
            vocabulary: self.bpe.vocab().clone(),
            merges: self.bpe.merges().to_vec(),
        };
        let content = serde_json::to_string(&data).context("failed to serialize tokenizer")?;

        let tokenizer_file = path.join("tokenizer.json");
        fs::write(&tokenizer_file, content).with_context(|| {
            format!("failed to write tokenizer file: {}", tokenizer_file.display())
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn train_small() -> Tokenizer {
        let corpus = [
            "grid load forecast for the northeast region",
            "solar output projection under cloud cover",
            "wholesale electricity price volatility",
        ];
        Tokenizer::train_from_iterator(corpus.iter(), 300).expect("training failed")
    }

    #[test]
    fn test_train_and_encode() {
        let tokenizer = train_small();
        let ids = tokenizer.encode("grid load").expect("encoding failed");
        assert!(!ids.is_empty());
        assert!(tokenizer.vocab_size() > 0);
    }

    #[test]
    fn test_special_token_ids_exist() {
        let tokenizer = train_small();
        let bos = tokenizer.bos_id().unwrap();
        let eos = tokenizer.eos_id().unwrap();
        let pad = tokenizer.pad_id().unwrap();
        assert_ne!(bos, eos);
        assert_ne!(eos, pad);
        assert_ne!(bos, pad);
    }

    #[test]
    fn test_encode_with_bounds() {
        let tokenizer = train_small();
        let ids = tokenizer.encode_with_bounds("grid load").unwrap();
        assert_eq!(ids[0], tokenizer.bos_id().unwrap());
        assert_eq!(*ids.last().unwrap(), tokenizer.eos_id().unwrap());
    }

    #[test]
    fn test_save_and_reload() {
        let tokenizer = train_small();
        let dir = TempDir::new().unwrap();
        tokenizer.save(dir.path()).unwrap();

        let reloaded = Tokenizer::from_directory(dir.path()).unwrap();
        assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());
        assert_eq!(
            reloaded.encode("grid load").unwrap(),
            tokenizer.encode("grid load").unwrap()
        );
        assert_eq!(reloaded.bos_id().unwrap(), tokenizer.bos_id().unwrap());
    }
}
