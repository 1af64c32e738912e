//! Special token handling

/// Special tokens used by the voltlm data pipeline
///
/// Marks document boundaries and padding for batching. The token strings are
/// part of the on-disk data contract; the ids they map to depend on the
/// trained vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    bos: String,
    eos: String,
    pad: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: "<|bos|>".to_string(),
            eos: "<|eos|>".to_string(),
            pad: "<|pad|>".to_string(),
        }
    }
}

impl SpecialTokens {
    /// Create the default special token set
    pub fn new() -> Self {
        Self::default()
    }

    /// Beginning-of-sequence token
    pub fn bos(&self) -> &str {
        &self.bos
    }

    /// End-of-sequence token
    pub fn eos(&self) -> &str {
        &self.eos
    }

    /// Padding token
    pub fn pad(&self) -> &str {
        &self.pad
    }

    /// All special tokens, in a stable order
    pub fn all(&self) -> [&str; 3] {
        [&self.bos, &self.eos, &self.pad]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tokens() {
        let tokens = SpecialTokens::new();
        assert_eq!(tokens.bos(), "<|bos|>");
        assert_eq!(tokens.eos(), "<|eos|>");
        assert_eq!(tokens.pad(), "<|pad|>");
        assert_eq!(tokens.all().len(), 3);
    }
}
