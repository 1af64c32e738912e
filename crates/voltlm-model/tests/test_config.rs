//! Unit tests for configuration validation

use voltlm_model::{ConfigError, VoltConfig};

#[test]
fn test_default_config_is_valid() {
    let config = VoltConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.hidden_size % config.num_attention_heads, 0);
}

#[test]
fn test_presets_are_valid() {
    for config in [VoltConfig::tiny(), VoltConfig::small(), VoltConfig::base()] {
        assert!(config.validate().is_ok());
        assert_eq!(config.hidden_size % config.num_attention_heads, 0);
    }
}

#[test]
fn test_indivisible_heads_rejected() {
    let result = VoltConfig::new(1000, 256, 130, 4, 2);
    match result {
        Err(ConfigError::HiddenSizeNotDivisible {
            hidden_size,
            num_attention_heads,
        }) => {
            assert_eq!(hidden_size, 130);
            assert_eq!(num_attention_heads, 4);
        }
        other => panic!("expected HiddenSizeNotDivisible, got {other:?}"),
    }
}

#[test]
fn test_zero_layers_rejected() {
    assert!(VoltConfig::new(1000, 256, 128, 4, 0).is_err());
}

#[test]
fn test_vocab_size_match() {
    let config = VoltConfig::new(500, 256, 128, 4, 2).expect("valid config");
    assert!(config.validate_vocab_size(500).is_ok());
}

#[test]
fn test_vocab_size_mismatch() {
    let config = VoltConfig::new(500, 256, 128, 4, 2).expect("valid config");
    let result = config.validate_vocab_size(600);
    match result {
        Err(ConfigError::VocabSizeMismatch { config: c, tokenizer: t }) => {
            assert_eq!(c, 500);
            assert_eq!(t, 600);
        }
        other => panic!("expected VocabSizeMismatch, got {other:?}"),
    }
}

#[test]
fn test_config_json_roundtrip() {
    let config = VoltConfig {
        use_domain_embeddings: true,
        num_domains: 12,
        seed: Some(99),
        ..VoltConfig::small()
    };
    let json = serde_json::to_string(&config).expect("serialize");
    let restored: VoltConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored, config);
}
