//! Executor configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv_cache::CacheConfig;
use crate::sampling::SamplingParams;
use crate::tokenizer::TokenizerParameters;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Slots in the decode state.
    pub max_concurrent_decodes: usize,
    /// Rows owned by each slot.
    pub samples_per_slot: usize,
    pub max_prefill_length: usize,
    pub use_chunked_prefill: bool,
    pub prefill_chunk_size: usize,
    pub vocab_size: usize,
    /// Tokens per paged cache block.
    pub block_size: usize,
    /// Blocks in the shared cache pool.
    pub num_blocks: usize,
    /// Seed for parameter init and default multi-sampling.
    pub seed: u64,
    pub temperature: f32,
    /// Top-K filtering for multi-sampling. 0 = disabled.
    pub top_k: u32,
    /// Nucleus threshold for multi-sampling. 1.0 = disabled.
    pub top_p: f32,
    pub tokenizer: TokenizerParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_decodes: 8,
            samples_per_slot: 1,
            max_prefill_length: 1024,
            use_chunked_prefill: false,
            prefill_chunk_size: 256,
            vocab_size: 256,
            block_size: 16,
            num_blocks: 1024,
            seed: 0,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            tokenizer: TokenizerParameters::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_concurrent_decodes", self.max_concurrent_decodes),
            ("samples_per_slot", self.samples_per_slot),
            ("max_prefill_length", self.max_prefill_length),
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.use_chunked_prefill && self.prefill_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "prefill_chunk_size must be > 0 when chunked prefill is enabled".into(),
            ));
        }
        if self.temperature < 0.0 {
            return Err(ConfigError::Invalid("temperature must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::Invalid("top_p must be in [0, 1]".into()));
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            block_size: self.block_size,
            num_blocks: self.num_blocks,
        }
    }

    /// Sampling used by multi-sample prefill, seeded per call.
    pub fn sampling_params(&self, seed: Option<u64>) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_concurrent_decodes, 8);
        assert_eq!(config.prefill_chunk_size, 256);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_concurrent_decodes = 4
            samples_per_slot = 3
            use_chunked_prefill = true

            [tokenizer]
            path = "/models/tokenizer.json"
            extra_ids = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_decodes, 4);
        assert_eq!(config.samples_per_slot, 3);
        assert!(config.use_chunked_prefill);
        assert_eq!(config.tokenizer.extra_ids, 2);
        assert_eq!(config.vocab_size, 256);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = EngineConfig::from_toml_str("samples_per_slot = 0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid config: samples_per_slot must be > 0"
        );
        let err =
            EngineConfig::from_toml_str("use_chunked_prefill = true\nprefill_chunk_size = 0")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("max_concurrent_decodes = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig {
            max_concurrent_decodes: 2,
            temperature: 0.7,
            ..Default::default()
        };
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::load_from(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn derived_configs() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_config().num_blocks, 1024);
        let sampling = config.sampling_params(Some(3));
        assert_eq!(sampling.seed, Some(3));
        assert_eq!(sampling.temperature, 1.0);
    }
}
