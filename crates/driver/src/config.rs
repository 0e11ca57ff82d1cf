//! Driver configuration.
//!
//! Values are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file given with `--config`
//! 3. Default values (lowest priority)
//!
//! The file is a single TOML document: an `[engine]` table read as
//! [`EngineConfig`] and a `[driver]` table for the scheduling run.

use std::fs;
use std::path::Path;

use jetstream_core::config::ConfigError;
use jetstream_core::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub engine: EngineConfig,
    pub driver: RunSettings,
}

/// Shape of the synthetic workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Requests submitted to the scheduler.
    pub num_requests: usize,
    /// Tokens generated per request, counting the one from prefill.
    pub max_new_tokens: usize,
    /// Prompt length of every synthetic request.
    pub prompt_len: usize,
    /// Run facade warm-up before the first request.
    pub warmup: bool,
    /// Token id used to pad prompts up to a prefill bucket.
    pub pad_id: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            num_requests: 16,
            max_new_tokens: 16,
            prompt_len: 24,
            warmup: true,
            pad_id: 0,
        }
    }
}

impl DriverConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.driver.max_new_tokens == 0 {
            return Err(ConfigError::Invalid("max_new_tokens must be at least 1".into()));
        }
        if self.driver.prompt_len == 0 {
            return Err(ConfigError::Invalid("prompt_len must be at least 1".into()));
        }
        let engine = &self.engine;
        if self.driver.prompt_len > engine.max_prefill_length
            && !(engine.use_chunked_prefill && engine.prefill_chunk_size <= engine.max_prefill_length)
        {
            return Err(ConfigError::Invalid(format!(
                "prompt_len {} exceeds max_prefill_length {} without usable chunked prefill",
                self.driver.prompt_len, engine.max_prefill_length
            )));
        }
        Ok(())
    }

    /// Apply CLI overrides, preferring values present in `overrides`.
    pub fn merge(&mut self, overrides: &Overrides) {
        if let Some(n) = overrides.num_requests {
            self.driver.num_requests = n;
        }
        if let Some(n) = overrides.max_new_tokens {
            self.driver.max_new_tokens = n;
        }
        if let Some(n) = overrides.prompt_len {
            self.driver.prompt_len = n;
        }
        if overrides.no_warmup {
            self.driver.warmup = false;
        }
        if let Some(n) = overrides.max_concurrent_decodes {
            self.engine.max_concurrent_decodes = n;
        }
        if let Some(n) = overrides.samples_per_slot {
            self.engine.samples_per_slot = n;
        }
        if overrides.chunked_prefill {
            self.engine.use_chunked_prefill = true;
        }
        if let Some(seed) = overrides.seed {
            self.engine.seed = seed;
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub num_requests: Option<usize>,
    pub max_new_tokens: Option<usize>,
    pub prompt_len: Option<usize>,
    pub no_warmup: bool,
    pub max_concurrent_decodes: Option<usize>,
    pub samples_per_slot: Option<usize>,
    pub chunked_prefill: bool,
    pub seed: Option<u64>,
}
