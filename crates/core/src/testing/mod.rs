//! Shared test utilities for jetstream-core.
//!
//! A recording wrapper for asserting which executor calls were made, and a
//! small engine configuration that keeps tests fast.

mod recording;

pub use recording::{EngineCall, RecordingEngine};

use crate::config::EngineConfig;

/// Four slots, one sample each, 32-token vocabulary, 4-token blocks.
pub fn tiny_engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_decodes: 4,
        samples_per_slot: 1,
        max_prefill_length: 64,
        use_chunked_prefill: false,
        prefill_chunk_size: 8,
        vocab_size: 32,
        block_size: 4,
        num_blocks: 256,
        seed: 7,
        ..EngineConfig::default()
    }
}
