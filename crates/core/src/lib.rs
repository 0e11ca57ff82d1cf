//! Executor contract and packed result buffers for continuous-batching
//! inference.
//!
//! A scheduler assigns requests to fixed slots and drives any [`Engine`]
//! through prefill, insert, generate and free_resource. Every step's tokens
//! come back in one dense [`ResultTokens`] buffer addressed by slot.

pub mod config;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod mesh;
pub mod padding;
pub mod prefix;
pub mod reference;
pub mod result_tokens;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::EngineConfig;
pub use engine::{Engine, InsertRejected, JetStreamEngine, PrefillRequest, Sampler};
pub use error::{EngineError, Result};
pub use prefix::ExistingPrefix;
pub use reference::ReferenceEngine;
pub use result_tokens::{ColumnRange, ResultTokens, SlotData, SlotSample};
pub use tokenizer::{BuildTokenizer, TokenizerParameters, TokenizerWrapper};
