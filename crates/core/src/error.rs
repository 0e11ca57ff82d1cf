//! Error taxonomy shared by every executor, the facade, and the result buffers.

use thiserror::Error;

use crate::kv_cache::CacheError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A slot outside `[0, num_slots)` was addressed.
    #[error("slot {slot} out of range (valid slots: 0..{num_slots})")]
    SlotOutOfRange { slot: usize, num_slots: usize },

    #[error("slot {slot} listed more than once")]
    DuplicateSlot { slot: usize },

    #[error("padded tokens ({padded_len}) shorter than true length ({true_length})")]
    TokensTooShort {
        padded_len: usize,
        true_length: usize,
    },

    #[error("prefill request has no tokens to process")]
    EmptyPrompt,

    #[error("prefill of {length} tokens exceeds max prefill length {max_prefill_length}")]
    PrefillTooLong {
        length: usize,
        max_prefill_length: usize,
    },

    /// `ExistingPrefix::common_prefix_tokens` is not a prefix of the request.
    #[error("existing prefix diverges from request tokens at position {position}")]
    PrefixMismatch { position: usize },

    #[error("invalid result layout: {0}")]
    InvalidLayout(String),

    #[error("prefix carries {found} samples but slot holds {expected}")]
    SampleCountMismatch { expected: usize, found: usize },

    #[error("log probabilities present on some buffers but not others")]
    LogProbMismatch,

    #[error("operation `{0}` is not implemented by this engine")]
    Unimplemented(&'static str),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Executor-specific failure, passed through untouched.
    #[error(transparent)]
    Executor(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    /// Whether the error signals a caller bug rather than a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::SlotOutOfRange { .. }
                | Self::DuplicateSlot { .. }
                | Self::TokensTooShort { .. }
                | Self::EmptyPrompt
                | Self::PrefillTooLong { .. }
                | Self::PrefixMismatch { .. }
                | Self::InvalidLayout(_)
                | Self::SampleCountMismatch { .. }
        )
    }

    /// The cache could not grant the blocks a call asked for.
    pub fn is_out_of_blocks(&self) -> bool {
        matches!(self, Self::Cache(CacheError::OutOfBlocks { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_slot_out_of_range() {
        let e = EngineError::SlotOutOfRange {
            slot: 5,
            num_slots: 4,
        };
        assert_eq!(e.to_string(), "slot 5 out of range (valid slots: 0..4)");
    }

    #[test]
    fn display_tokens_too_short() {
        let e = EngineError::TokensTooShort {
            padded_len: 8,
            true_length: 12,
        };
        assert_eq!(
            e.to_string(),
            "padded tokens (8) shorter than true length (12)"
        );
    }

    #[test]
    fn cache_errors_convert() {
        let e: EngineError = CacheError::OutOfBlocks {
            requested: 2,
            available: 0,
        }
        .into();
        assert!(matches!(e, EngineError::Cache(_)));
        assert!(!e.is_contract_violation());
        assert!(e.is_out_of_blocks());
        assert!(!EngineError::EmptyPrompt.is_out_of_blocks());
    }

    #[test]
    fn contract_violations_are_classified() {
        assert!(EngineError::EmptyPrompt.is_contract_violation());
        assert!(EngineError::DuplicateSlot { slot: 1 }.is_contract_violation());
        assert!(!EngineError::Unimplemented("bulk_insert").is_contract_violation());
    }
}
