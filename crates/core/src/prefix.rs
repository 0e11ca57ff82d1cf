//! Caches carried between prefill calls.

use candle_core::{DType, Tensor};

use crate::error::{EngineError, Result};

/// A previously computed cache plus the tokens it covers.
///
/// Passing one into `prefill` extends the earlier computation instead of
/// redoing it. `common_prefix_tokens` must be a prefix of the new request.
#[derive(Debug, Clone)]
pub struct ExistingPrefix<P> {
    pub cache: P,
    /// `[n]` token ids already folded into `cache`.
    pub common_prefix_tokens: Tensor,
}

impl<P> ExistingPrefix<P> {
    pub fn new(cache: P, common_prefix_tokens: Tensor) -> Self {
        Self {
            cache,
            common_prefix_tokens,
        }
    }

    /// Number of tokens already covered.
    pub fn len(&self) -> usize {
        self.common_prefix_tokens.elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prefix token ids on the host.
    pub fn tokens(&self) -> Result<Vec<u32>> {
        Ok(self
            .common_prefix_tokens
            .flatten_all()?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?)
    }

    /// Verify the cached tokens lead `padded_tokens[..true_length]`.
    pub fn check_prefix_of(&self, padded_tokens: &Tensor, true_length: usize) -> Result<()> {
        let prefix = self.tokens()?;
        if prefix.len() > true_length {
            return Err(EngineError::PrefixMismatch {
                position: true_length,
            });
        }
        let request = padded_tokens
            .flatten_all()?
            .narrow(0, 0, prefix.len())?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        match prefix.iter().zip(&request).position(|(a, b)| a != b) {
            Some(position) => Err(EngineError::PrefixMismatch { position }),
            None => Ok(()),
        }
    }

    pub fn map_cache<Q>(self, f: impl FnOnce(P) -> Q) -> ExistingPrefix<Q> {
        ExistingPrefix {
            cache: f(self.cache),
            common_prefix_tokens: self.common_prefix_tokens,
        }
    }
}
