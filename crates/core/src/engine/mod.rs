//! The executor contract.
//!
//! A scheduler drives any [`Engine`] through the same slot lifecycle:
//!
//! ```text
//! FREE --insert/bulk_insert--> ACTIVE --generate*--> ACTIVE --free_resource--> FREE
//! ```
//!
//! The engine never tracks which slots are active; the scheduler owns that
//! bookkeeping and the engine only guarantees each call is correct under it.
//! `DecodeState` and `Prefix` are moved into the calls that consume them and
//! the returned state is the only valid successor.

mod chunked;
mod facade;
mod warmup;

pub use chunked::prefill_chunked;
pub use facade::JetStreamEngine;
pub use warmup::{WarmupConfig, WarmupStats};

use std::collections::HashSet;
use std::fmt;

use candle_core::Tensor;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::prefix::ExistingPrefix;
use crate::result_tokens::ResultTokens;
use crate::tokenizer::{BuildTokenizer, TokenizerParameters};

// ─── Sampler ──────────────────────────────────────────────────────────────

/// Chooses next tokens in place of an executor's default policy.
///
/// Maps `[batch, vocab]` logits to `[batch]` U32 token ids.
pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &Tensor) -> candle_core::Result<Tensor>;
}

impl<F> Sampler for F
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn sample(&self, logits: &Tensor) -> candle_core::Result<Tensor> {
        self(logits)
    }
}

// ─── Prefill request ──────────────────────────────────────────────────────

/// Arguments of a single prefill call.
pub struct PrefillRequest<'a, P> {
    /// `[padded_len]` U32 token ids; entries past `true_length` are padding.
    pub padded_tokens: &'a Tensor,
    pub true_length: usize,
    pub existing_prefix: Option<&'a ExistingPrefix<P>>,
    pub sampler: Option<&'a dyn Sampler>,
    pub request_id: Option<Uuid>,
}

impl<'a, P> PrefillRequest<'a, P> {
    pub fn new(padded_tokens: &'a Tensor, true_length: usize) -> Self {
        Self {
            padded_tokens,
            true_length,
            existing_prefix: None,
            sampler: None,
            request_id: None,
        }
    }

    pub fn with_existing_prefix(mut self, existing: &'a ExistingPrefix<P>) -> Self {
        self.existing_prefix = Some(existing);
        self
    }

    pub fn with_sampler(mut self, sampler: &'a dyn Sampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn padded_len(&self) -> usize {
        self.padded_tokens.dims().last().copied().unwrap_or(0)
    }

    /// Tokens this call must compute, excluding the existing prefix.
    pub fn new_tokens(&self) -> usize {
        let cached = self.existing_prefix.map_or(0, |e| e.len());
        self.true_length.saturating_sub(cached)
    }

    /// Contract checks shared by every executor.
    pub fn validate(&self, max_prefill_length: usize) -> Result<()> {
        let padded_len = self.padded_len();
        if padded_len < self.true_length {
            return Err(EngineError::TokensTooShort {
                padded_len,
                true_length: self.true_length,
            });
        }
        if let Some(existing) = self.existing_prefix {
            existing.check_prefix_of(self.padded_tokens, self.true_length)?;
        }
        let length = self.new_tokens();
        if length == 0 {
            return Err(EngineError::EmptyPrompt);
        }
        if length > max_prefill_length {
            return Err(EngineError::PrefillTooLong {
                length,
                max_prefill_length,
            });
        }
        Ok(())
    }
}

impl<P> Clone for PrefillRequest<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for PrefillRequest<'_, P> {}

impl<P> fmt::Debug for PrefillRequest<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefillRequest")
            .field("padded_len", &self.padded_len())
            .field("true_length", &self.true_length)
            .field(
                "existing_prefix_len",
                &self.existing_prefix.map(|e| e.len()),
            )
            .field("has_sampler", &self.sampler.is_some())
            .field("request_id", &self.request_id)
            .finish()
    }
}

// ─── Slot validation ──────────────────────────────────────────────────────

pub fn validate_slot(slot: usize, num_slots: usize) -> Result<()> {
    if slot >= num_slots {
        return Err(EngineError::SlotOutOfRange { slot, num_slots });
    }
    Ok(())
}

/// Range-check every slot and reject repeats.
pub fn validate_slots(slots: &[usize], num_slots: usize) -> Result<()> {
    let mut seen = HashSet::with_capacity(slots.len());
    for &slot in slots {
        validate_slot(slot, num_slots)?;
        if !seen.insert(slot) {
            return Err(EngineError::DuplicateSlot { slot });
        }
    }
    Ok(())
}

// ─── Rejected insert ──────────────────────────────────────────────────────

/// Failure of [`Engine::try_insert`].
///
/// `decode_state` is `Some` when the engine rejected the prefix before
/// mutating anything; it is then still the valid state for the next call.
pub struct InsertRejected<S> {
    pub error: EngineError,
    pub decode_state: Option<S>,
}

impl<S> InsertRejected<S> {
    pub fn consumed(error: EngineError) -> Self {
        Self {
            error,
            decode_state: None,
        }
    }
}

impl<S> fmt::Debug for InsertRejected<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertRejected")
            .field("error", &self.error)
            .field("state_returned", &self.decode_state.is_some())
            .finish()
    }
}

impl<S> From<InsertRejected<S>> for EngineError {
    fn from(rejected: InsertRejected<S>) -> Self {
        rejected.error
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────

/// Operations and static properties a model executor supplies.
///
/// Capacity properties are fixed for the executor's lifetime.
pub trait Engine: Send + Sync {
    /// Loaded weights, shared read-only by every call.
    type Params: Send + Sync;
    /// Per-request cache produced by prefill.
    type Prefix: Send;
    /// Batched cache covering every slot.
    type DecodeState: Send;
    type Tokenizer: BuildTokenizer;
    type Mesh;
    type CpuDevice;
    type RngKey;
    type Sharding;

    /// Compute the cache for `padded_tokens[..true_length]` and its first token.
    ///
    /// The returned buffer has a single slot.
    fn prefill(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
    ) -> Result<(Self::Prefix, ResultTokens)>;

    /// Like [`Engine::prefill`], drawing `num_samples` first tokens.
    ///
    /// The returned buffer has `samples_per_slot == num_samples`.
    fn prefill_multisampling(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
        rng: Option<Self::RngKey>,
        num_samples: usize,
    ) -> Result<(Self::Prefix, ResultTokens)>;

    /// Advance every active slot by one step. Free slots yield ignored rows.
    fn generate(
        &self,
        params: &Self::Params,
        decode_state: Self::DecodeState,
        sampler: Option<&dyn Sampler>,
    ) -> Result<(Self::DecodeState, ResultTokens)>;

    /// Merge `prefix` into `decode_state` at `slot`.
    ///
    /// Mutates only the rows of `slot`, so it may overlap a `generate`
    /// touching other slots.
    fn insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> Result<Self::DecodeState>;

    /// [`Engine::insert`] that can hand `decode_state` back on failure.
    ///
    /// Engines that check capacity before touching the state override this
    /// so a scheduler can retry the admission later. The default consumes
    /// the state on every error.
    fn try_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> std::result::Result<Self::DecodeState, InsertRejected<Self::DecodeState>> {
        self.insert(prefix, decode_state, slot, request_id)
            .map_err(InsertRejected::consumed)
    }

    /// Insert one prefix into several slots, as if by repeated `insert`.
    fn bulk_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slots: &[usize],
    ) -> Result<Self::DecodeState>;

    /// Release resources tied to `slot`. Call before the slot is reused.
    fn free_resource(&self, slot: usize) -> Result<()> {
        let _ = slot;
        Ok(())
    }

    fn load_params(&self) -> Result<Self::Params>;

    fn init_decode_state(&self) -> Result<Self::DecodeState>;

    fn get_prefix_destination_sharding(&self) -> Self::Sharding;

    fn get_tokenizer(&self) -> TokenizerParameters;

    fn build_tokenizer(&self, metadata: &TokenizerParameters) -> Result<Self::Tokenizer> {
        Self::Tokenizer::from_parameters(metadata)
    }

    fn max_concurrent_decodes(&self) -> usize;

    fn samples_per_slot(&self) -> usize;

    fn max_prefill_length(&self) -> usize;

    fn mesh(&self) -> &Self::Mesh;

    fn colocated_cpus(&self) -> Option<&[Self::CpuDevice]>;

    fn use_chunked_prefill(&self) -> bool;

    fn prefill_chunk_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tokens(ids: &[u32]) -> Tensor {
        Tensor::new(ids, &Device::Cpu).unwrap()
    }

    #[test]
    fn valid_request_passes() {
        let t = tokens(&[1, 2, 3, 0]);
        PrefillRequest::<()>::new(&t, 3).validate(8).unwrap();
    }

    #[test]
    fn padded_shorter_than_true_length() {
        let t = tokens(&[1, 2]);
        let err = PrefillRequest::<()>::new(&t, 3).validate(8).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TokensTooShort {
                padded_len: 2,
                true_length: 3
            }
        ));
    }

    #[test]
    fn empty_and_overlong_prompts() {
        let t = tokens(&[1, 2, 3, 4]);
        assert!(matches!(
            PrefillRequest::<()>::new(&t, 0).validate(8),
            Err(EngineError::EmptyPrompt)
        ));
        assert!(matches!(
            PrefillRequest::<()>::new(&t, 4).validate(2),
            Err(EngineError::PrefillTooLong {
                length: 4,
                max_prefill_length: 2
            })
        ));
    }

    #[test]
    fn existing_prefix_counts_against_new_tokens_only() {
        let t = tokens(&[1, 2, 3, 4]);
        let existing = ExistingPrefix::new((), tokens(&[1, 2, 3]));
        let request = PrefillRequest::new(&t, 4).with_existing_prefix(&existing);
        assert_eq!(request.new_tokens(), 1);
        request.validate(1).unwrap();

        let wrong = ExistingPrefix::new((), tokens(&[1, 5]));
        let err = PrefillRequest::new(&t, 4)
            .with_existing_prefix(&wrong)
            .validate(8)
            .unwrap_err();
        assert!(matches!(err, EngineError::PrefixMismatch { position: 1 }));
    }

    #[test]
    fn slot_checks() {
        validate_slot(3, 4).unwrap();
        assert!(validate_slot(4, 4).is_err());
        validate_slots(&[2, 0], 4).unwrap();
        assert!(matches!(
            validate_slots(&[1, 2, 1], 4),
            Err(EngineError::DuplicateSlot { slot: 1 })
        ));
        assert!(matches!(
            validate_slots(&[1, 7], 4),
            Err(EngineError::SlotOutOfRange { slot: 7, .. })
        ));
    }

    #[test]
    fn closures_are_samplers() {
        let always_two =
            |logits: &Tensor| Tensor::full(2u32, logits.dim(0)?, logits.device());
        let logits = Tensor::zeros((3, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let sampler: &dyn Sampler = &always_two;
        assert_eq!(
            sampler.sample(&logits).unwrap().to_vec1::<u32>().unwrap(),
            vec![2, 2, 2]
        );
    }

    #[test]
    fn request_debug_omits_sampler_body() {
        let t = tokens(&[1]);
        let id = Uuid::new_v4();
        let dbg = format!("{:?}", PrefillRequest::<()>::new(&t, 1).with_request_id(id));
        assert!(dbg.contains("true_length: 1"));
        assert!(dbg.contains(&id.to_string()));
    }
}
