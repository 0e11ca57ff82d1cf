use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use super::{Engine, InsertRejected, PrefillRequest, Sampler};
use crate::error::Result;
use crate::result_tokens::ResultTokens;
use crate::tokenizer::TokenizerParameters;

/// Forwarding wrapper around an executor.
///
/// Every [`Engine`] method passes its arguments straight through and returns
/// the executor's result or error untouched. The wrapper adds only its own
/// bookkeeping: whether warm-up has run, and which prefill buckets it covered.
pub struct JetStreamEngine<E> {
    downstream: E,
    warm: AtomicBool,
    prefill_buckets: RwLock<Option<Vec<usize>>>,
}

impl<E: Engine> JetStreamEngine<E> {
    pub fn new(downstream: E) -> Self {
        Self {
            downstream,
            warm: AtomicBool::new(false),
            prefill_buckets: RwLock::new(None),
        }
    }

    pub fn downstream(&self) -> &E {
        &self.downstream
    }

    pub fn into_inner(self) -> E {
        self.downstream
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Buckets recorded by the last warm-up, if any.
    pub fn prefill_buckets(&self) -> Option<Vec<usize>> {
        self.prefill_buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_prefill_buckets(&self, buckets: Option<Vec<usize>>) {
        *self
            .prefill_buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner) = buckets;
    }

    pub(super) fn set_warm(&self, warm: bool) {
        self.warm.store(warm, Ordering::Release);
    }
}

impl<E: Engine> Engine for JetStreamEngine<E> {
    type Params = E::Params;
    type Prefix = E::Prefix;
    type DecodeState = E::DecodeState;
    type Tokenizer = E::Tokenizer;
    type Mesh = E::Mesh;
    type CpuDevice = E::CpuDevice;
    type RngKey = E::RngKey;
    type Sharding = E::Sharding;

    fn prefill(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
    ) -> Result<(Self::Prefix, ResultTokens)> {
        self.downstream.prefill(params, request)
    }

    fn prefill_multisampling(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
        rng: Option<Self::RngKey>,
        num_samples: usize,
    ) -> Result<(Self::Prefix, ResultTokens)> {
        self.downstream
            .prefill_multisampling(params, request, rng, num_samples)
    }

    fn generate(
        &self,
        params: &Self::Params,
        decode_state: Self::DecodeState,
        sampler: Option<&dyn Sampler>,
    ) -> Result<(Self::DecodeState, ResultTokens)> {
        self.downstream.generate(params, decode_state, sampler)
    }

    fn insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> Result<Self::DecodeState> {
        self.downstream.insert(prefix, decode_state, slot, request_id)
    }

    fn try_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> std::result::Result<Self::DecodeState, InsertRejected<Self::DecodeState>> {
        self.downstream.try_insert(prefix, decode_state, slot, request_id)
    }

    fn bulk_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slots: &[usize],
    ) -> Result<Self::DecodeState> {
        self.downstream.bulk_insert(prefix, decode_state, slots)
    }

    fn free_resource(&self, slot: usize) -> Result<()> {
        self.downstream.free_resource(slot)
    }

    fn load_params(&self) -> Result<Self::Params> {
        self.downstream.load_params()
    }

    fn init_decode_state(&self) -> Result<Self::DecodeState> {
        self.downstream.init_decode_state()
    }

    fn get_prefix_destination_sharding(&self) -> Self::Sharding {
        self.downstream.get_prefix_destination_sharding()
    }

    fn get_tokenizer(&self) -> TokenizerParameters {
        self.downstream.get_tokenizer()
    }

    fn build_tokenizer(&self, metadata: &TokenizerParameters) -> Result<Self::Tokenizer> {
        self.downstream.build_tokenizer(metadata)
    }

    fn max_concurrent_decodes(&self) -> usize {
        self.downstream.max_concurrent_decodes()
    }

    fn samples_per_slot(&self) -> usize {
        self.downstream.samples_per_slot()
    }

    fn max_prefill_length(&self) -> usize {
        self.downstream.max_prefill_length()
    }

    fn mesh(&self) -> &Self::Mesh {
        self.downstream.mesh()
    }

    fn colocated_cpus(&self) -> Option<&[Self::CpuDevice]> {
        self.downstream.colocated_cpus()
    }

    fn use_chunked_prefill(&self) -> bool {
        self.downstream.use_chunked_prefill()
    }

    fn prefill_chunk_size(&self) -> usize {
        self.downstream.prefill_chunk_size()
    }
}
