use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::engine::{Engine, InsertRejected, PrefillRequest, Sampler};
use crate::error::{EngineError, Result};
use crate::result_tokens::ResultTokens;
use crate::tokenizer::TokenizerParameters;

/// One recorded executor call, reduced to comparable arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Prefill {
        padded_len: usize,
        true_length: usize,
        existing_prefix_len: Option<usize>,
        has_sampler: bool,
        request_id: Option<Uuid>,
    },
    PrefillMultisampling {
        padded_len: usize,
        true_length: usize,
        has_sampler: bool,
        has_rng: bool,
        num_samples: usize,
    },
    Generate {
        has_sampler: bool,
    },
    Insert {
        slot: usize,
        request_id: Option<Uuid>,
    },
    BulkInsert {
        slots: Vec<usize>,
    },
    FreeResource {
        slot: usize,
    },
    LoadParams,
    InitDecodeState,
    GetTokenizer,
    BuildTokenizer {
        path: PathBuf,
    },
}

/// Forwards to an inner engine and records every call.
///
/// Operations named in [`RecordingEngine::unimplemented`] fail with
/// [`EngineError::Unimplemented`] after being recorded.
pub struct RecordingEngine<E> {
    inner: E,
    calls: Mutex<Vec<EngineCall>>,
    unimplemented: HashSet<&'static str>,
}

impl<E: Engine> RecordingEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            unimplemented: HashSet::new(),
        }
    }

    pub fn unimplemented(mut self, ops: &[&'static str]) -> Self {
        self.unimplemented.extend(ops.iter().copied());
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, op: &'static str, call: EngineCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.unimplemented.contains(op) {
            return Err(EngineError::Unimplemented(op));
        }
        Ok(())
    }
}

impl<E: Engine> Engine for RecordingEngine<E> {
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
        self.record(
            "prefill",
            EngineCall::Prefill {
                padded_len: request.padded_len(),
                true_length: request.true_length,
                existing_prefix_len: request.existing_prefix.map(|e| e.len()),
                has_sampler: request.sampler.is_some(),
                request_id: request.request_id,
            },
        )?;
        self.inner.prefill(params, request)
    }

    fn prefill_multisampling(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
        rng: Option<Self::RngKey>,
        num_samples: usize,
    ) -> Result<(Self::Prefix, ResultTokens)> {
        self.record(
            "prefill_multisampling",
            EngineCall::PrefillMultisampling {
                padded_len: request.padded_len(),
                true_length: request.true_length,
                has_sampler: request.sampler.is_some(),
                has_rng: rng.is_some(),
                num_samples,
            },
        )?;
        self.inner
            .prefill_multisampling(params, request, rng, num_samples)
    }

    fn generate(
        &self,
        params: &Self::Params,
        decode_state: Self::DecodeState,
        sampler: Option<&dyn Sampler>,
    ) -> Result<(Self::DecodeState, ResultTokens)> {
        self.record(
            "generate",
            EngineCall::Generate {
                has_sampler: sampler.is_some(),
            },
        )?;
        self.inner.generate(params, decode_state, sampler)
    }

    fn insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> Result<Self::DecodeState> {
        self.record("insert", EngineCall::Insert { slot, request_id })?;
        self.inner.insert(prefix, decode_state, slot, request_id)
    }

    fn try_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> std::result::Result<Self::DecodeState, InsertRejected<Self::DecodeState>> {
        if let Err(error) = self.record("insert", EngineCall::Insert { slot, request_id }) {
            return Err(InsertRejected {
                error,
                decode_state: Some(decode_state),
            });
        }
        self.inner.try_insert(prefix, decode_state, slot, request_id)
    }

    fn bulk_insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slots: &[usize],
    ) -> Result<Self::DecodeState> {
        self.record(
            "bulk_insert",
            EngineCall::BulkInsert {
                slots: slots.to_vec(),
            },
        )?;
        self.inner.bulk_insert(prefix, decode_state, slots)
    }

    fn free_resource(&self, slot: usize) -> Result<()> {
        self.record("free_resource", EngineCall::FreeResource { slot })?;
        self.inner.free_resource(slot)
    }

    fn load_params(&self) -> Result<Self::Params> {
        self.record("load_params", EngineCall::LoadParams)?;
        self.inner.load_params()
    }

    fn init_decode_state(&self) -> Result<Self::DecodeState> {
        self.record("init_decode_state", EngineCall::InitDecodeState)?;
        self.inner.init_decode_state()
    }

    fn get_prefix_destination_sharding(&self) -> Self::Sharding {
        self.inner.get_prefix_destination_sharding()
    }

    fn get_tokenizer(&self) -> TokenizerParameters {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EngineCall::GetTokenizer);
        self.inner.get_tokenizer()
    }

    fn build_tokenizer(&self, metadata: &TokenizerParameters) -> Result<Self::Tokenizer> {
        self.record(
            "build_tokenizer",
            EngineCall::BuildTokenizer {
                path: metadata.path.clone(),
            },
        )?;
        self.inner.build_tokenizer(metadata)
    }

    fn max_concurrent_decodes(&self) -> usize {
        self.inner.max_concurrent_decodes()
    }

    fn samples_per_slot(&self) -> usize {
        self.inner.samples_per_slot()
    }

    fn max_prefill_length(&self) -> usize {
        self.inner.max_prefill_length()
    }

    fn mesh(&self) -> &Self::Mesh {
        self.inner.mesh()
    }

    fn colocated_cpus(&self) -> Option<&[Self::CpuDevice]> {
        self.inner.colocated_cpus()
    }

    fn use_chunked_prefill(&self) -> bool {
        self.inner.use_chunked_prefill()
    }

    fn prefill_chunk_size(&self) -> usize {
        self.inner.prefill_chunk_size()
    }
}
