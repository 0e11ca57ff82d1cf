//! Deterministic CPU executor.
//!
//! Scores the next token from a seeded `[vocab, vocab]` transition table
//! indexed by the last token of each sequence. There is no model math worth
//! the name here; the point is to honor every part of the [`Engine`]
//! contract (slot rows, multi-sampling, log probabilities, paged block
//! accounting, chunked prefill) so schedulers and the facade can be
//! exercised without an accelerator.

mod state;

pub use state::{DecodeRow, ReferenceDecodeState, ReferenceParams, ReferencePrefix};

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig};
use crate::engine::{
    validate_slot, validate_slots, Engine, InsertRejected, PrefillRequest, Sampler,
};
use crate::error::{EngineError, Result};
use crate::kv_cache::SlotBlocks;
use crate::mesh::{DeviceMesh, Sharding};
use crate::result_tokens::{ResultTokens, SlotSample};
use crate::sampling::{self, SampleStream};
use crate::tokenizer::{TokenizerParameters, TokenizerWrapper};

pub struct ReferenceEngine {
    config: EngineConfig,
    cache: SlotBlocks,
    mesh: DeviceMesh,
    cpus: Vec<Device>,
}

impl ReferenceEngine {
    pub fn new(config: EngineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let cache = SlotBlocks::new(
            config.cache_config(),
            config.max_concurrent_decodes,
            config.samples_per_slot,
        );
        Ok(Self {
            config,
            cache,
            mesh: DeviceMesh::cpu(),
            cpus: vec![Device::Cpu],
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Paged block accounting shared by every slot.
    pub fn cache(&self) -> &SlotBlocks {
        &self.cache
    }

    /// `[n, vocab]` scores for the given last tokens.
    fn logits(&self, params: &ReferenceParams, last_tokens: &[u32]) -> Result<Tensor> {
        let vocab = params.vocab_size();
        if let Some(&t) = last_tokens.iter().find(|&&t| t as usize >= vocab) {
            return Err(EngineError::Executor(
                format!("token {t} outside vocabulary of {vocab}").into(),
            ));
        }
        let ids = Tensor::new(last_tokens, params.transitions.device())?;
        Ok(params.transitions.index_select(&ids, 0)?)
    }

    fn pick_tokens(&self, logits: &Tensor, sampler: Option<&dyn Sampler>) -> Result<Vec<u32>> {
        let rows = logits.dim(0)?;
        let tokens = match sampler {
            Some(s) => s.sample(logits)?,
            None => sampling::greedy_tokens(logits)?,
        };
        let tokens = tokens.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if tokens.len() != rows {
            return Err(EngineError::InvalidLayout(format!(
                "sampler returned {} tokens for {rows} rows",
                tokens.len()
            )));
        }
        Ok(tokens)
    }

    /// Host context for a request: existing cache tokens, then the new ones.
    fn context(&self, request: &PrefillRequest<'_, ReferencePrefix>) -> Result<Vec<u32>> {
        let tokens = request
            .padded_tokens
            .flatten_all()?
            .narrow(0, 0, request.true_length)?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        Ok(match request.existing_prefix {
            Some(existing) => {
                let mut context = existing.cache.context.clone();
                context.extend_from_slice(&tokens[existing.len()..]);
                context
            }
            None => tokens,
        })
    }

    fn validate_prefill(&self, request: &PrefillRequest<'_, ReferencePrefix>) -> Result<Vec<u32>> {
        request.validate(self.config.max_prefill_length)?;
        self.context(request)
    }

    /// Write `prefix` into the rows of `slot` under that slot's lock.
    ///
    /// `state` is written only after every row's blocks are reserved.
    fn insert_rows(
        &self,
        prefix: &ReferencePrefix,
        state: &mut ReferenceDecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> Result<()> {
        let samples_per_slot = self.config.samples_per_slot;
        let found = prefix.first_tokens.len();
        if found != 1 && found != samples_per_slot {
            return Err(EngineError::SampleCountMismatch {
                expected: samples_per_slot,
                found,
            });
        }

        let mut guard = self.cache.lock_slot(slot)?;
        if (0..guard.num_rows()).any(|row| guard.is_live(row)) {
            warn!(slot, "insert into slot whose resources were never freed; recycling");
            guard.release_all()?;
        }
        let seq_len = prefix.context.len() + 1;
        for row in 0..samples_per_slot {
            if let Err(e) = guard.reserve(row, seq_len) {
                guard.release_all()?;
                return Err(e.into());
            }
        }

        for (row, decode_row) in state.slot_rows_mut(slot).iter_mut().enumerate() {
            let sample = if found == 1 { 0 } else { row };
            *decode_row = DecodeRow::seeded(prefix, sample);
            if request_id.is_some() {
                decode_row.request_id = request_id;
            }
        }
        debug!(slot, seq_len, "inserted prefix");
        Ok(())
    }

    fn result_for(&self, state: &ReferenceDecodeState) -> Result<ResultTokens> {
        let samples: Vec<SlotSample> = state.rows().iter().map(DecodeRow::to_sample).collect();
        ResultTokens::from_samples(&samples, self.config.samples_per_slot, &Device::Cpu)
    }
}

impl Engine for ReferenceEngine {
    type Params = ReferenceParams;
    type Prefix = ReferencePrefix;
    type DecodeState = ReferenceDecodeState;
    type Tokenizer = TokenizerWrapper;
    type Mesh = DeviceMesh;
    type CpuDevice = Device;
    type RngKey = u64;
    type Sharding = Sharding;

    fn prefill(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
    ) -> Result<(Self::Prefix, ResultTokens)> {
        let context = self.validate_prefill(&request)?;
        let last = *context.last().ok_or(EngineError::EmptyPrompt)?;
        let logits = self.logits(params, &[last])?;
        let tokens = self.pick_tokens(&logits, request.sampler)?;
        let log_probs = sampling::token_log_probs(&logits, &tokens)?;

        let result = ResultTokens::from_samples(
            &[SlotSample::single(tokens[0], true, 1).with_log_prob(log_probs.clone())],
            1,
            &Device::Cpu,
        )?;
        debug!(
            context_len = context.len(),
            token = tokens[0],
            request_id = ?request.request_id,
            "prefill"
        );
        let prefix = ReferencePrefix {
            context,
            first_tokens: tokens,
            log_probs,
            request_id: request.request_id,
        };
        Ok((prefix, result))
    }

    fn prefill_multisampling(
        &self,
        params: &Self::Params,
        request: PrefillRequest<'_, Self::Prefix>,
        rng: Option<Self::RngKey>,
        num_samples: usize,
    ) -> Result<(Self::Prefix, ResultTokens)> {
        if num_samples == 0 {
            return Err(EngineError::InvalidLayout(
                "num_samples must be at least 1".into(),
            ));
        }
        let context = self.validate_prefill(&request)?;
        let last = *context.last().ok_or(EngineError::EmptyPrompt)?;
        let logits = self.logits(params, &[last])?;

        let (tokens, log_probs) = match request.sampler {
            Some(sampler) => {
                let batch = logits.broadcast_as((num_samples, params.vocab_size()))?.contiguous()?;
                let tokens = self.pick_tokens(&batch, Some(sampler))?;
                let log_probs = sampling::token_log_probs(&batch, &tokens)?;
                (tokens, log_probs)
            }
            None => {
                let row = logits.squeeze(0)?.to_vec1::<f32>()?;
                let sampling_params = self.config.sampling_params(rng.or(Some(self.config.seed)));
                SampleStream::new(sampling_params.seed)
                    .draw_n(&row, &sampling_params, num_samples)
                    .into_iter()
                    .map(|d| (d.token, d.log_prob))
                    .unzip()
            }
        };

        let samples: Vec<SlotSample> = tokens
            .iter()
            .zip(&log_probs)
            .map(|(&t, &lp)| SlotSample::single(t, true, 1).with_log_prob(vec![lp]))
            .collect();
        let result = ResultTokens::from_samples(&samples, num_samples, &Device::Cpu)?;
        debug!(num_samples, context_len = context.len(), "multi-sample prefill");
        let prefix = ReferencePrefix {
            context,
            first_tokens: tokens,
            log_probs,
            request_id: request.request_id,
        };
        Ok((prefix, result))
    }

    fn generate(
        &self,
        params: &Self::Params,
        mut decode_state: Self::DecodeState,
        sampler: Option<&dyn Sampler>,
    ) -> Result<(Self::DecodeState, ResultTokens)> {
        let samples_per_slot = self.config.samples_per_slot;

        // Rows whose slot was freed since the last step stop here.
        let mut stepping = Vec::new();
        for slot in decode_state.active_slots() {
            let guard = self.cache.lock_slot(slot)?;
            for (row, decode_row) in decode_state.slot_rows_mut(slot).iter_mut().enumerate() {
                if !decode_row.active {
                    continue;
                }
                if guard.is_live(row) {
                    stepping.push((slot, row));
                } else {
                    *decode_row = DecodeRow::default();
                }
            }
        }

        if !stepping.is_empty() {
            let last_tokens: Vec<u32> = stepping
                .iter()
                .map(|&(slot, row)| {
                    decode_state.slot_rows(slot)[row]
                        .last_token()
                        .unwrap_or(0)
                })
                .collect();
            let logits = self.logits(params, &last_tokens)?;
            let tokens = self.pick_tokens(&logits, sampler)?;
            let log_probs = sampling::token_log_probs(&logits, &tokens)?;

            for (i, &(slot, row)) in stepping.iter().enumerate() {
                self.cache.lock_slot(slot)?.reserve(row, 1)?;
                let decode_row = &mut decode_state.slot_rows_mut(slot)[row];
                decode_row.tokens.push(tokens[i]);
                decode_row.generated += 1;
                decode_row.last_log_prob = log_probs[i];
            }
        }

        debug!(
            rows = stepping.len(),
            slots = stepping.len() / samples_per_slot.max(1),
            "generate step"
        );
        let result = self.result_for(&decode_state)?;
        Ok((decode_state, result))
    }

    fn insert(
        &self,
        prefix: Self::Prefix,
        decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> Result<Self::DecodeState> {
        Ok(self.try_insert(prefix, decode_state, slot, request_id)?)
    }

    fn try_insert(
        &self,
        prefix: Self::Prefix,
        mut decode_state: Self::DecodeState,
        slot: usize,
        request_id: Option<Uuid>,
    ) -> std::result::Result<Self::DecodeState, InsertRejected<Self::DecodeState>> {
        let inserted = validate_slot(slot, self.config.max_concurrent_decodes)
            .and_then(|()| self.insert_rows(&prefix, &mut decode_state, slot, request_id));
        match inserted {
            Ok(()) => Ok(decode_state),
            Err(error) => Err(InsertRejected {
                error,
                decode_state: Some(decode_state),
            }),
        }
    }

    fn bulk_insert(
        &self,
        prefix: Self::Prefix,
        mut decode_state: Self::DecodeState,
        slots: &[usize],
    ) -> Result<Self::DecodeState> {
        validate_slots(slots, self.config.max_concurrent_decodes)?;
        for &slot in slots {
            self.insert_rows(&prefix, &mut decode_state, slot, None)?;
        }
        Ok(decode_state)
    }

    fn free_resource(&self, slot: usize) -> Result<()> {
        validate_slot(slot, self.config.max_concurrent_decodes)?;
        let freed = self.cache.free_slot(slot)?;
        debug!(slot, freed, "freed slot resources");
        Ok(())
    }

    fn load_params(&self) -> Result<Self::Params> {
        let vocab = self.config.vocab_size;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let scores: Vec<f32> = (0..vocab * vocab).map(|_| rng.gen::<f32>() * 4.0).collect();
        let transitions = Tensor::from_vec(scores, (vocab, vocab), &Device::Cpu)?;
        info!(vocab, seed = self.config.seed, "loaded reference params");
        Ok(ReferenceParams { transitions })
    }

    fn init_decode_state(&self) -> Result<Self::DecodeState> {
        Ok(ReferenceDecodeState::new(
            self.config.max_concurrent_decodes,
            self.config.samples_per_slot,
        ))
    }

    fn get_prefix_destination_sharding(&self) -> Self::Sharding {
        Sharding::Replicated
    }

    fn get_tokenizer(&self) -> TokenizerParameters {
        self.config.tokenizer.clone()
    }

    fn max_concurrent_decodes(&self) -> usize {
        self.config.max_concurrent_decodes
    }

    fn samples_per_slot(&self) -> usize {
        self.config.samples_per_slot
    }

    fn max_prefill_length(&self) -> usize {
        self.config.max_prefill_length
    }

    fn mesh(&self) -> &Self::Mesh {
        &self.mesh
    }

    fn colocated_cpus(&self) -> Option<&[Self::CpuDevice]> {
        Some(&self.cpus)
    }

    fn use_chunked_prefill(&self) -> bool {
        self.config.use_chunked_prefill
    }

    fn prefill_chunk_size(&self) -> usize {
        self.config.prefill_chunk_size
    }
}
