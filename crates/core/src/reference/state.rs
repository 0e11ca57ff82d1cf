use candle_core::Tensor;
use uuid::Uuid;

use crate::result_tokens::SlotSample;

/// Seeded `[vocab, vocab]` F32 transition scores.
#[derive(Debug, Clone)]
pub struct ReferenceParams {
    pub transitions: Tensor,
}

impl ReferenceParams {
    pub fn vocab_size(&self) -> usize {
        self.transitions.dims().first().copied().unwrap_or(0)
    }
}

/// Output of a reference prefill.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePrefix {
    /// Every prompt token folded into the cache.
    pub context: Vec<u32>,
    /// One first token per sample.
    pub first_tokens: Vec<u32>,
    pub log_probs: Vec<f32>,
    pub request_id: Option<Uuid>,
}

/// One decode row of the batched state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeRow {
    pub active: bool,
    /// Prompt followed by every generated token.
    pub tokens: Vec<u32>,
    /// Tokens generated so far, including the one from prefill.
    pub generated: usize,
    pub request_id: Option<Uuid>,
    pub last_log_prob: f32,
}

impl DecodeRow {
    pub(crate) fn seeded(prefix: &ReferencePrefix, sample: usize) -> Self {
        let mut tokens = prefix.context.clone();
        tokens.push(prefix.first_tokens[sample]);
        Self {
            active: true,
            tokens,
            generated: 1,
            request_id: prefix.request_id,
            last_log_prob: prefix.log_probs[sample],
        }
    }

    pub fn last_token(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    /// Row as it appears in a result buffer; free rows read as zeros.
    pub(crate) fn to_sample(&self) -> SlotSample {
        if !self.active {
            return SlotSample::single(0, false, 0).with_log_prob(vec![0.0]);
        }
        SlotSample::single(self.last_token().unwrap_or(0), true, self.generated)
            .with_log_prob(vec![self.last_log_prob])
    }
}

/// Batched decode state: `max_concurrent_decodes * samples_per_slot` rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDecodeState {
    rows: Vec<DecodeRow>,
    samples_per_slot: usize,
}

impl ReferenceDecodeState {
    pub(crate) fn new(num_slots: usize, samples_per_slot: usize) -> Self {
        Self {
            rows: vec![DecodeRow::default(); num_slots * samples_per_slot],
            samples_per_slot,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.rows.len() / self.samples_per_slot
    }

    pub fn rows(&self) -> &[DecodeRow] {
        &self.rows
    }

    pub fn slot_rows(&self, slot: usize) -> &[DecodeRow] {
        let start = slot * self.samples_per_slot;
        &self.rows[start..start + self.samples_per_slot]
    }

    pub(crate) fn slot_rows_mut(&mut self, slot: usize) -> &mut [DecodeRow] {
        let start = slot * self.samples_per_slot;
        &mut self.rows[start..start + self.samples_per_slot]
    }

    pub fn is_active(&self, slot: usize) -> bool {
        self.slot_rows(slot).iter().any(|r| r.active)
    }

    pub fn active_slots(&self) -> Vec<usize> {
        (0..self.num_slots()).filter(|&s| self.is_active(s)).collect()
    }
}
