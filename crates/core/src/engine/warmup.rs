//! Warm-up before the scheduler starts serving.
//!
//! For each prefill bucket the engine accepts, warm-up runs one dummy
//! request through the whole slot lifecycle (prefill, insert, generate,
//! free_resource) on a scratch decode state. Executors that compile or
//! cache per-shape kernels see every prefill shape once before real traffic.
//!
//! Warm-up inserts into [`WarmupConfig::slot`] and frees it afterwards, so
//! it must run while that slot is free (normally before the first insert).

use std::time::Instant;

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use super::{Engine, JetStreamEngine, PrefillRequest};
use crate::error::Result;
use crate::padding::{buckets_up_to, DEFAULT_PREFILL_BUCKETS};

// ─── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Candidate prefill lengths; those above `max_prefill_length` are skipped.
    pub prefill_buckets: Vec<usize>,
    /// Generate steps per bucket.
    pub decode_steps: usize,
    /// Scratch slot used for the dummy insert.
    pub slot: usize,
    /// Token id filling the dummy prompts.
    pub pad_id: u32,
    /// Device the dummy prompts are built on.
    pub device: Device,
    /// Whether to log each bucket at info level.
    pub show_progress: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            prefill_buckets: DEFAULT_PREFILL_BUCKETS.to_vec(),
            decode_steps: 1,
            slot: 0,
            pad_id: 0,
            device: Device::Cpu,
            show_progress: true,
        }
    }
}

impl WarmupConfig {
    pub fn needs_warmup(&self) -> bool {
        !self.prefill_buckets.is_empty()
    }

    pub fn with_buckets(mut self, buckets: Vec<usize>) -> Self {
        self.prefill_buckets = buckets;
        self
    }
}

// ─── Statistics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WarmupStats {
    /// Buckets that completed the full lifecycle.
    pub warmed_buckets: Vec<usize>,
    /// Total generate calls issued.
    pub generate_steps: usize,
    pub total_time_ms: u64,
    /// One message per failed bucket.
    pub errors: Vec<String>,
}

impl WarmupStats {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

// ─── Facade warm-up ───────────────────────────────────────────────────────

impl<E: Engine> JetStreamEngine<E> {
    /// Exercise every accepted prefill bucket once.
    ///
    /// Records the warmed buckets and marks the facade warm when no bucket
    /// failed. Failures are collected in the returned stats, not raised.
    pub fn warmup(&self, params: &E::Params, config: &WarmupConfig) -> WarmupStats {
        if !config.needs_warmup() {
            return WarmupStats::skipped();
        }
        let start = Instant::now();
        let buckets = buckets_up_to(&config.prefill_buckets, self.max_prefill_length());
        let mut stats = WarmupStats::default();

        for bucket in buckets {
            match self.warm_bucket(params, bucket, config) {
                Ok(steps) => {
                    stats.generate_steps += steps;
                    stats.warmed_buckets.push(bucket);
                    if config.show_progress {
                        info!(bucket, "warmed prefill bucket");
                    } else {
                        debug!(bucket, "warmed prefill bucket");
                    }
                }
                Err(e) => {
                    warn!(bucket, error = %e, "warm-up failed");
                    stats.errors.push(format!("bucket {bucket}: {e}"));
                }
            }
        }

        stats.total_time_ms = start.elapsed().as_millis() as u64;
        self.set_prefill_buckets(Some(stats.warmed_buckets.clone()));
        self.set_warm(stats.is_success());
        info!(
            buckets = stats.warmed_buckets.len(),
            failed = stats.errors.len(),
            elapsed_ms = stats.total_time_ms,
            "warm-up finished"
        );
        stats
    }

    fn warm_bucket(&self, params: &E::Params, bucket: usize, config: &WarmupConfig) -> Result<usize> {
        let tokens = Tensor::full(config.pad_id, bucket, &config.device)?;
        let (prefix, _) = self.prefill(params, PrefillRequest::new(&tokens, bucket))?;

        let state = self.init_decode_state()?;
        let lifecycle = self.insert(prefix, state, config.slot, None).and_then(|mut state| {
            for _ in 0..config.decode_steps {
                let (next, _) = self.generate(params, state, None)?;
                state = next;
            }
            Ok(config.decode_steps)
        });
        // Release the scratch slot even when a step failed.
        self.free_resource(config.slot)?;
        lifecycle
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
