//! Slot scheduler driving an executor through the facade.
//!
//! Pending requests are admitted into free slots (prefill, then insert),
//! every active slot advances one token per `generate`, and a slot is freed
//! as soon as its request has produced `max_new_tokens`. Executor calls run
//! on the blocking pool; the decode state is moved through each of them.
//! When the cache cannot hold a new prefix, the request waits at the head
//! of the queue until a running request frees its blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use jetstream_core::engine::prefill_chunked;
use jetstream_core::padding::{buckets_up_to, pad_tokens, DEFAULT_PREFILL_BUCKETS};
use jetstream_core::{Engine, InsertRejected, JetStreamEngine, PrefillRequest, ResultTokens};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunSettings;

// ─── Requests and results ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub prompt: Vec<u32>,
    /// Tokens to emit, counting the one from prefill.
    pub max_new_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub id: Uuid,
    pub prompt_len: usize,
    /// Slot the request decoded in.
    pub slot: usize,
    /// One token stream per sample.
    pub samples: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub completions: Vec<Completion>,
    /// Requests whose prefill failed; they never reached a slot.
    pub failed: Vec<Uuid>,
    pub prefills: usize,
    pub generate_steps: usize,
    pub tokens_generated: usize,
    /// Admissions put back in the queue because the cache was full.
    pub deferred: usize,
    pub elapsed_ms: u64,
    /// Stopped by a shutdown signal before the queue drained.
    pub interrupted: bool,
}

/// `num_requests` prompts of random ids in `1..vocab_size`.
pub fn synthetic_requests(settings: &RunSettings, vocab_size: usize, seed: u64) -> Vec<Request> {
    let mut rng = StdRng::seed_from_u64(seed);
    let high = vocab_size.max(2) as u32;
    (0..settings.num_requests)
        .map(|_| Request {
            id: Uuid::new_v4(),
            prompt: (0..settings.prompt_len).map(|_| rng.gen_range(1..high)).collect(),
            max_new_tokens: settings.max_new_tokens,
        })
        .collect()
}

// ─── Scheduler ────────────────────────────────────────────────────────────

struct ActiveSlot {
    request: Request,
    samples: Vec<Vec<u32>>,
}

impl ActiveSlot {
    fn absorb(&mut self, result: &ResultTokens, slot: usize) -> anyhow::Result<usize> {
        let rows = result.get_result_at_slot(slot)?.to_samples()?;
        let mut emitted = 0;
        for (sample, row) in self.samples.iter_mut().zip(&rows) {
            let before = sample.len();
            sample.extend(row.valid_tokens());
            emitted += sample.len() - before;
        }
        Ok(emitted)
    }

    fn is_done(&self) -> bool {
        self.samples
            .iter()
            .all(|s| s.len() >= self.request.max_new_tokens)
    }

    fn into_completion(self, slot: usize) -> Completion {
        let max = self.request.max_new_tokens;
        Completion {
            id: self.request.id,
            prompt_len: self.request.prompt.len(),
            slot,
            samples: self
                .samples
                .into_iter()
                .map(|mut s| {
                    s.truncate(max);
                    s
                })
                .collect(),
        }
    }
}

pub struct SlotScheduler<E: Engine> {
    engine: Arc<JetStreamEngine<E>>,
    params: Arc<E::Params>,
    buckets: Vec<usize>,
    pad_id: u32,
    seed: u64,
}

impl<E> SlotScheduler<E>
where
    E: Engine + 'static,
    E::Prefix: 'static,
    E::DecodeState: 'static,
    E::RngKey: From<u64> + Send + 'static,
{
    /// Pads prompts to the buckets recorded by warm-up, or to the default
    /// buckets the executor accepts when warm-up did not run.
    pub fn new(engine: Arc<JetStreamEngine<E>>, params: Arc<E::Params>, pad_id: u32) -> Self {
        let buckets = engine
            .prefill_buckets()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| buckets_up_to(&DEFAULT_PREFILL_BUCKETS, engine.max_prefill_length()));
        Self {
            engine,
            params,
            buckets,
            pad_id,
            seed: 0,
        }
    }

    /// Base seed for multi-sample prefill; request `i` uses `seed + i`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Serve `requests` until the queue drains or `stop` is raised.
    ///
    /// Slots still occupied when the loop ends, for any reason, are freed
    /// before returning.
    pub async fn run(&self, requests: Vec<Request>, stop: &AtomicBool) -> anyhow::Result<RunReport> {
        let start = Instant::now();
        let num_slots = self.engine.max_concurrent_decodes();
        let mut slots: Vec<Option<ActiveSlot>> = (0..num_slots).map(|_| None).collect();
        let mut report = RunReport::default();

        let served = self.serve(requests, stop, &mut slots, &mut report).await;
        let released = self.release_unfinished(&mut slots).await;
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        served?;
        released?;

        info!(
            completed = report.completions.len(),
            failed = report.failed.len(),
            deferred = report.deferred,
            steps = report.generate_steps,
            tokens = report.tokens_generated,
            elapsed_ms = report.elapsed_ms,
            interrupted = report.interrupted,
            "run finished"
        );
        Ok(report)
    }

    async fn serve(
        &self,
        requests: Vec<Request>,
        stop: &AtomicBool,
        slots: &mut [Option<ActiveSlot>],
        report: &mut RunReport,
    ) -> anyhow::Result<()> {
        let mut pending: VecDeque<Request> = requests.into();
        let mut state = self.engine.init_decode_state()?;
        let mut admitted = 0u64;

        loop {
            if stop.load(Ordering::Acquire) {
                report.interrupted = true;
                return Ok(());
            }

            while let Some(slot) = slots.iter().position(Option::is_none) {
                let Some(request) = pending.pop_front() else {
                    break;
                };
                let rng = self.seed.wrapping_add(admitted);
                admitted += 1;
                let (prefix, first) = match self.prefill(&request, rng).await {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(request_id = %request.id, error = %e, "prefill failed");
                        report.failed.push(request.id);
                        continue;
                    }
                };
                report.prefills += 1;

                match self.insert(prefix, state, slot, request.id).await? {
                    Ok(next) => state = next,
                    Err(InsertRejected {
                        error,
                        decode_state: Some(returned),
                    }) => {
                        state = returned;
                        if error.is_out_of_blocks() && slots.iter().any(Option::is_some) {
                            // Retried once running requests release their blocks.
                            debug!(slot, request_id = %request.id, "cache full, deferring admission");
                            report.deferred += 1;
                            pending.push_front(request);
                            break;
                        }
                        warn!(request_id = %request.id, error = %error, "insert failed");
                        report.failed.push(request.id);
                        continue;
                    }
                    Err(rejected) => return Err(rejected.error.into()),
                }

                let mut active = ActiveSlot {
                    samples: vec![Vec::new(); self.engine.samples_per_slot()],
                    request,
                };
                // the prefill buffer holds a single slot
                report.tokens_generated += active.absorb(&first.to_host()?, 0)?;
                debug!(slot, request_id = %active.request.id, "admitted");
                slots[slot] = Some(active);
                self.retire_finished(slots, report).await?;
            }

            if slots.iter().all(Option::is_none) {
                return Ok(());
            }

            let engine = Arc::clone(&self.engine);
            let params = Arc::clone(&self.params);
            let (next, result) =
                tokio::task::spawn_blocking(move || -> jetstream_core::Result<_> {
                    let (next, result) = engine.generate(&*params, state, None)?;
                    let transfer = result.copy_to_host_async();
                    Ok((next, result.complete_host_copy(transfer)?))
                })
                .await??;
            state = next;
            report.generate_steps += 1;

            for (slot, active) in slots.iter_mut().enumerate() {
                if let Some(active) = active {
                    report.tokens_generated += active.absorb(&result, slot)?;
                }
            }
            self.retire_finished(slots, report).await?;
        }
    }

    async fn prefill(&self, request: &Request, rng: u64) -> anyhow::Result<(E::Prefix, ResultTokens)> {
        let engine = Arc::clone(&self.engine);
        let params = Arc::clone(&self.params);
        let prompt = request.prompt.clone();
        let buckets = self.buckets.clone();
        let pad_id = self.pad_id;
        let request_id = request.id;

        let out = tokio::task::spawn_blocking(move || -> jetstream_core::Result<_> {
            let (tokens, true_length) = pad_tokens(&prompt, pad_id, &buckets, &Device::Cpu)?;
            let prefill = PrefillRequest::new(&tokens, true_length).with_request_id(request_id);
            let samples = engine.samples_per_slot();
            if samples > 1 {
                engine.prefill_multisampling(&*params, prefill, Some(E::RngKey::from(rng)), samples)
            } else {
                prefill_chunked(&*engine, &*params, prefill)
            }
        })
        .await??;
        Ok(out)
    }

    /// Outer error: the blocking task died. Inner error: the engine refused.
    async fn insert(
        &self,
        prefix: E::Prefix,
        state: E::DecodeState,
        slot: usize,
        request_id: Uuid,
    ) -> anyhow::Result<Result<E::DecodeState, InsertRejected<E::DecodeState>>> {
        let engine = Arc::clone(&self.engine);
        Ok(tokio::task::spawn_blocking(move || {
            engine.try_insert(prefix, state, slot, Some(request_id))
        })
        .await?)
    }

    async fn free(&self, slot: usize) -> anyhow::Result<()> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.free_resource(slot)).await??;
        Ok(())
    }

    async fn retire_finished(
        &self,
        slots: &mut [Option<ActiveSlot>],
        report: &mut RunReport,
    ) -> anyhow::Result<()> {
        for slot in 0..slots.len() {
            if !slots[slot].as_ref().is_some_and(ActiveSlot::is_done) {
                continue;
            }
            if let Some(active) = slots[slot].take() {
                self.free(slot).await?;
                debug!(slot, request_id = %active.request.id, "finished");
                report.completions.push(active.into_completion(slot));
            }
        }
        Ok(())
    }

    /// Free every occupied slot. Keeps going past a failed free and returns
    /// the first error.
    async fn release_unfinished(&self, slots: &mut [Option<ActiveSlot>]) -> anyhow::Result<()> {
        let mut first_error = None;
        for slot in 0..slots.len() {
            let Some(active) = slots[slot].take() else {
                continue;
            };
            warn!(slot, request_id = %active.request.id, "dropping unfinished request");
            if let Err(e) = self.free(slot).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
