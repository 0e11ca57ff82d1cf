//! Next-token selection on the host.
//!
//! Executors hand a logits row to [`Candidates::from_logits`], which applies
//! temperature, top-k and top-p and keeps both the filtered weights (for
//! drawing) and the log-softmax of the scaled row (for reporting). A
//! [`SampleStream`] owns the RNG so repeated draws for one request are
//! reproducible from its seed.

use candle_core::{DType, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Logit divisor. Values near 0.0 select greedily.
    pub temperature: f32,
    /// Nucleus mass kept, in (0, 1]. 1.0 = disabled.
    pub top_p: f32,
    /// Candidates kept by rank. 0 = disabled.
    pub top_k: u32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

/// One selected token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Draw {
    pub token: u32,
    /// Log probability under the temperature-scaled, unfiltered row.
    pub log_prob: f32,
}

// ─── Candidate set ────────────────────────────────────────────────────────

/// Filtered next-token distribution for one logits row.
#[derive(Debug, Clone)]
pub struct Candidates {
    log_probs: Vec<f32>,
    /// Unnormalized; zero for filtered-out tokens.
    weights: Vec<f32>,
}

impl Candidates {
    pub fn from_logits(logits: &[f32], params: &SamplingParams) -> Self {
        if params.is_greedy() {
            let log_probs = log_softmax(logits);
            let mut weights = vec![0.0; logits.len()];
            if let Some(best) = weights.get_mut(argmax(logits) as usize) {
                *best = 1.0;
            }
            return Self { log_probs, weights };
        }

        let scaled: Vec<f32> = logits.iter().map(|&l| l / params.temperature).collect();
        let log_probs = log_softmax(&scaled);
        let mut weights: Vec<f32> = log_probs.iter().map(|lp| lp.exp()).collect();

        let by_rank = rank_descending(&weights);
        let k = params.top_k as usize;
        if k > 0 && k < weights.len() {
            for &i in &by_rank[k..] {
                weights[i] = 0.0;
            }
        }
        if params.top_p > 0.0 && params.top_p < 1.0 {
            let mut mass = 0.0f32;
            for (rank, &i) in by_rank.iter().enumerate() {
                if mass >= params.top_p {
                    for &j in &by_rank[rank..] {
                        weights[j] = 0.0;
                    }
                    break;
                }
                mass += weights[i];
            }
        }
        Self { log_probs, weights }
    }

    /// Tokens still eligible after filtering.
    pub fn support(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    pub fn log_prob(&self, token: u32) -> f32 {
        self.log_probs
            .get(token as usize)
            .copied()
            .unwrap_or(f32::NEG_INFINITY)
    }

    pub fn draw(&self, stream: &mut SampleStream) -> Draw {
        let total: f32 = self.weights.iter().sum();
        let mut target = stream.rng.gen::<f32>() * total;
        let mut token = None;
        for (i, &w) in self.weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            token = Some(i);
            if target < w {
                break;
            }
            target -= w;
        }
        // Rounding can leave `target` past the last weight; `token` then
        // holds the last eligible index.
        let token = token.unwrap_or(0) as u32;
        Draw {
            token,
            log_prob: self.log_prob(token),
        }
    }
}

/// Seeded RNG for the draws of one request.
pub struct SampleStream {
    rng: StdRng,
}

impl SampleStream {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// `n` independent draws from one logits row.
    pub fn draw_n(&mut self, logits: &[f32], params: &SamplingParams, n: usize) -> Vec<Draw> {
        let candidates = Candidates::from_logits(logits, params);
        (0..n).map(|_| candidates.draw(self)).collect()
    }
}

// ─── Batched helpers ──────────────────────────────────────────────────────

/// Argmax over the last dimension of a `[batch, vocab]` logits tensor.
pub fn greedy_tokens(logits: &Tensor) -> candle_core::Result<Tensor> {
    logits.argmax(D::Minus1)?.to_dtype(DType::U32)
}

/// Log probability of `tokens[i]` under row `i` of `logits`.
pub fn token_log_probs(logits: &Tensor, tokens: &[u32]) -> candle_core::Result<Vec<f32>> {
    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .iter()
        .zip(tokens)
        .map(|(row, &t)| {
            log_softmax(row)
                .get(t as usize)
                .copied()
                .unwrap_or(f32::NEG_INFINITY)
        })
        .collect())
}

/// Numerically stable log-softmax of one row.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_z = max + logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    logits.iter().map(|&x| x - log_z).collect()
}

fn rank_descending(weights: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
    order
}

fn argmax(values: &[f32]) -> u32 {
    rank_descending(values).first().map_or(0, |&i| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn draw_once(logits: &[f32], params: &SamplingParams, seed: u64) -> Draw {
        SampleStream::new(Some(seed)).draw_n(logits, params, 1)[0]
    }

    #[test]
    fn greedy_picks_highest_logit() {
        let draw = draw_once(&[1.0, 5.0, 3.0, 2.0], &SamplingParams::greedy(), 42);
        assert_eq!(draw.token, 1);
        assert!(draw.log_prob < 0.0 && draw.log_prob.is_finite());
    }

    #[test]
    fn same_seed_same_draws() {
        let logits = [0.3, 1.2, 0.9, 2.0, 0.1];
        let params = SamplingParams::default();
        let a = SampleStream::new(Some(123)).draw_n(&logits, &params, 16);
        let b = SampleStream::new(Some(123)).draw_n(&logits, &params, 16);
        assert_eq!(a, b);
    }

    #[test]
    fn top_k_keeps_best_ranks() {
        let params = SamplingParams {
            top_k: 2,
            ..Default::default()
        };
        let candidates = Candidates::from_logits(&[4.0, 0.0, 3.0, 1.0], &params);
        assert_eq!(candidates.support(), 2);
        let mut stream = SampleStream::new(Some(9));
        for _ in 0..50 {
            let token = candidates.draw(&mut stream).token;
            assert!(token == 0 || token == 2);
        }
    }

    #[test]
    fn top_p_keeps_dominant_token() {
        let params = SamplingParams {
            top_p: 0.5,
            ..Default::default()
        };
        let candidates = Candidates::from_logits(&[8.0, 0.0, 0.0, 0.0], &params);
        assert_eq!(candidates.support(), 1);
        assert_eq!(draw_once(&[8.0, 0.0, 0.0, 0.0], &params, 3).token, 0);
    }

    #[test]
    fn uniform_row_reaches_every_token() {
        let mut seen = [false; 8];
        for draw in SampleStream::new(Some(0)).draw_n(&[0.0; 8], &SamplingParams::default(), 400) {
            seen[draw.token as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn draw_reports_scaled_log_prob() {
        let params = SamplingParams {
            temperature: 2.0,
            ..Default::default()
        };
        let draw = draw_once(&[2.0, 4.0, 6.0], &params, 7);
        let expected = log_softmax(&[1.0, 2.0, 3.0])[draw.token as usize];
        assert!((draw.log_prob - expected).abs() < 1e-6);
    }

    #[test]
    fn log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lp[0] < lp[1] && lp[1] < lp[2]);
    }

    #[test]
    fn greedy_tokens_over_batch() {
        let logits = Tensor::new(&[[0.1f32, 0.9, 0.0], [2.0, 1.0, 3.0]], &Device::Cpu).unwrap();
        let tokens = greedy_tokens(&logits).unwrap();
        assert_eq!(tokens.dtype(), DType::U32);
        assert_eq!(tokens.to_vec1::<u32>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn token_log_probs_per_row() {
        let logits = Tensor::new(&[[0.0f32, 0.0], [5.0, 0.0]], &Device::Cpu).unwrap();
        let lp = token_log_probs(&logits, &[1, 0]).unwrap();
        assert!((lp[0] - 0.5f32.ln()).abs() < 1e-6);
        assert!(lp[1] > lp[0]);
    }
}
