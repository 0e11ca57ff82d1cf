//! Prefill length bucketing.
//!
//! Prompts are right-padded to a small set of lengths so executors see a
//! bounded number of distinct prefill shapes.

use candle_core::{Device, Tensor};

use crate::error::{EngineError, Result};

/// Powers of two from 16 to 32768.
pub const DEFAULT_PREFILL_BUCKETS: [usize; 12] = [
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// Smallest bucket that holds `length`, or `length` itself if none does.
pub fn take_nearest_length(buckets: &[usize], length: usize) -> usize {
    buckets
        .iter()
        .copied()
        .filter(|&b| b >= length)
        .min()
        .unwrap_or(length)
}

/// Buckets an executor can accept, ascending and deduplicated.
pub fn buckets_up_to(buckets: &[usize], max_prefill_length: usize) -> Vec<usize> {
    let mut kept: Vec<usize> = buckets
        .iter()
        .copied()
        .filter(|&b| b > 0 && b <= max_prefill_length)
        .collect();
    kept.sort_unstable();
    kept.dedup();
    kept
}

/// Right-pad `tokens` with `pad_id` to the nearest bucket.
///
/// Returns the `[padded_len]` U32 tensor and the true length.
pub fn pad_tokens(
    tokens: &[u32],
    pad_id: u32,
    buckets: &[usize],
    device: &Device,
) -> Result<(Tensor, usize)> {
    if tokens.is_empty() {
        return Err(EngineError::EmptyPrompt);
    }
    let true_length = tokens.len();
    let padded_len = take_nearest_length(buckets, true_length);
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(tokens);
    padded.resize(padded_len, pad_id);
    Ok((Tensor::from_vec(padded, padded_len, device)?, true_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_length_rounds_up() {
        assert_eq!(take_nearest_length(&DEFAULT_PREFILL_BUCKETS, 1), 16);
        assert_eq!(take_nearest_length(&DEFAULT_PREFILL_BUCKETS, 16), 16);
        assert_eq!(take_nearest_length(&DEFAULT_PREFILL_BUCKETS, 17), 32);
        assert_eq!(take_nearest_length(&[8, 4], 3), 4);
    }

    #[test]
    fn overlong_length_is_kept() {
        assert_eq!(take_nearest_length(&DEFAULT_PREFILL_BUCKETS, 40_000), 40_000);
        assert_eq!(take_nearest_length(&[], 5), 5);
    }

    #[test]
    fn buckets_are_capped_and_sorted() {
        assert_eq!(buckets_up_to(&[64, 16, 0, 16, 2048], 1024), vec![16, 64]);
        assert_eq!(buckets_up_to(&DEFAULT_PREFILL_BUCKETS, 10), Vec::<usize>::new());
    }

    #[test]
    fn pad_tokens_right_pads() {
        let (padded, true_length) = pad_tokens(&[3, 4, 5], 0, &[4, 8], &Device::Cpu).unwrap();
        assert_eq!(true_length, 3);
        assert_eq!(padded.to_vec1::<u32>().unwrap(), vec![3, 4, 5, 0]);
    }

    #[test]
    fn pad_tokens_rejects_empty_prompt() {
        assert!(matches!(
            pad_tokens(&[], 0, &DEFAULT_PREFILL_BUCKETS, &Device::Cpu),
            Err(EngineError::EmptyPrompt)
        ));
    }
}
