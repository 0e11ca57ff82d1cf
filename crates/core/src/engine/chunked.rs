use tracing::debug;

use super::{Engine, PrefillRequest};
use crate::error::{EngineError, Result};
use crate::prefix::ExistingPrefix;
use crate::result_tokens::ResultTokens;

/// Prefill a prompt in `prefill_chunk_size` pieces when the engine asks for it.
///
/// Each chunk's prefix is carried into the next call as an existing prefix.
/// Only the final chunk sees the request's sampler, and only its result is
/// returned. Engines without chunked prefill get a single `prefill` call.
pub fn prefill_chunked<E>(
    engine: &E,
    params: &E::Params,
    request: PrefillRequest<'_, E::Prefix>,
) -> Result<(E::Prefix, ResultTokens)>
where
    E: Engine + ?Sized,
{
    let chunk_size = engine.prefill_chunk_size();
    if !engine.use_chunked_prefill() || chunk_size == 0 || request.new_tokens() <= chunk_size {
        return engine.prefill(params, request);
    }

    let padded_len = request.padded_len();
    if padded_len < request.true_length {
        return Err(EngineError::TokensTooShort {
            padded_len,
            true_length: request.true_length,
        });
    }
    if let Some(existing) = request.existing_prefix {
        existing.check_prefix_of(request.padded_tokens, request.true_length)?;
    }

    let tokens = request.padded_tokens.flatten_all()?;
    let start = request.existing_prefix.map_or(0, |e| e.len());
    let mut carried: Option<ExistingPrefix<E::Prefix>> = None;
    let mut end = start;
    loop {
        end = (end + chunk_size).min(request.true_length);
        let is_last = end == request.true_length;
        let chunk_tokens = tokens.narrow(0, 0, end)?;
        let chunk = PrefillRequest {
            padded_tokens: &chunk_tokens,
            true_length: end,
            existing_prefix: carried.as_ref().or(request.existing_prefix),
            sampler: if is_last { request.sampler } else { None },
            request_id: request.request_id,
        };
        debug!(end, true_length = request.true_length, "prefill chunk");
        let (prefix, result) = engine.prefill(params, chunk)?;
        if is_last {
            return Ok((prefix, result));
        }
        carried = Some(ExistingPrefix::new(prefix, chunk_tokens));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::reference::ReferenceEngine;
    use crate::testing::{tiny_engine_config, EngineCall, RecordingEngine};
    use candle_core::{Device, Tensor};

    fn chunking_engine() -> RecordingEngine<ReferenceEngine> {
        let config = EngineConfig {
            use_chunked_prefill: true,
            prefill_chunk_size: 4,
            ..tiny_engine_config()
        };
        RecordingEngine::new(ReferenceEngine::new(config).unwrap())
    }

    fn prefill_calls(engine: &RecordingEngine<ReferenceEngine>) -> Vec<(usize, usize)> {
        engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Prefill {
                    padded_len,
                    true_length,
                    ..
                } => Some((padded_len, true_length)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn splits_prompt_into_growing_chunks() {
        let engine = chunking_engine();
        let params = engine.load_params().unwrap();
        let tokens = Tensor::new(&[1u32, 2, 3, 4, 5, 6, 7, 8, 9, 10, 0, 0], &Device::Cpu).unwrap();
        prefill_chunked(&engine, &params, PrefillRequest::new(&tokens, 10)).unwrap();
        assert_eq!(prefill_calls(&engine), vec![(4, 4), (8, 8), (10, 10)]);
    }

    #[test]
    fn short_padding_fails_before_any_chunk() {
        let engine = chunking_engine();
        let params = engine.load_params().unwrap();
        let tokens = Tensor::new(&[1u32, 2, 3, 4, 5], &Device::Cpu).unwrap();
        engine.clear();

        let err = prefill_chunked(&engine, &params, PrefillRequest::new(&tokens, 10))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::TokensTooShort {
                padded_len: 5,
                true_length: 10
            }
        ));
        assert!(prefill_calls(&engine).is_empty());
    }

    #[test]
    fn mismatched_prefix_fails_before_any_chunk() {
        let engine = chunking_engine();
        let params = engine.load_params().unwrap();
        let head = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        let (cached, _) = engine.prefill(&params, PrefillRequest::new(&head, 2)).unwrap();
        let existing = ExistingPrefix::new(cached, head);
        engine.clear();

        let tokens = Tensor::new(&[1u32, 9, 3, 4, 5, 6, 7, 8, 9, 10], &Device::Cpu).unwrap();
        let err = prefill_chunked(
            &engine,
            &params,
            PrefillRequest::new(&tokens, 10).with_existing_prefix(&existing),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::PrefixMismatch { position: 1 }));
        assert!(prefill_calls(&engine).is_empty());
    }
}
