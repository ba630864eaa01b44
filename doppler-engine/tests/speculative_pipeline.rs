//! Speculative decoding over real pipelines (draft = main).

mod common;

use std::sync::Arc;

use doppler_engine::sampling::{LogitsSampler, SamplerConfig};
use doppler_engine::speculative::{speculative_step, SpeculativeStats};
use doppler_engine::{GenerationOptions, InferenceEngine, ModelProvider, Pipeline};
use doppler_runtime::Runtime;

fn greedy_sampler() -> LogitsSampler {
    LogitsSampler::new(
        SamplerConfig {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
        },
        Some(0),
    )
}

#[test]
fn test_accept_all_advances_cache_by_depth_plus_one() {
    let runtime = Arc::new(Runtime::cpu());
    let mut main = Pipeline::load(
        runtime.clone(),
        &common::tiny_manifest(1),
        common::tiny_shards(1),
    )
    .unwrap();
    let mut draft = Pipeline::load(
        runtime,
        &common::tiny_manifest(1),
        common::tiny_shards(1),
    )
    .unwrap();

    // Prefix [5]: prefill both models, then draft 3 ahead.
    let prefix = [5u32];
    main.forward(&prefix, 0).unwrap();
    draft.forward(&prefix, 0).unwrap();
    assert_eq!(main.cache_len(), 1);

    let mut sampler = greedy_sampler();
    let mut stats = SpeculativeStats::default();
    let tokens =
        speculative_step(&mut main, &mut draft, 5, 3, &mut sampler, &mut stats).unwrap();

    // Identical models under greedy sampling accept every draft.
    assert_eq!(tokens, vec![5, 5, 5, 5]);
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.rejected, 0);

    // 3 accepted + 1 sampled positions beyond the prefix.
    assert_eq!(main.cache_len(), 5);
    assert_eq!(draft.cache_len(), 5);
}

#[tokio::test]
async fn test_engine_speculative_matches_plain_generation() {
    let runtime = Arc::new(Runtime::cpu());
    let engine = InferenceEngine::load_model(
        runtime,
        &common::speculative_manifest(1),
        common::speculative_shards(1),
    )
    .unwrap();

    let mut options = GenerationOptions::default();
    options.max_tokens = 6;
    options.temperature = 0.0;
    options.top_p = 1.0;
    options.repetition_penalty = 1.0;
    options.use_speculative = true;
    options.speculative_depth = 3;
    options.seed = Some(0);

    let text = engine
        .generate("bcd", options.clone())
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "dddddd");

    let stats = engine.stats().unwrap();
    let spec = stats.speculative.expect("speculative stats recorded");
    assert!(spec.drafted >= 3);
    assert_eq!(spec.rejected, 0);
    assert!((spec.average_accept_rate() - 1.0).abs() < 1e-9);

    // Plain decoding of the same model emits the same stream.
    options.use_speculative = false;
    let plain = engine
        .generate("bcd", options)
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(plain, text);
}
