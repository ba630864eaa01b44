//! End-to-end generation through the engine on a tiny dense model.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use doppler_engine::{CancellationSignal, EngineError, GenerationOptions, InferenceEngine};
use doppler_runtime::Runtime;

fn greedy_options(max_tokens: usize) -> GenerationOptions {
    let mut options = GenerationOptions::default();
    options.max_tokens = max_tokens;
    options.temperature = 0.0;
    options.top_p = 1.0;
    options.repetition_penalty = 1.0;
    options.seed = Some(0);
    options
}

fn load_engine(num_layers: usize) -> InferenceEngine {
    let runtime = Arc::new(Runtime::cpu());
    InferenceEngine::load_model(
        runtime,
        &common::tiny_manifest(num_layers),
        common::tiny_shards(num_layers),
    )
    .unwrap()
}

#[tokio::test]
async fn test_copy_model_repeats_last_prompt_token() {
    common::init_tracing();
    let engine = load_engine(2);

    // Prompt "bcd" = ids [1, 2, 3]; the identity model's logits always peak
    // at the last seen token, so greedy decoding emits "d" forever.
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let stream = engine
        .generate_with_observer(
            "bcd",
            greedy_options(3),
            Some(Arc::new(move |id| sink.lock().push(id))),
        )
        .unwrap();

    let text = stream.collect_text().await;
    assert_eq!(text, "ddd");
    assert_eq!(*observed.lock(), vec![3, 3, 3]);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.prompt_tokens, 3);
    assert_eq!(stats.generated_tokens, 3);
    assert!(stats.speculative.is_none());
}

#[tokio::test]
async fn test_generation_is_reproducible_after_reset() {
    let engine = load_engine(1);

    // Sampled (non-greedy) run with a fixed seed.
    let mut options = GenerationOptions::default();
    options.max_tokens = 8;
    options.temperature = 1.0;
    options.top_p = 1.0;
    options.top_k = 0;
    options.repetition_penalty = 1.0;
    options.seed = Some(1234);

    let first = engine
        .generate("abc", options.clone())
        .unwrap()
        .collect_text()
        .await;
    engine.reset().unwrap();
    let second = engine
        .generate("abc", options)
        .unwrap()
        .collect_text()
        .await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
}

#[tokio::test]
async fn test_stop_sequence_ends_stream() {
    let engine = load_engine(1);
    let mut options = greedy_options(32);
    options.stop_sequences = vec!["dd".to_string()];

    let text = engine
        .generate("bcd", options)
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "dd");
}

#[tokio::test]
async fn test_stop_token_id_ends_stream() {
    let mut json = common::manifest_json(1);
    json["stop_token_ids"] = serde_json::json!([3]);
    let manifest = serde_json::from_value(json).unwrap();
    let engine = InferenceEngine::load_model(
        Arc::new(Runtime::cpu()),
        &manifest,
        common::tiny_shards(1),
    )
    .unwrap();

    let text = engine
        .generate("bcd", greedy_options(32))
        .unwrap()
        .collect_text()
        .await;
    // The stop token itself is emitted, then the stream ends.
    assert_eq!(text, "d");
}

#[tokio::test]
async fn test_cancellation_before_start_yields_single_token() {
    let engine = load_engine(1);
    let signal = CancellationSignal::new();
    signal.cancel();

    let mut options = greedy_options(64);
    options.cancellation = signal;

    let text = engine
        .generate("bcd", options)
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "d");
}

#[tokio::test]
async fn test_cancellation_mid_stream_stops_promptly() {
    let engine = load_engine(1);
    let signal = CancellationSignal::new();
    let mut options = greedy_options(500);
    options.cancellation = signal.clone();

    let mut stream = engine.generate("bcd", options).unwrap();
    let mut received = 0usize;
    while let Some(_fragment) = stream.next().await {
        received += 1;
        if received == 2 {
            signal.cancel();
        }
    }
    // The worker may have a channel's worth of tokens in flight, but must
    // stop far short of max_tokens.
    assert!(received >= 2);
    assert!(received < 100, "cancellation ignored: {received} tokens");
}

#[tokio::test]
async fn test_second_generate_while_busy_is_rejected() {
    let engine = load_engine(1);

    // Don't consume the stream: the worker fills the channel and stays busy.
    let stream = engine.generate("bcd", greedy_options(200)).unwrap();
    assert!(engine.is_generating());

    let err = engine.generate("bcd", greedy_options(4)).unwrap_err();
    assert!(matches!(err, EngineError::AlreadyGenerating));

    // Draining the first stream lets the engine go idle again.
    let _ = stream.collect_text().await;
    let text = engine
        .generate("bcd", greedy_options(2))
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "dd");
}

#[tokio::test]
async fn test_empty_prompt_closes_stream_without_tokens() {
    let engine = load_engine(1);
    let text = engine
        .generate("", greedy_options(4))
        .unwrap()
        .collect_text()
        .await;
    assert!(text.is_empty());
}

#[tokio::test]
async fn test_sliding_window_model_generates_past_the_window() {
    let mut json = common::manifest_json(2);
    json["sliding_window"] = serde_json::json!(4);
    let manifest = serde_json::from_value(json).unwrap();
    let engine = InferenceEngine::load_model(
        Arc::new(Runtime::cpu()),
        &manifest,
        common::tiny_shards(2),
    )
    .unwrap();

    // 8 generated tokens take the ring well past one wrap.
    let text = engine
        .generate("bcd", greedy_options(8))
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "dddddddd");
}

#[tokio::test]
async fn test_paged_cache_model_generates() {
    let mut json = common::manifest_json(1);
    json["kv_page_size"] = serde_json::json!(4);
    let manifest = serde_json::from_value(json).unwrap();
    let engine = InferenceEngine::load_model(
        Arc::new(Runtime::cpu()),
        &manifest,
        common::tiny_shards(1),
    )
    .unwrap();

    let text = engine
        .generate("bcd", greedy_options(6))
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "dddddd");
}

#[tokio::test]
async fn test_gemma_flags_scale_embeddings_and_offset_norms() {
    // Scaling the embeddings by sqrt(H) and shifting norm weights by one
    // rescales the logits positively, so greedy output is unchanged.
    let mut json = common::manifest_json(1);
    json["is_gemma"] = serde_json::json!(true);
    let manifest = serde_json::from_value(json).unwrap();
    let engine = InferenceEngine::load_model(
        Arc::new(Runtime::cpu()),
        &manifest,
        common::tiny_shards(1),
    )
    .unwrap();

    let text = engine
        .generate("bcd", greedy_options(3))
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(text, "ddd");
}

#[tokio::test]
async fn test_chat_template_changes_effective_prompt() {
    let mut json = common::manifest_json(1);
    json["chat_template"] = serde_json::json!({"prefix": "a", "suffix": "b"});
    let manifest = serde_json::from_value(json).unwrap();
    let engine = InferenceEngine::load_model(
        Arc::new(Runtime::cpu()),
        &manifest,
        common::tiny_shards(1),
    )
    .unwrap();

    // Without the template the copy model repeats "d"; with it the rendered
    // prompt ends in the suffix "b".
    let plain = engine
        .generate("cd", greedy_options(2))
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(plain, "dd");

    let mut options = greedy_options(2);
    options.use_chat_template = true;
    let templated = engine
        .generate("cd", options)
        .unwrap()
        .collect_text()
        .await;
    assert_eq!(templated, "bb");
}

#[tokio::test]
async fn test_unload_rejects_further_use() {
    let engine = load_engine(1);
    engine.unload().unwrap();
    assert!(!engine.is_loaded());
    let err = engine.generate("abc", greedy_options(2)).unwrap_err();
    assert!(matches!(err, EngineError::NotLoaded));
}
