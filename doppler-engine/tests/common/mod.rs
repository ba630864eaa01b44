//! Shared fixtures: a tiny dense model whose weights make generation
//! predictable.
//!
//! The embedding is the 8x8 identity and every attention/FFN weight is zero,
//! so the residual stream carries the last token's one-hot embedding
//! straight to the tied LM head: greedy decoding repeats the last prompt
//! token forever.
#![allow(dead_code)]

use std::sync::Arc;

use doppler_model::weights::testing::ShardBuilder;
use doppler_model::weights::{names, MemoryShardLoader, ShardLoader};
use doppler_model::ModelManifest;

pub const HIDDEN: usize = 8;
pub const VOCAB: usize = 8;

/// Env-filtered logging for debugging test failures.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn identity_embed() -> Vec<f32> {
    let mut data = vec![0f32; VOCAB * HIDDEN];
    for i in 0..VOCAB {
        data[i * HIDDEN + i] = 1.0;
    }
    data
}

fn zeros(n: usize) -> Vec<f32> {
    vec![0f32; n]
}

pub fn copy_model_shard(num_layers: usize) -> Vec<u8> {
    let mut builder = ShardBuilder::new()
        .tensor(names::EMBED, &[VOCAB, HIDDEN], identity_embed())
        .tensor(names::FINAL_NORM, &[HIDDEN], vec![1.0; HIDDEN]);
    for l in 0..num_layers {
        builder = builder
            .tensor(&names::attn_norm(l), &[HIDDEN], vec![1.0; HIDDEN])
            .tensor(&names::ffn_norm(l), &[HIDDEN], vec![1.0; HIDDEN])
            .tensor(&names::q(l), &[HIDDEN, HIDDEN], zeros(HIDDEN * HIDDEN))
            .tensor(&names::k(l), &[HIDDEN, HIDDEN], zeros(HIDDEN * HIDDEN))
            .tensor(&names::v(l), &[HIDDEN, HIDDEN], zeros(HIDDEN * HIDDEN))
            .tensor(&names::o(l), &[HIDDEN, HIDDEN], zeros(HIDDEN * HIDDEN))
            .tensor(&names::w1(l), &[4, HIDDEN], zeros(4 * HIDDEN))
            .tensor(&names::w2(l), &[HIDDEN, 4], zeros(4 * HIDDEN))
            .tensor(&names::w3(l), &[4, HIDDEN], zeros(4 * HIDDEN));
    }
    builder.build()
}

/// `a..h` map to ids 0..8; no BOS/EOS auto-insertion.
pub fn manifest_json(num_layers: usize) -> serde_json::Value {
    serde_json::json!({
        "num_layers": num_layers,
        "hidden_size": HIDDEN,
        "num_heads": 2,
        "num_kv_heads": 2,
        "intermediate_size": 4,
        "vocab_size": VOCAB,
        "max_seq_len": 32,
        "tokenizer": {
            "type": "bpe",
            "vocab": {"a": 0, "b": 1, "c": 2, "d": 3, "e": 4, "f": 5, "g": 6, "h": 7},
        },
    })
}

pub fn tiny_manifest(num_layers: usize) -> ModelManifest {
    serde_json::from_value(manifest_json(num_layers)).unwrap()
}

pub fn tiny_shards(num_layers: usize) -> Arc<dyn ShardLoader> {
    let mut memory = MemoryShardLoader::new();
    memory.insert("model", copy_model_shard(num_layers));
    Arc::new(memory)
}

/// Same tiny model as both main and draft (`draft.model` shard).
pub fn speculative_manifest(num_layers: usize) -> ModelManifest {
    let mut json = manifest_json(num_layers);
    json["draft_model"] = manifest_json(num_layers);
    serde_json::from_value(json).unwrap()
}

pub fn speculative_shards(num_layers: usize) -> Arc<dyn ShardLoader> {
    let mut memory = MemoryShardLoader::new();
    memory.insert("model", copy_model_shard(num_layers));
    memory.insert("draft.model", copy_model_shard(num_layers));
    Arc::new(memory)
}
