//! Doppler model structures
//!
//! Everything between raw shard bytes and the forward pass: the model
//! manifest, the weight registry with on-demand expert materialization, the
//! layer-indexed KV cache in its three layouts, the MoE router, and the
//! per-layer transformer block.

pub mod attention;
pub mod kv;
pub mod layer;
pub mod manifest;
pub mod moe;
pub mod weights;

pub use attention::AttentionKernel;
pub use kv::{KvCache, KvCacheConfig, KvLayout};
pub use layer::{LayerContext, TransformerLayer};
pub use manifest::{HiddenAct, ModelDescriptor, ModelManifest, MoeSpec};
pub use moe::{ExpertSelection, MoeRouter};
pub use weights::{ShardLoader, WeightHandle, WeightRegistry};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("missing weight '{0}'")]
    MissingWeight(String),

    #[error("router weights not loaded: {0}")]
    WeightsNotLoaded(String),

    #[error("shard load failed for '{name}': {reason}")]
    ShardLoadFailed { name: String, reason: String },

    #[error("expert load failed: layer {layer}, expert {expert}")]
    ExpertLoadFailed { layer: usize, expert: usize },

    #[error("kv cache overflow: write [{start}, {end}) exceeds max_seq_len {max}")]
    CacheOverflow { start: usize, end: usize, max: usize },

    #[error("kv cache range [{start}, {end}) outside valid length {len}")]
    CacheRange { start: usize, end: usize, len: usize },

    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DtypeMismatch {
        expected: candle_core::DType,
        got: candle_core::DType,
    },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("paged kv cache accepts host tensors only")]
    PagedHostOnly,

    #[error(transparent)]
    Runtime(#[from] doppler_runtime::RuntimeError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
