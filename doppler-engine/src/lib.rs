//! Doppler inference engine
//!
//! The pipeline orchestrator and everything above it: prefill and decode
//! stepping, CPU and on-device sampling, speculative decoding, and the
//! streaming `generate` surface. One engine owns one loaded model; at most
//! one generation runs at a time.

pub mod chat;
pub mod generate;
pub mod pipeline;
pub mod sampling;
pub mod speculative;

pub use generate::{
    CancellationSignal, GenerationOptions, GenerationStats, InferenceEngine, TokenStream,
};
pub use pipeline::Pipeline;
pub use sampling::LogitsSampler;
pub use speculative::{ModelProvider, SpeculativeStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("a generation is already running")]
    AlreadyGenerating,

    #[error("no model loaded")]
    NotLoaded,

    #[error("empty prompt")]
    EmptyPrompt,

    #[error("token stream closed by consumer")]
    StreamClosed,

    #[error(transparent)]
    Model(#[from] doppler_model::ModelError),

    #[error(transparent)]
    Tokenizer(#[from] doppler_tokenizer::TokenizerError),

    #[error(transparent)]
    Runtime(#[from] doppler_runtime::RuntimeError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
