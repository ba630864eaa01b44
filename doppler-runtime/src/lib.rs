//! Doppler GPU runtime
//!
//! Device acquisition, buffer-pool accounting, dtype/layout metadata and the
//! kernel surface used by the inference pipeline. Every component receives an
//! explicit [`Runtime`] handle; there are no process-wide singletons, so tests
//! can instantiate a CPU runtime in isolation.

pub mod device;
pub mod dtype;
pub mod kernels;
pub mod pool;
pub mod recorder;

pub use device::Runtime;
pub use dtype::{ElementType, Layout};
pub use pool::{BufferKind, BufferPool, PoolGrant, PoolStatus};
pub use recorder::CommandRecorder;

use thiserror::Error;

/// Errors surfaced by the runtime layer.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("GPU unavailable: {0}")]
    GpuUnavailable(String),

    #[error("buffer allocation failed for '{id}' ({bytes} bytes): {reason}")]
    BufferAllocationFailed {
        id: String,
        bytes: u64,
        reason: String,
    },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("kernel error: {0}")]
    Kernel(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
