//! Kernel surface
//!
//! Thin, recorder-aware wrappers over candle ops. Every launch counts against
//! the active [`CommandRecorder`](crate::CommandRecorder) so the submit policy
//! (batched vs. per-kernel sync) stays in one place.

pub mod activation;
pub mod gather;
pub mod matmul;
pub mod norm;
pub mod rope;
pub mod sample;

pub use activation::{gelu, residual_add, silu, swiglu_gate};
pub use gather::embedding_gather;
pub use matmul::{bias_add, matmul, quantized_matmul};
pub use norm::{rms_norm, softmax};
pub use rope::{RopeScaling, RopeTables};
pub use sample::{argmax_id, gumbel_sample_id};
