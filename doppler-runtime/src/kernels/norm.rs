//! Normalization kernels: RMSNorm and numerically stable softmax.

use candle_core::Tensor;

use crate::recorder::CommandRecorder;
use crate::Result;

/// RMSNorm over the last dimension with a learned per-feature scale.
pub fn rms_norm(rec: &mut CommandRecorder, x: &Tensor, weight: &Tensor, eps: f64) -> Result<Tensor> {
    rec.record()?;
    Ok(candle_nn::ops::rms_norm(x, weight, eps as f32)?)
}

/// Softmax over the last dimension (max-subtracted internally).
pub fn softmax(rec: &mut CommandRecorder, x: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok(candle_nn::ops::softmax_last_dim(x)?)
}
