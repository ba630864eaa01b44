//! Matrix multiply kernels, dense and quantized.

use candle_core::quantized::QMatMul;
use candle_core::{Module, Tensor};

use crate::dtype::Layout;
use crate::recorder::CommandRecorder;
use crate::Result;

/// `x @ w` with the weight in either storage order.
///
/// `x` is `[t, in]`; a `Row` weight is `[out, in]`, a `Column` weight is
/// `[in, out]`. Returns `[t, out]`.
pub fn matmul(rec: &mut CommandRecorder, x: &Tensor, w: &Tensor, layout: Layout) -> Result<Tensor> {
    rec.record()?;
    let y = match layout {
        Layout::Row => x.matmul(&w.t()?)?,
        Layout::Column => x.matmul(w)?,
    };
    Ok(y)
}

/// Quantized `x @ w.t()`; the block format stays packed on device.
pub fn quantized_matmul(rec: &mut CommandRecorder, x: &Tensor, w: &QMatMul) -> Result<Tensor> {
    rec.record()?;
    Ok(w.forward(x)?)
}

/// Fused elementwise bias add (broadcast over the leading dims).
pub fn bias_add(rec: &mut CommandRecorder, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
    rec.record()?;
    Ok(x.broadcast_add(bias)?)
}
