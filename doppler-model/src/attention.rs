//! Scaled dot-product attention with selectable kernel variants.
//!
//! All three variants compute the same result; they differ in how much of
//! the key dimension is held live at once. `tiled_large` does one full-width
//! pass, `tiled_small` and `streaming` accumulate over KV tiles with an
//! online softmax.

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};

use doppler_runtime::CommandRecorder;

use crate::Result;

/// Mask value low enough to vanish under softmax while keeping the online
/// accumulator's running max finite.
const MASKED: f32 = f32::NEG_INFINITY;
const RUNNING_MAX_FLOOR: f32 = -1e30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKernel {
    TiledLarge,
    TiledSmall,
    Streaming,
}

impl Default for AttentionKernel {
    fn default() -> Self {
        Self::TiledLarge
    }
}

impl AttentionKernel {
    /// KV tile width for the online-softmax variants.
    fn tile(&self, total: usize) -> usize {
        match self {
            Self::TiledLarge => total,
            Self::TiledSmall => 128,
            Self::Streaming => 64,
        }
    }
}

/// Broadcast each KV head to its group of query heads.
///
/// `x` is `[num_kv_heads, seq, head_dim]`; returns
/// `[num_kv_heads * groups, seq, head_dim]` with each head repeated
/// contiguously, matching the query head order.
pub fn repeat_kv(x: &Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(x.clone());
    }
    let (num_kv, seq, head_dim) = x.dims3()?;
    let out = x
        .unsqueeze(1)?
        .expand((num_kv, groups, seq, head_dim))?
        .contiguous()?
        .reshape((num_kv * groups, seq, head_dim))?;
    Ok(out)
}

/// Additive attention mask `[q_len, k_len]`, or `None` when nothing is
/// masked. Query row `i` sits at absolute position `q_start + i`; key column
/// `j` at `k_first + j`. Causal masking hides future keys; a sliding window
/// additionally hides keys at distance >= `window`.
pub fn attention_mask(
    q_len: usize,
    k_len: usize,
    q_start: usize,
    k_first: usize,
    window: Option<usize>,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    let mut any_masked = false;
    let mut data = vec![0f32; q_len * k_len];
    for i in 0..q_len {
        let q_pos = q_start + i;
        for j in 0..k_len {
            let k_pos = k_first + j;
            let causal = k_pos > q_pos;
            let windowed = match window {
                Some(w) => k_pos + w <= q_pos,
                None => false,
            };
            if causal || windowed {
                data[i * k_len + j] = MASKED;
                any_masked = true;
            }
        }
    }
    if !any_masked {
        return Ok(None);
    }
    let mask = Tensor::from_vec(data, (q_len, k_len), device)?.to_dtype(dtype)?;
    Ok(Some(mask))
}

/// `softmax(Q·Kᵀ / sqrt(d) + mask) · V` per head.
///
/// `q` is `[heads, q_len, head_dim]`, `k`/`v` are `[heads, k_len, head_dim]`
/// (already broadcast for GQA). Returns `[heads, q_len, head_dim]`.
pub fn scaled_dot_attention(
    rec: &mut CommandRecorder,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    kernel: AttentionKernel,
) -> Result<Tensor> {
    let (heads, q_len, head_dim) = q.dims3()?;
    let k_len = k.dim(1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let tile = kernel.tile(k_len);

    if tile >= k_len {
        rec.record()?;
        let mut scores = (q.matmul(&k.t()?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(&mask.unsqueeze(0)?)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        rec.record()?;
        return Ok(probs.matmul(v)?);
    }

    // Online softmax over KV tiles: running max `m`, normalizer `l`, and a
    // rescaled accumulator.
    let dtype = q.dtype();
    let mut m = Tensor::full(RUNNING_MAX_FLOOR, (heads, q_len, 1), q.device())?.to_dtype(dtype)?;
    let mut l = Tensor::zeros((heads, q_len, 1), dtype, q.device())?;
    let mut acc = Tensor::zeros((heads, q_len, head_dim), dtype, q.device())?;

    let mut start = 0;
    while start < k_len {
        rec.record()?;
        let count = tile.min(k_len - start);
        let k_tile = k.narrow(1, start, count)?;
        let v_tile = v.narrow(1, start, count)?;

        let mut scores = (q.matmul(&k_tile.t()?)? * scale)?;
        if let Some(mask) = mask {
            let mask_tile = mask.narrow(1, start, count)?;
            scores = scores.broadcast_add(&mask_tile.unsqueeze(0)?)?;
        }

        let tile_max = scores.max_keepdim(D::Minus1)?;
        let new_m = m.maximum(&tile_max)?;
        let correction = (&m - &new_m)?.exp()?;
        let exp_scores = scores.broadcast_sub(&new_m)?.exp()?;

        l = ((l * &correction)? + exp_scores.sum_keepdim(D::Minus1)?)?;
        acc = (acc.broadcast_mul(&correction)? + exp_scores.matmul(&v_tile)?)?;
        m = new_m;

        start += count;
    }

    Ok(acc.broadcast_div(&l)?)
}
