//! On-device sampling kernels.
//!
//! Both paths read back a single token id rather than the whole logits
//! vector: greedy argmax, and Gumbel-max categorical sampling with optional
//! top-k masking. Gumbel noise is generated host-side from the request's
//! seeded RNG so determinism stays with the caller.

use candle_core::Tensor;

use crate::recorder::CommandRecorder;
use crate::{Result, RuntimeError};

/// Greedy: index of the largest logit.
pub fn argmax_id(rec: &mut CommandRecorder, logits: &Tensor) -> Result<u32> {
    rec.record()?;
    let idx = logits.argmax(0)?;
    Ok(idx.to_scalar::<u32>()?)
}

/// Gumbel-max sample: `argmax(logits / temperature + g)` with
/// `g = -ln(-ln(u))`, equivalent to categorical sampling from the
/// temperature-scaled softmax. `noise` must hold one Gumbel draw per logit.
pub fn gumbel_sample_id(
    rec: &mut CommandRecorder,
    logits: &Tensor,
    temperature: f32,
    top_k: Option<usize>,
    noise: &[f32],
) -> Result<u32> {
    let vocab = logits.dim(0)?;
    if noise.len() != vocab {
        return Err(RuntimeError::ShapeMismatch {
            expected: format!("{vocab} noise values"),
            got: format!("{}", noise.len()),
        });
    }

    rec.record()?;
    let mut scaled = (logits / temperature as f64)?;

    if let Some(k) = top_k {
        if k > 0 && k < vocab {
            // Mask everything below the k-th largest logit to -inf.
            let order = scaled.arg_sort_last_dim(false)?;
            let kth_idx = order.narrow(0, k - 1, 1)?;
            let threshold = scaled.gather(&kth_idx, 0)?;
            let below = scaled.broadcast_lt(&threshold)?;
            let neg_inf = Tensor::full(f32::NEG_INFINITY, vocab, scaled.device())?;
            scaled = below.where_cond(&neg_inf, &scaled)?;
        }
    }

    let gumbel = Tensor::from_vec(noise.to_vec(), vocab, scaled.device())?;
    let perturbed = (scaled + gumbel)?;
    let idx = perturbed.argmax(0)?;
    Ok(idx.to_scalar::<u32>()?)
}

/// Host-side Gumbel draws for [`gumbel_sample_id`].
pub fn gumbel_noise(rng: &mut impl FnMut() -> f32, vocab: usize) -> Vec<f32> {
    (0..vocab)
        .map(|_| {
            let u = rng().clamp(1e-9, 1.0 - 1e-9);
            -(-(u.ln())).ln()
        })
        .collect()
}
