//! Rotary positional embedding tables and application.
//!
//! Tables are precomputed for `[0, max_seq_len)` at load time; the apply step
//! rotates interleaved dimension pairs of Q and K at their absolute positions.

use candle_core::{Device, Tensor};
use serde::Deserialize;

use crate::recorder::CommandRecorder;
use crate::Result;

/// Context-extension scaling applied to the rotary frequencies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RopeScaling {
    None,
    Linear {
        factor: f64,
    },
    /// NTK-aware: stretch the base instead of the positions.
    Ntk {
        factor: f64,
    },
    /// YaRN: per-dimension blend between interpolation and extrapolation.
    Yarn {
        factor: f64,
        original_max_len: usize,
        #[serde(default = "default_beta_fast")]
        beta_fast: f64,
        #[serde(default = "default_beta_slow")]
        beta_slow: f64,
    },
}

fn default_beta_fast() -> f64 {
    32.0
}

fn default_beta_slow() -> f64 {
    1.0
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self::None
    }
}

/// Precomputed cos/sin tables, `[max_seq_len, head_dim / 2]`.
pub struct RopeTables {
    cos: Tensor,
    sin: Tensor,
    max_positions: usize,
}

impl RopeTables {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        scaling: &RopeScaling,
        device: &Device,
    ) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq = scaled_inv_freq(head_dim, theta, scaling);
        let mscale = match scaling {
            // YaRN attention temperature: 0.1 * ln(s) + 1.
            RopeScaling::Yarn { factor, .. } => 0.1 * factor.ln() + 1.0,
            _ => 1.0,
        };

        let mut cos = Vec::with_capacity(max_seq_len * half);
        let mut sin = Vec::with_capacity(max_seq_len * half);
        for pos in 0..max_seq_len {
            for &f in &inv_freq {
                let angle = pos as f64 * f;
                cos.push((angle.cos() * mscale) as f32);
                sin.push((angle.sin() * mscale) as f32);
            }
        }

        Ok(Self {
            cos: Tensor::from_vec(cos, (max_seq_len, half), device)?,
            sin: Tensor::from_vec(sin, (max_seq_len, half), device)?,
            max_positions: max_seq_len,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Cos/sin rows for absolute positions `[start_pos, start_pos + len)`.
    pub fn slice(&self, start_pos: usize, len: usize) -> Result<(Tensor, Tensor)> {
        Ok((
            self.cos.narrow(0, start_pos, len)?,
            self.sin.narrow(0, start_pos, len)?,
        ))
    }

    /// Rotate `x` (`[batch, heads, len, head_dim]`) at absolute positions
    /// starting from `start_pos`. Pairs are interleaved: `(x[2i], x[2i+1])`.
    pub fn apply(&self, rec: &mut CommandRecorder, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        rec.record()?;
        let len = x.dim(2)?;
        let (cos, sin) = self.slice(start_pos, len)?;
        Ok(candle_nn::rotary_emb::rope_i(&x.contiguous()?, &cos, &sin)?)
    }
}

fn scaled_inv_freq(head_dim: usize, theta: f64, scaling: &RopeScaling) -> Vec<f64> {
    let half = head_dim / 2;
    let base_inv_freq =
        |theta: f64| (0..half).map(move |i| theta.powf(-((2 * i) as f64) / head_dim as f64));

    match scaling {
        RopeScaling::None => base_inv_freq(theta).collect(),
        RopeScaling::Linear { factor } => base_inv_freq(theta).map(|f| f / factor).collect(),
        RopeScaling::Ntk { factor } => {
            let adjusted = theta * factor.powf(head_dim as f64 / (head_dim as f64 - 2.0));
            base_inv_freq(adjusted).collect()
        }
        RopeScaling::Yarn {
            factor,
            original_max_len,
            beta_fast,
            beta_slow,
        } => {
            // Dimensions below `low` rotate fast enough to extrapolate; above
            // `high` they interpolate fully; a linear ramp blends in between.
            let corr_dim = |rotations: f64| {
                head_dim as f64 * (*original_max_len as f64 / (rotations * 2.0 * std::f64::consts::PI)).ln()
                    / (2.0 * theta.ln())
            };
            let low = corr_dim(*beta_fast).floor().max(0.0);
            let high = corr_dim(*beta_slow).ceil().min((half - 1) as f64);
            let span = (high - low).max(1e-3);

            base_inv_freq(theta)
                .enumerate()
                .map(|(i, f)| {
                    let ramp = ((i as f64 - low) / span).clamp(0.0, 1.0);
                    f * (1.0 - ramp) + (f / factor) * ramp
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Runtime;

    #[test]
    fn test_position_zero_is_identity() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();

        let tables = RopeTables::new(4, 8, 10_000.0, &RopeScaling::None, runtime.device()).unwrap();
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 1, 4), runtime.device()).unwrap();
        let y = tables.apply(&mut rec, &x, 0).unwrap();

        let got: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rotation_preserves_pair_norm() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();

        let tables = RopeTables::new(4, 16, 10_000.0, &RopeScaling::None, runtime.device()).unwrap();
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 1, 1, 4), runtime.device()).unwrap();
        let y = tables.apply(&mut rec, &x, 7).unwrap();

        let got: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        let norm_a = (got[0] * got[0] + got[1] * got[1]).sqrt();
        let norm_b = (got[2] * got[2] + got[3] * got[3]).sqrt();
        assert!((norm_a - (1.0f32 + 4.0).sqrt()).abs() < 1e-4);
        assert!((norm_b - (9.0f32 + 16.0).sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_linear_scaling_slows_rotation() {
        let plain = scaled_inv_freq(8, 10_000.0, &RopeScaling::None);
        let scaled = scaled_inv_freq(8, 10_000.0, &RopeScaling::Linear { factor: 4.0 });
        for (p, s) in plain.iter().zip(&scaled) {
            assert!((s - p / 4.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_yarn_blends_between_extrapolation_and_interpolation() {
        let factor = 8.0;
        let plain = scaled_inv_freq(64, 10_000.0, &RopeScaling::None);
        let yarn = scaled_inv_freq(
            64,
            10_000.0,
            &RopeScaling::Yarn {
                factor,
                original_max_len: 2048,
                beta_fast: 32.0,
                beta_slow: 1.0,
            },
        );
        for (p, y) in plain.iter().zip(&yarn) {
            // Every blended frequency stays within [p / factor, p].
            assert!(*y <= p + 1e-12);
            assert!(*y >= p / factor - 1e-12);
        }
        // Fast dims keep the base frequency, slow dims interpolate.
        assert!((yarn[0] - plain[0]).abs() < 1e-9);
        let last = yarn.len() - 1;
        assert!((yarn[last] - plain[last] / factor).abs() < 1e-9);
    }
}
