//! Speculative decoding: draft, verify, rejection-sample.
//!
//! A cheap draft model proposes `k` tokens; the main model scores all of
//! them in one forward pass and each proposal is accepted with probability
//! `min(1, p_main / p_draft)`. A rejected position is replaced by a sample
//! from the residual distribution `max(0, p_main − p_draft)`, which keeps
//! the output stream distributed exactly as main-model sampling.

use serde::Serialize;
use tracing::debug;
use ts_rs::TS;

use crate::sampling::LogitsSampler;
use crate::Result;

/// The model surface the coordinator drives. Both the main and the draft
/// side implement this; tests use scripted providers.
pub trait ModelProvider {
    /// Forward `ids` starting at absolute position `start_pos`, returning
    /// one raw logits row per input token (`[ids.len(), vocab]`).
    fn forward_window(&mut self, ids: &[u32], start_pos: usize) -> Result<Vec<Vec<f32>>>;

    /// Roll the KV cache back to `len` positions.
    fn truncate_cache(&mut self, len: usize) -> Result<()>;

    /// Positions currently cached.
    fn cache_len(&self) -> usize;
}

/// Running acceptance telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, TS)]
#[ts(export)]
pub struct SpeculativeStats {
    pub drafted: u64,
    pub accepted: u64,
    pub rejected: u64,
}

impl SpeculativeStats {
    pub fn average_accept_rate(&self) -> f64 {
        if self.drafted == 0 {
            0.0
        } else {
            self.accepted as f64 / self.drafted as f64
        }
    }

    /// `(1 + α·k) / (1 + 0.1·k)`: expected tokens per main-model pass over
    /// the relative cost of drafting.
    pub fn estimated_speedup(&self, depth: usize) -> f64 {
        let alpha = self.average_accept_rate();
        (1.0 + alpha * depth as f64) / (1.0 + 0.1 * depth as f64)
    }
}

/// One draft/verify round.
///
/// `last_token` is the most recent emitted token, not yet fed to either
/// model. Returns the tokens to emit: accepted draft tokens plus either the
/// residual replacement (on rejection) or the bonus token (all accepted).
/// Both caches advance by exactly `returned.len()` positions.
pub fn speculative_step(
    main: &mut dyn ModelProvider,
    draft: &mut dyn ModelProvider,
    last_token: u32,
    depth: usize,
    sampler: &mut LogitsSampler,
    stats: &mut SpeculativeStats,
) -> Result<Vec<u32>> {
    debug_assert_eq!(main.cache_len(), draft.cache_len());
    let base = main.cache_len();

    // Draft phase: k proposals, each fed back so the draft cache covers
    // every proposal (the trailing feed is rolled back on rejection).
    let mut draft_tokens = Vec::with_capacity(depth);
    let mut draft_dists = Vec::with_capacity(depth);
    let mut current = last_token;
    for i in 0..depth {
        let logits = draft.forward_window(&[current], base + i)?;
        let probs = sampler.probabilities(&logits[0]);
        let token = sampler.draw(&probs);
        draft_tokens.push(token);
        draft_dists.push(probs);
        current = token;
    }
    let tail = *draft_tokens.last().expect("depth > 0");
    draft.forward_window(&[tail], base + depth)?;
    stats.drafted += depth as u64;

    // Verify phase: one main pass over [last, d_1 .. d_k] yields a
    // [k + 1, vocab] logits matrix; row i scores proposal i, row k is the
    // bonus position.
    let mut verify_input = Vec::with_capacity(depth + 1);
    verify_input.push(last_token);
    verify_input.extend_from_slice(&draft_tokens);
    let main_logits = main.forward_window(&verify_input, base)?;

    let mut accepted = Vec::with_capacity(depth + 1);
    for (i, &token) in draft_tokens.iter().enumerate() {
        let p_main = sampler.probabilities(&main_logits[i]);
        let p_draft = &draft_dists[i];

        let pm = p_main[token as usize];
        let pd = p_draft[token as usize];
        let alpha = if pd > 0.0 { (pm / pd).min(1.0) } else { 1.0 };

        if sampler.uniform() < alpha {
            accepted.push(token);
            stats.accepted += 1;
            continue;
        }

        // Rejection: replace from the residual distribution and roll both
        // caches back past the dead proposals.
        stats.rejected += 1;
        let replacement = sample_residual(sampler, &p_main, p_draft);
        accepted.push(replacement);

        let keep = base + i + 1;
        main.truncate_cache(keep)?;
        draft.truncate_cache(keep)?;
        debug!(
            "speculative: accepted {}/{} then rejected, resampled token {}",
            i, depth, replacement
        );
        return Ok(accepted);
    }

    // Everything accepted: bonus token from the final main row.
    let bonus_probs = sampler.probabilities(&main_logits[depth]);
    let bonus = sampler.draw(&bonus_probs);
    accepted.push(bonus);
    Ok(accepted)
}

/// Sample from `r(x) ∝ max(0, p_main(x) − p_draft(x))`; falls back to
/// `p_main` when the residual has no mass (identical distributions).
fn sample_residual(sampler: &mut LogitsSampler, p_main: &[f32], p_draft: &[f32]) -> u32 {
    let mut residual: Vec<f32> = p_main
        .iter()
        .zip(p_draft)
        .map(|(&m, &d)| (m - d).max(0.0))
        .collect();
    let sum: f32 = residual.iter().sum();
    if sum <= 0.0 {
        return sampler.draw(p_main);
    }
    for r in &mut residual {
        *r /= sum;
    }
    sampler.draw(&residual)
}
