//! Logit post-processing and sampling.
//!
//! Repetition penalty, temperature, top-k, top-p nucleus filtering, and
//! seeded categorical draws over host logits. NaN/Inf sanitation runs before
//! anything else so a bad forward pass degrades instead of crashing the
//! sampler.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

/// Below this temperature sampling collapses to greedy argmax.
pub const GREEDY_TEMPERATURE: f32 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repetition_penalty: 1.1,
        }
    }
}

pub struct LogitsSampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl LogitsSampler {
    /// `seed: None` draws fresh entropy; a fixed seed reproduces the stream.
    pub fn new(config: SamplerConfig, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn is_greedy(&self) -> bool {
        self.config.temperature < GREEDY_TEMPERATURE
    }

    /// Full pipeline over raw logits: sanitize, penalize repeats, then draw.
    pub fn sample(&mut self, logits: &mut [f32], previous: &[u32]) -> u32 {
        if sanitize_logits(logits) {
            warn!("sanitized NaN/Inf logits before sampling");
        }
        apply_repetition_penalty(logits, previous, self.config.repetition_penalty);
        if self.is_greedy() {
            return argmax(logits);
        }
        let probs = self.probabilities(logits);
        self.draw(&probs)
    }

    /// The sampling distribution (temperature, top-k, top-p, renormalized)
    /// without the repetition penalty. Greedy configs give a one-hot
    /// distribution. This is the `p(x)` the speculative verifier consumes.
    pub fn probabilities(&self, logits: &[f32]) -> Vec<f32> {
        if self.is_greedy() {
            let mut probs = vec![0f32; logits.len()];
            probs[argmax(logits) as usize] = 1.0;
            return probs;
        }

        let temperature = self.config.temperature.max(GREEDY_TEMPERATURE);
        let mut probs = softmax(logits, temperature);
        top_k_filter(&mut probs, self.config.top_k);
        top_p_filter(&mut probs, self.config.top_p);
        renormalize(&mut probs);
        probs
    }

    /// Draw from an already-normalized distribution.
    pub fn draw(&mut self, probs: &[f32]) -> u32 {
        let u: f32 = self.rng.gen();
        let mut cumulative = 0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                return i as u32;
            }
        }
        // Rounding left a sliver of mass; take the last supported token.
        probs
            .iter()
            .rposition(|&p| p > 0.0)
            .unwrap_or(probs.len() - 1) as u32
    }

    pub fn uniform(&mut self) -> f32 {
        self.rng.gen()
    }

    /// Gumbel draws for the on-device sampling kernel.
    pub fn gumbel_noise(&mut self, vocab: usize) -> Vec<f32> {
        let mut draw = || self.rng.gen::<f32>();
        doppler_runtime::kernels::sample::gumbel_noise(&mut draw, vocab)
    }
}

/// `ℓ_j ← ℓ_j / ρ` for positive logits of seen ids, `ℓ_j · ρ` otherwise.
pub fn apply_repetition_penalty(logits: &mut [f32], previous: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    for &id in previous {
        if let Some(l) = logits.get_mut(id as usize) {
            *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
        }
    }
}

/// Replace NaN with a strong negative, clamp infinities. Returns whether
/// anything was bad.
pub fn sanitize_logits(logits: &mut [f32]) -> bool {
    let mut had_bad = false;
    for l in logits.iter_mut() {
        if l.is_nan() {
            *l = -100.0;
            had_bad = true;
        } else if l.is_infinite() {
            *l = if *l > 0.0 { 100.0 } else { -100.0 };
            had_bad = true;
        }
    }
    had_bad
}

pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &l) in logits.iter().enumerate() {
        if l > best_value {
            best_value = l;
            best = i;
        }
    }
    best as u32
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&e| e / sum).collect()
}

/// Zero out everything but the `k` largest entries.
fn top_k_filter(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    for &i in &order[k..] {
        probs[i] = 0.0;
    }
}

/// Keep the smallest prefix (by descending probability) whose cumulative
/// mass reaches `p`.
fn top_p_filter(probs: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

    let mut cumulative = 0f32;
    let mut cut = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= p {
            cut = rank + 1;
            break;
        }
    }
    for &i in &order[cut..] {
        probs[i] = 0.0;
    }
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(temperature: f32, top_k: usize, top_p: f32) -> SamplerConfig {
        SamplerConfig {
            temperature,
            top_k,
            top_p,
            repetition_penalty: 1.0,
        }
    }

    #[test]
    fn test_low_temperature_is_argmax() {
        let mut sampler = LogitsSampler::new(config(0.001, 0, 1.0), Some(0));
        let mut logits = vec![0.1, 3.0, 2.9, -1.0];
        assert_eq!(sampler.sample(&mut logits, &[]), 1);
    }

    #[test]
    fn test_full_topk_topp_matches_plain_categorical() {
        // top_k = vocab and top_p = 1 must leave the softmax untouched.
        let logits = vec![1.0f32, 0.5, -0.5, 0.0];
        let sampler = LogitsSampler::new(config(1.0, 4, 1.0), Some(0));
        let probs = sampler.probabilities(&logits);
        let raw = softmax(&logits, 1.0);
        for (a, b) in probs.iter().zip(&raw) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_top_k_keeps_k_largest() {
        let logits = vec![4.0f32, 3.0, 2.0, 1.0];
        let sampler = LogitsSampler::new(config(1.0, 2, 1.0), Some(0));
        let probs = sampler.probabilities(&logits);
        assert!(probs[0] > 0.0 && probs[1] > 0.0);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_top_p_keeps_smallest_sufficient_prefix() {
        // Distribution heavily concentrated on index 0.
        let logits = vec![5.0f32, 1.0, 1.0, 1.0];
        let sampler = LogitsSampler::new(config(1.0, 0, 0.5), Some(0));
        let probs = sampler.probabilities(&logits);
        assert!(probs[0] > 0.99);
        assert_eq!(&probs[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_repetition_penalty_direction() {
        let mut logits = vec![2.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits[0], 1.0); // positive divided
        assert_eq!(logits[1], -4.0); // negative multiplied
        assert_eq!(logits[2], 1.0); // untouched
    }

    #[test]
    fn test_sanitize_handles_nan_and_inf() {
        let mut logits = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 0.5];
        assert!(sanitize_logits(&mut logits));
        assert_eq!(logits, vec![-100.0, 100.0, -100.0, 0.5]);
        assert!(!sanitize_logits(&mut logits));
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let logits = vec![1.0f32, 1.1, 0.9, 1.05];
        let mut a = LogitsSampler::new(config(1.0, 0, 1.0), Some(42));
        let mut b = LogitsSampler::new(config(1.0, 0, 1.0), Some(42));
        for _ in 0..32 {
            let mut la = logits.clone();
            let mut lb = logits.clone();
            assert_eq!(a.sample(&mut la, &[]), b.sample(&mut lb, &[]));
        }
    }

    #[test]
    fn test_draw_respects_distribution_support() {
        let mut sampler = LogitsSampler::new(config(1.0, 0, 1.0), Some(7));
        let probs = vec![0.0, 0.0, 1.0, 0.0];
        for _ in 0..16 {
            assert_eq!(sampler.draw(&probs), 2);
        }
    }
}
