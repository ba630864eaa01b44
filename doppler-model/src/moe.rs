//! Mixture-of-experts router.
//!
//! Gate projection -> softmax -> top-k selection, an execution plan that
//! bucketizes tokens by expert for batched FFN evaluation, and the weighted
//! scatter-combine of expert outputs. Load-balance counters persist across
//! calls; the load-balance loss is telemetry only and never feeds forward.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Tensor;

use doppler_runtime::kernels;
use doppler_runtime::CommandRecorder;

use crate::manifest::MoeSpec;
use crate::weights::WeightHandle;
use crate::Result;

/// Routing decision for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertSelection {
    /// Top-k expert indices, descending probability, ties broken by
    /// ascending index.
    pub indices: Vec<usize>,
    /// Matching weights; sum to 1 when renormalization is on.
    pub weights: Vec<f32>,
    /// Raw gate logits over all experts.
    pub logits: Vec<f32>,
}

/// Token bucket for one expert.
#[derive(Debug, Clone, Default)]
pub struct ExpertBatch {
    pub token_indices: Vec<u32>,
    pub weights: Vec<f32>,
}

pub struct MoeRouter {
    spec: MoeSpec,
    gate: Arc<WeightHandle>,
    bias: Option<Tensor>,
    counts: Vec<u64>,
    total_tokens: u64,
}

impl MoeRouter {
    pub fn new(spec: MoeSpec, gate: Arc<WeightHandle>, bias: Option<Tensor>) -> Self {
        let counts = vec![0; spec.num_experts];
        Self {
            spec,
            gate,
            bias,
            counts,
            total_tokens: 0,
        }
    }

    pub fn spec(&self) -> &MoeSpec {
        &self.spec
    }

    /// Route a `[tokens, hidden]` activation block.
    pub fn route(&mut self, rec: &mut CommandRecorder, h: &Tensor) -> Result<Vec<ExpertSelection>> {
        let mut logits = self.gate.matmul(rec, h)?;
        if let Some(bias) = &self.bias {
            logits = kernels::bias_add(rec, &logits, bias)?;
        }
        let probs = kernels::softmax(rec, &logits)?;

        let logit_rows = logits.to_vec2::<f32>()?;
        let prob_rows = probs.to_vec2::<f32>()?;

        let mut selections = Vec::with_capacity(prob_rows.len());
        for (row, logit_row) in prob_rows.iter().zip(&logit_rows) {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
            order.truncate(self.spec.top_k);

            let mut weights: Vec<f32> = order.iter().map(|&i| row[i]).collect();
            if self.spec.renormalize {
                let sum: f32 = weights.iter().sum();
                if sum > 0.0 {
                    for w in &mut weights {
                        *w /= sum;
                    }
                }
            }

            for &i in &order {
                self.counts[i] += 1;
            }
            selections.push(ExpertSelection {
                indices: order,
                weights,
                logits: logit_row.clone(),
            });
        }
        self.total_tokens += selections.len() as u64;
        Ok(selections)
    }

    /// Bucketize tokens by expert for batched evaluation.
    pub fn execution_plan(&self, selections: &[ExpertSelection]) -> BTreeMap<usize, ExpertBatch> {
        let mut plan: BTreeMap<usize, ExpertBatch> = BTreeMap::new();
        for (token, selection) in selections.iter().enumerate() {
            for (&expert, &weight) in selection.indices.iter().zip(&selection.weights) {
                let batch = plan.entry(expert).or_default();
                batch.token_indices.push(token as u32);
                batch.weights.push(weight);
            }
        }
        plan
    }

    /// `Y[t] = Σ_k weights[t][k] · expert_out[indices[t][k]][t]`, realized as
    /// a weighted index-add per expert bucket.
    ///
    /// `like` supplies the output shape, dtype and device (the routed
    /// activation block). Experts without an output contribute zero.
    pub fn combine(
        &self,
        rec: &mut CommandRecorder,
        plan: &BTreeMap<usize, ExpertBatch>,
        expert_outputs: &BTreeMap<usize, Tensor>,
        like: &Tensor,
    ) -> Result<Tensor> {
        let (tokens, hidden) = like.dims2()?;
        let dtype = like.dtype();
        let device = like.device().clone();
        let mut combined = Tensor::zeros((tokens, hidden), dtype, &device)?;

        for (expert, output) in expert_outputs {
            let batch = match plan.get(expert) {
                Some(batch) => batch,
                None => continue,
            };
            rec.record()?;
            let idx = Tensor::new(batch.token_indices.as_slice(), &device)?;
            let weights =
                Tensor::from_vec(batch.weights.clone(), (batch.weights.len(), 1), &device)?
                    .to_dtype(dtype)?;
            let weighted = output.broadcast_mul(&weights)?;
            combined = combined.index_add(&idx, &weighted, 0)?;
        }
        Ok(combined)
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// `L = E · Σ_i (f_i − 1/E)²` with `f_i = counts[i] / total_tokens`.
    /// Telemetry only.
    pub fn load_balance_loss(&self) -> f64 {
        if self.total_tokens == 0 {
            return 0.0;
        }
        let e = self.spec.num_experts as f64;
        let loss: f64 = self
            .counts
            .iter()
            .map(|&c| {
                let f = c as f64 / self.total_tokens as f64;
                (f - 1.0 / e).powi(2)
            })
            .sum();
        e * loss
    }

    pub fn reset_counters(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.total_tokens = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use doppler_runtime::{Layout, Runtime};

    fn router(renormalize: bool) -> MoeRouter {
        // Gate rows are one-hot so a one-hot hidden state produces chosen
        // logits directly: logits[e] = h · gate[e].
        let gate = Tensor::from_vec(
            vec![
                2.0f32, 0.0, 0.0, 0.0, // expert 0
                1.0, 0.0, 0.0, 0.0, // expert 1
                0.0, 0.0, 0.0, 0.0, // expert 2
                3.0, 0.0, 0.0, 0.0, // expert 3
            ],
            (4, 4),
            &Device::Cpu,
        )
        .unwrap();
        let handle = WeightHandle::dense("layer.0.router", gate, Layout::Row).unwrap();
        MoeRouter::new(
            MoeSpec {
                num_experts: 4,
                top_k: 2,
                expert_intermediate_size: 8,
                renormalize,
            },
            Arc::new(handle),
            None,
        )
    }

    fn one_hot_tokens(n: usize) -> Tensor {
        let mut data = vec![0f32; n * 4];
        for t in 0..n {
            data[t * 4] = 1.0;
        }
        Tensor::from_vec(data, (n, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_top2_of_logits_2_1_0_3() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let mut r = router(true);

        let selections = r.route(&mut rec, &one_hot_tokens(1)).unwrap();
        let s = &selections[0];

        // logits [2, 1, 0, 3] -> top-2 experts [3, 0].
        assert_eq!(s.indices, vec![3, 0]);
        assert_eq!(s.logits, vec![2.0, 1.0, 0.0, 3.0]);

        // Renormalized: e^3/(e^3+e^2) ≈ 0.731, e^2/(e^3+e^2) ≈ 0.269.
        assert!((s.weights[0] - 0.731).abs() < 1e-3);
        assert!((s.weights[1] - 0.269).abs() < 1e-3);
        let sum: f32 = s.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_without_renormalize_weights_are_softmax_mass() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let mut r = router(false);

        let s = &r.route(&mut rec, &one_hot_tokens(1)).unwrap()[0];
        let z: f32 = [2.0f32, 1.0, 0.0, 3.0].iter().map(|l| l.exp()).sum();
        assert!((s.weights[0] - 3.0f32.exp() / z).abs() < 1e-5);
        assert!((s.weights[1] - 2.0f32.exp() / z).abs() < 1e-5);
    }

    #[test]
    fn test_counters_accumulate() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let mut r = router(true);

        let t = 5;
        r.route(&mut rec, &one_hot_tokens(t)).unwrap();
        assert_eq!(r.total_tokens(), t as u64);
        let assigned: u64 = r.counts().iter().sum();
        assert_eq!(assigned, (2 * t) as u64);
        // Every token picked experts 3 and 0.
        assert_eq!(r.counts(), &[5, 0, 0, 5]);
        assert!(r.load_balance_loss() > 0.0);
    }

    #[test]
    fn test_execution_plan_buckets_by_expert() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let mut r = router(true);

        let selections = r.route(&mut rec, &one_hot_tokens(3)).unwrap();
        let plan = r.execution_plan(&selections);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[&3].token_indices, vec![0, 1, 2]);
        assert_eq!(plan[&0].token_indices, vec![0, 1, 2]);
        for w in &plan[&3].weights {
            assert!((w - 0.731).abs() < 1e-3);
        }
    }

    #[test]
    fn test_combine_weights_expert_outputs() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        let mut r = router(true);

        let selections = r.route(&mut rec, &one_hot_tokens(1)).unwrap();
        let plan = r.execution_plan(&selections);

        // Expert 3 emits all-ones, expert 0 all-twos.
        let mut outputs = BTreeMap::new();
        outputs.insert(3, Tensor::full(1f32, (1, 4), &Device::Cpu).unwrap());
        outputs.insert(0, Tensor::full(2f32, (1, 4), &Device::Cpu).unwrap());

        let combined = r
            .combine(&mut rec, &plan, &outputs, &one_hot_tokens(1))
            .unwrap();
        let row = &combined.to_vec2::<f32>().unwrap()[0];
        let expected = 0.7311f32 * 1.0 + 0.2689 * 2.0;
        for v in row {
            assert!((v - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn test_stable_tie_break_by_ascending_index() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        // All-zero gate: every expert ties; ascending index order wins.
        let gate = Tensor::zeros((4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let handle = WeightHandle::dense("layer.0.router", gate, Layout::Row).unwrap();
        let mut r = MoeRouter::new(
            MoeSpec {
                num_experts: 4,
                top_k: 2,
                expert_intermediate_size: 8,
                renormalize: true,
            },
            Arc::new(handle),
            None,
        );
        let s = &r.route(&mut rec, &one_hot_tokens(1)).unwrap()[0];
        assert_eq!(s.indices, vec![0, 1]);
    }
}
