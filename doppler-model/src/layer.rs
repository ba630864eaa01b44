//! One transformer block: attention with KV-cache side effects, then a
//! dense or mixture-of-experts feed-forward, with pre-norms and residuals.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::warn;

use doppler_runtime::kernels::{self, RopeTables};
use doppler_runtime::{CommandRecorder, Runtime};

use crate::attention::{self, AttentionKernel};
use crate::kv::KvCache;
use crate::manifest::{HiddenAct, ModelDescriptor};
use crate::moe::MoeRouter;
use crate::weights::{names, ExpertSource, WeightHandle, WeightRegistry};
use crate::{ModelError, Result};

/// Shared handles threaded through every layer call.
pub struct LayerContext<'a> {
    pub runtime: &'a Runtime,
    pub registry: &'a WeightRegistry,
    /// On-demand expert materialization; `None` when all experts are
    /// resident up front.
    pub experts: Option<&'a dyn ExpertSource>,
    pub rope: &'a RopeTables,
}

enum FeedForward {
    Dense {
        w1: Arc<WeightHandle>,
        w2: Arc<WeightHandle>,
        w3: Arc<WeightHandle>,
    },
    Moe {
        router: MoeRouter,
    },
}

pub struct TransformerLayer {
    index: usize,
    attn_norm: Tensor,
    ffn_norm: Tensor,
    wq: Arc<WeightHandle>,
    wk: Arc<WeightHandle>,
    wv: Arc<WeightHandle>,
    wo: Arc<WeightHandle>,
    ffn: FeedForward,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rms_eps: f64,
    act: HiddenAct,
    window: Option<usize>,
    kernel: AttentionKernel,
}

impl std::fmt::Debug for TransformerLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerLayer")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Fetch a norm weight as a dense tensor, applying the Gemma `w + 1` offset
/// when the descriptor asks for it.
pub fn norm_weight(
    registry: &WeightRegistry,
    name: &str,
    descriptor: &ModelDescriptor,
    device: &Device,
) -> Result<Tensor> {
    let raw = registry.get(name)?.dense_tensor(device)?;
    if descriptor.norm_weight_offset {
        Ok(raw.affine(1.0, 1.0)?)
    } else {
        Ok(raw)
    }
}

impl TransformerLayer {
    /// Resolve this layer's weights from the registry.
    ///
    /// `kernel_override` is the orchestrator's runtime choice; manifest
    /// selection comes next, then the default.
    pub fn from_registry(
        descriptor: &ModelDescriptor,
        index: usize,
        registry: &WeightRegistry,
        device: &Device,
        kernel_override: Option<AttentionKernel>,
    ) -> Result<Self> {
        let ffn = match descriptor.moe {
            Some(spec) => {
                let gate = registry
                    .try_get(&names::router(index))
                    .ok_or_else(|| ModelError::WeightsNotLoaded(names::router(index)))?;
                let bias = match registry.try_get(&names::router_bias(index)) {
                    Some(handle) => Some(handle.dense_tensor(device)?),
                    None => None,
                };
                FeedForward::Moe {
                    router: MoeRouter::new(spec, gate, bias),
                }
            }
            None => FeedForward::Dense {
                w1: registry.get(&names::w1(index))?,
                w2: registry.get(&names::w2(index))?,
                w3: registry.get(&names::w3(index))?,
            },
        };

        Ok(Self {
            index,
            attn_norm: norm_weight(registry, &names::attn_norm(index), descriptor, device)?,
            ffn_norm: norm_weight(registry, &names::ffn_norm(index), descriptor, device)?,
            wq: registry.get(&names::q(index))?,
            wk: registry.get(&names::k(index))?,
            wv: registry.get(&names::v(index))?,
            wo: registry.get(&names::o(index))?,
            ffn,
            num_heads: descriptor.num_heads,
            num_kv_heads: descriptor.num_kv_heads,
            head_dim: descriptor.head_dim,
            rms_eps: descriptor.rms_norm_eps,
            act: descriptor.hidden_act,
            window: descriptor.sliding_window,
            kernel: kernel_override
                .or(descriptor.attention_kernel)
                .unwrap_or_default(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn router(&self) -> Option<&MoeRouter> {
        match &self.ffn {
            FeedForward::Moe { router } => Some(router),
            FeedForward::Dense { .. } => None,
        }
    }

    /// Run the block on `x` (`[tokens, hidden]`) at absolute position
    /// `start_pos`, writing this layer's K/V to the cache.
    pub fn forward(
        &mut self,
        ctx: &LayerContext<'_>,
        rec: &mut CommandRecorder,
        kv: &mut KvCache,
        x: &Tensor,
        start_pos: usize,
    ) -> Result<Tensor> {
        let t = x.dim(0)?;
        let kv_dim = self.num_kv_heads * self.head_dim;

        // Attention half.
        let xn = kernels::rms_norm(rec, x, &self.attn_norm, self.rms_eps)?;
        let q = self.wq.matmul(rec, &xn)?;
        let k = self.wk.matmul(rec, &xn)?;
        let v = self.wv.matmul(rec, &xn)?;

        let q4 = q
            .reshape((t, self.num_heads, self.head_dim))?
            .transpose(0, 1)?
            .unsqueeze(0)?;
        let k4 = k
            .reshape((t, self.num_kv_heads, self.head_dim))?
            .transpose(0, 1)?
            .unsqueeze(0)?;
        let q4 = ctx.rope.apply(rec, &q4, start_pos)?;
        let k4 = ctx.rope.apply(rec, &k4, start_pos)?;

        // Rotated K and raw V in wire layout [t, kv_dim]. The cache write is
        // staged against the recorder and only lands when the pass commits,
        // so a failure further down discards it.
        let k_rows = k4
            .squeeze(0)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((t, kv_dim))?;
        kv.record_update(rec, self.index, &k_rows, &v, start_pos)?;

        // Attention runs over the committed prefix plus this pass's rows.
        let (k_seq, v_seq, first_pos) = if kv.layer_len(self.index) > 0 {
            let view = kv.attention_view(self.index)?;
            let k_prev = view.k.to_dtype(k_rows.dtype())?;
            let v_prev = view.v.to_dtype(v.dtype())?;
            (
                Tensor::cat(&[&k_prev, &k_rows], 0)?,
                Tensor::cat(&[&v_prev, &v], 0)?,
                view.first_pos,
            )
        } else {
            (k_rows.clone(), v.clone(), start_pos)
        };
        let s = k_seq.dim(0)?;
        let k_all = k_seq
            .reshape((s, self.num_kv_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let v_all = v_seq
            .reshape((s, self.num_kv_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;

        let groups = self.num_heads / self.num_kv_heads;
        let k_heads = attention::repeat_kv(&k_all, groups)?;
        let v_heads = attention::repeat_kv(&v_all, groups)?;
        let q3 = q4.squeeze(0)?.contiguous()?;

        let mask = attention::attention_mask(
            t,
            s,
            start_pos,
            first_pos,
            self.window,
            q3.dtype(),
            q3.device(),
        )?;
        let attn = attention::scaled_dot_attention(
            rec,
            &q3,
            &k_heads,
            &v_heads,
            mask.as_ref(),
            self.kernel,
        )?;
        let attn = attn
            .transpose(0, 1)?
            .contiguous()?
            .reshape((t, self.num_heads * self.head_dim))?;
        let attn_out = self.wo.matmul(rec, &attn)?;
        let x = kernels::residual_add(rec, x, &attn_out)?;

        // Feed-forward half.
        let xn2 = kernels::rms_norm(rec, &x, &self.ffn_norm, self.rms_eps)?;
        let ffn_out = match &mut self.ffn {
            FeedForward::Dense { w1, w2, w3 } => {
                let gate = w1.matmul(rec, &xn2)?;
                let up = w3.matmul(rec, &xn2)?;
                let gated = gated_activation(rec, self.act, &gate, &up)?;
                w2.matmul(rec, &gated)?
            }
            FeedForward::Moe { router } => {
                let index = self.index;
                let act = self.act;
                forward_moe(ctx, rec, router, index, act, &xn2)?
            }
        };
        Ok(kernels::residual_add(rec, &x, &ffn_out)?)
    }
}

fn gated_activation(
    rec: &mut CommandRecorder,
    act: HiddenAct,
    gate: &Tensor,
    up: &Tensor,
) -> Result<Tensor> {
    match act {
        HiddenAct::Silu => Ok(kernels::swiglu_gate(rec, gate, up)?),
        HiddenAct::Gelu => {
            let g = kernels::gelu(rec, gate)?;
            Ok((g * up)?)
        }
    }
}

/// Route, run the selected experts on their token buckets, and combine.
fn forward_moe(
    ctx: &LayerContext<'_>,
    rec: &mut CommandRecorder,
    router: &mut MoeRouter,
    layer: usize,
    act: HiddenAct,
    xn: &Tensor,
) -> Result<Tensor> {
    let selections = router.route(rec, xn)?;
    let plan = router.execution_plan(&selections);

    let mut outputs = BTreeMap::new();
    for (&expert, batch) in &plan {
        if !expert_available(ctx, layer, expert) {
            continue;
        }
        let w1 = ctx.registry.get(&names::expert(layer, expert, "w1"))?;
        let w2 = ctx.registry.get(&names::expert(layer, expert, "w2"))?;
        let w3 = ctx.registry.get(&names::expert(layer, expert, "w3"))?;

        let idx = Tensor::new(batch.token_indices.as_slice(), xn.device())?;
        rec.record()?;
        let rows = xn.index_select(&idx, 0)?;

        let gate = w1.matmul(rec, &rows)?;
        let up = w3.matmul(rec, &rows)?;
        let gated = gated_activation(rec, act, &gate, &up)?;
        outputs.insert(expert, w2.matmul(rec, &gated)?);
    }

    router.combine(rec, &plan, &outputs, xn)
}

/// Materialize an expert, retrying once. A second failure downgrades the
/// expert to zero contribution for this pass.
fn expert_available(ctx: &LayerContext<'_>, layer: usize, expert: usize) -> bool {
    let source = match ctx.experts {
        Some(source) => source,
        None => return true,
    };
    match source.ensure_expert_loaded(layer, expert) {
        Ok(()) => true,
        Err(first) => {
            warn!(
                "expert load failed (layer {}, expert {}): {}; retrying once",
                layer, expert, first
            );
            match source.ensure_expert_loaded(layer, expert) {
                Ok(()) => true,
                Err(second) => {
                    warn!(
                        "expert load failed again (layer {}, expert {}): {}; zero contribution",
                        layer, expert, second
                    );
                    false
                }
            }
        }
    }
}
