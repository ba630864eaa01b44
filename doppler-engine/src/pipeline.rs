//! Pipeline orchestrator: embedding, the layer stack, final projection.
//!
//! One `Pipeline` owns the weights, KV cache and rope tables of one loaded
//! model (plus, optionally, its draft model). Prefill and decode steps share
//! a single forward path; each pass records onto one command recorder and
//! submits exactly once.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use doppler_model::kv::{KvCache, KvCacheConfig};
use doppler_model::layer::norm_weight;
use doppler_model::weights::{
    names, ShardLoader, WeightHandle, WeightLoader, WeightRegistry, TOKENIZER_SHARD,
};
use doppler_model::{
    AttentionKernel, LayerContext, ModelDescriptor, ModelError, ModelManifest, TransformerLayer,
};
use doppler_runtime::kernels::{self, RopeTables};
use doppler_runtime::{BufferKind, Layout, Runtime};
use doppler_tokenizer::config::TokenizerKind;
use doppler_tokenizer::Tokenizer;

use crate::sampling::GREEDY_TEMPERATURE;
use crate::speculative::ModelProvider;
use crate::{EngineError, Result};

enum LmHead {
    /// Tied embeddings: project through the transposed embedding matrix.
    Tied,
    Projection(Arc<WeightHandle>),
}

pub struct Pipeline {
    runtime: Arc<Runtime>,
    descriptor: ModelDescriptor,
    registry: Arc<WeightRegistry>,
    loader: Arc<WeightLoader>,
    layers: Vec<TransformerLayer>,
    kv: KvCache,
    rope: RopeTables,
    embed_matrix: Tensor,
    lm_head: LmHead,
    final_norm: Tensor,
    tokenizer: Arc<Tokenizer>,
    draft: Option<Box<Pipeline>>,
    pool_prefix: String,
    /// Skips the on-device sampling fast path so logits stay inspectable.
    debug_inspect: bool,
}

impl Pipeline {
    /// Load a model: populate the registry, build layers, precompute rope
    /// tables, initialize the KV cache, tokenizer and (if configured) the
    /// draft pipeline.
    pub fn load(
        runtime: Arc<Runtime>,
        manifest: &ModelManifest,
        shards: Arc<dyn ShardLoader>,
    ) -> Result<Self> {
        let descriptor = manifest.resolve()?;
        let registry = Arc::new(WeightRegistry::new());
        let loader = Arc::new(WeightLoader::new(
            shards,
            registry.clone(),
            runtime.device().clone(),
        ));
        Self::load_inner(runtime, descriptor, loader, String::new())
    }

    fn load_inner(
        runtime: Arc<Runtime>,
        descriptor: ModelDescriptor,
        loader: Arc<WeightLoader>,
        pool_prefix: String,
    ) -> Result<Self> {
        let start = std::time::Instant::now();
        loader.load_base()?;
        let registry = loader.registry().clone();
        let device = runtime.device();

        let tokenizer = match descriptor.tokenizer.kind {
            TokenizerKind::Bundled => {
                let bytes = loader.load_raw_shard(TOKENIZER_SHARD)?;
                Tokenizer::bundled(&bytes, &descriptor.tokenizer)?
            }
            _ => Tokenizer::from_config(&descriptor.tokenizer)?,
        };

        let embed = registry.get(names::EMBED)?;
        let embed_matrix = embed.dense_tensor(device)?;
        let embed_vocab = embed_matrix.dim(0)?;
        if embed_vocab < descriptor.vocab_size {
            return Err(EngineError::Model(ModelError::InvalidManifest(format!(
                "embedding vocab {} smaller than manifest vocab {}",
                embed_vocab, descriptor.vocab_size
            ))));
        }

        let lm_head = match registry.try_get(names::LM_HEAD) {
            Some(handle) => LmHead::Projection(handle),
            None => LmHead::Tied,
        };
        let final_norm = norm_weight(&registry, names::FINAL_NORM, &descriptor, device)?;

        let mut layers = Vec::with_capacity(descriptor.num_layers);
        for index in 0..descriptor.num_layers {
            layers.push(TransformerLayer::from_registry(
                &descriptor,
                index,
                &registry,
                device,
                None,
            )?);
        }

        let kv = KvCache::new(
            KvCacheConfig {
                num_layers: descriptor.num_layers,
                max_seq_len: descriptor.max_seq_len,
                num_kv_heads: descriptor.num_kv_heads,
                head_dim: descriptor.head_dim,
                dtype: descriptor.kv_dtype,
                layout: descriptor.kv_layout,
            },
            device,
        )?;
        let rope = RopeTables::new(
            descriptor.head_dim,
            descriptor.max_seq_len,
            descriptor.rope_theta,
            &descriptor.rope_scaling,
            device,
        )?;

        let load_ms = start.elapsed().as_millis() as u64;
        runtime.pool().acquire(
            &format!("{pool_prefix}model.weights"),
            BufferKind::Weights,
            registry.total_bytes(),
            0.95,
            load_ms,
        )?;
        runtime.pool().acquire(
            &format!("{pool_prefix}model.kv"),
            BufferKind::KvCache,
            kv.config().layer_bytes() * descriptor.num_layers as u64,
            0.8,
            0,
        )?;

        let draft = match descriptor.draft.clone() {
            Some(draft_descriptor) => {
                let draft_registry = Arc::new(WeightRegistry::new());
                let draft_loader = Arc::new(
                    WeightLoader::new(
                        loader.shard_source(),
                        draft_registry,
                        device.clone(),
                    )
                    .with_prefix("draft."),
                );
                Some(Box::new(Self::load_inner(
                    runtime.clone(),
                    *draft_descriptor,
                    draft_loader,
                    format!("{pool_prefix}draft."),
                )?))
            }
            None => None,
        };

        info!(
            "model loaded: {} layers, vocab {}, {} weights, {}ms",
            descriptor.num_layers,
            descriptor.vocab_size,
            registry.len(),
            load_ms
        );

        Ok(Self {
            runtime,
            descriptor,
            registry,
            loader,
            layers,
            kv,
            rope,
            embed_matrix,
            lm_head,
            final_norm,
            tokenizer: Arc::new(tokenizer),
            draft,
            pool_prefix,
            debug_inspect: false,
        })
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn tokenizer(&self) -> Arc<Tokenizer> {
        self.tokenizer.clone()
    }

    pub fn seq_len(&self) -> usize {
        self.kv.seq_len()
    }

    /// Read-only view of the KV cache (diagnostics and tests).
    pub fn kv_cache(&self) -> &KvCache {
        &self.kv
    }

    pub fn has_draft(&self) -> bool {
        self.draft.is_some()
    }

    pub fn take_draft(&mut self) -> Option<Box<Pipeline>> {
        self.draft.take()
    }

    pub fn put_draft(&mut self, draft: Option<Box<Pipeline>>) {
        self.draft = draft;
    }

    pub fn set_debug_inspect(&mut self, on: bool) {
        self.debug_inspect = on;
    }

    pub fn set_attention_kernel(&mut self, kernel: AttentionKernel) -> Result<()> {
        for index in 0..self.layers.len() {
            self.layers[index] = TransformerLayer::from_registry(
                &self.descriptor,
                index,
                &self.registry,
                self.runtime.device(),
                Some(kernel),
            )?;
        }
        Ok(())
    }

    /// Per-layer MoE load-balance telemetry.
    pub fn load_balance_losses(&self) -> Vec<(usize, f64)> {
        self.layers
            .iter()
            .filter_map(|l| l.router().map(|r| (l.index(), r.load_balance_loss())))
            .collect()
    }

    /// One forward pass over `ids` at absolute position `start_pos`.
    /// Returns `[ids.len(), vocab]` logits in f32, still device-resident.
    ///
    /// The pass is transactional: KV writes stay staged until the recorder
    /// submits, and any error discards them, leaving the cache at the last
    /// successfully completed token so callers may truncate and retry.
    pub fn forward(&mut self, ids: &[u32], start_pos: usize) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        let runtime = self.runtime.clone();
        let mut rec = runtime.recorder();

        let logits = match self.forward_pass(&mut rec, ids, start_pos) {
            Ok(logits) => logits,
            Err(e) => {
                // Recorder drops unsubmitted; staged cache writes go with it.
                self.kv.discard_recorded();
                return Err(e);
            }
        };

        let submitted = match rec.submit_and_wait() {
            Ok(submitted) => submitted,
            Err(e) => {
                self.kv.discard_recorded();
                return Err(e.into());
            }
        };
        self.kv.commit_recorded()?;
        debug!(
            "forward: {} tokens at pos {}, {} kernels",
            ids.len(),
            start_pos,
            submitted
        );
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn forward_pass(
        &mut self,
        rec: &mut doppler_runtime::CommandRecorder<'_>,
        ids: &[u32],
        start_pos: usize,
    ) -> Result<Tensor> {
        let mut x = kernels::embedding_gather(rec, &self.embed_matrix, ids)?;
        if self.descriptor.scale_embeddings {
            rec.record()?;
            x = (x * (self.descriptor.hidden_size as f64).sqrt())?;
        }

        let ctx = LayerContext {
            runtime: self.runtime.as_ref(),
            registry: self.registry.as_ref(),
            experts: Some(self.loader.as_ref()),
            rope: &self.rope,
        };
        for layer in &mut self.layers {
            // Rebinding drops the previous hidden buffer once the layer
            // has produced its output.
            x = layer.forward(&ctx, rec, &mut self.kv, &x, start_pos)?;
        }

        let xn = kernels::rms_norm(rec, &x, &self.final_norm, self.descriptor.rms_norm_eps)?;
        match &self.lm_head {
            LmHead::Projection(w) => Ok(w.matmul(rec, &xn)?),
            LmHead::Tied => Ok(kernels::matmul(rec, &xn, &self.embed_matrix, Layout::Row)?),
        }
    }

    /// Decode one token and read the full logits row back to the host.
    pub fn decode_logits(&mut self, token: u32, pos: usize) -> Result<Vec<f32>> {
        let logits = self.forward(&[token], pos)?;
        Ok(logits.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// GPU fast path: decode one token and sample on device, reading back
    /// only the chosen id. Greedy argmax below the temperature floor,
    /// Gumbel-max with optional top-k otherwise. Skipped entirely when
    /// debug inspection is on.
    pub fn decode_step_gpu(
        &mut self,
        token: u32,
        pos: usize,
        temperature: f32,
        top_k: Option<usize>,
        gumbel: &[f32],
    ) -> Result<u32> {
        debug_assert!(!self.debug_inspect);
        let logits = self.forward(&[token], pos)?.squeeze(0)?;
        let mut rec = self.runtime.recorder();
        let id = if temperature < GREEDY_TEMPERATURE {
            kernels::argmax_id(&mut rec, &logits)?
        } else {
            kernels::gumbel_sample_id(&mut rec, &logits, temperature, top_k, gumbel)?
        };
        rec.submit_and_wait()?;
        Ok(id)
    }

    pub fn debug_inspect(&self) -> bool {
        self.debug_inspect
    }

    /// Clear the KV cache and transient state; weights stay resident.
    pub fn reset(&mut self) {
        self.kv.clear();
        if let Some(draft) = &mut self.draft {
            draft.reset();
        }
    }

    /// Release every GPU buffer and weight. The pipeline is unusable
    /// afterwards.
    pub fn unload(&mut self) {
        self.kv.destroy();
        self.registry.clear();
        self.runtime
            .pool()
            .release(&format!("{}model.weights", self.pool_prefix));
        self.runtime
            .pool()
            .release(&format!("{}model.kv", self.pool_prefix));
        if let Some(draft) = &mut self.draft {
            draft.unload();
        }
    }
}

impl ModelProvider for Pipeline {
    fn forward_window(&mut self, ids: &[u32], start_pos: usize) -> Result<Vec<Vec<f32>>> {
        let logits = self.forward(ids, start_pos)?;
        Ok(logits.to_vec2::<f32>()?)
    }

    fn truncate_cache(&mut self, len: usize) -> Result<()> {
        self.kv.truncate(len)?;
        Ok(())
    }

    fn cache_len(&self) -> usize {
        self.kv.seq_len()
    }
}
