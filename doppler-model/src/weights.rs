//! Weight registry and shard loading.
//!
//! Weights live behind canonical names (`embed`, `layer.3.q`,
//! `layer.3.expert.5.w1`, ...) in a concurrent registry. Dense tensors come
//! from safetensors shards, quantized tensors from GGUF shards; expert
//! weights may be materialized lazily the first time a layer routes to them.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use candle_core::quantized::{gguf_file, GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, Tensor};
use dashmap::DashMap;
use half::{bf16, f16};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use doppler_runtime::kernels;
use doppler_runtime::{CommandRecorder, ElementType, Layout};

use crate::{ModelError, Result};

/// The shard holding all base (non-expert) weights.
pub const BASE_SHARD: &str = "model";

/// The shard holding a serialized `tokenizer.json` for bundled tokenizers.
pub const TOKENIZER_SHARD: &str = "tokenizer";

/// Canonical weight names.
pub mod names {
    pub const EMBED: &str = "embed";
    pub const LM_HEAD: &str = "lm_head";
    pub const FINAL_NORM: &str = "final_norm";

    pub fn attn_norm(layer: usize) -> String {
        format!("layer.{layer}.attn_norm")
    }
    pub fn q(layer: usize) -> String {
        format!("layer.{layer}.q")
    }
    pub fn k(layer: usize) -> String {
        format!("layer.{layer}.k")
    }
    pub fn v(layer: usize) -> String {
        format!("layer.{layer}.v")
    }
    pub fn o(layer: usize) -> String {
        format!("layer.{layer}.o")
    }
    pub fn ffn_norm(layer: usize) -> String {
        format!("layer.{layer}.ffn_norm")
    }
    pub fn w1(layer: usize) -> String {
        format!("layer.{layer}.w1")
    }
    pub fn w2(layer: usize) -> String {
        format!("layer.{layer}.w2")
    }
    pub fn w3(layer: usize) -> String {
        format!("layer.{layer}.w3")
    }
    pub fn router(layer: usize) -> String {
        format!("layer.{layer}.router")
    }
    pub fn router_bias(layer: usize) -> String {
        format!("layer.{layer}.router_bias")
    }
    pub fn expert(layer: usize, expert: usize, part: &str) -> String {
        format!("layer.{layer}.expert.{expert}.{part}")
    }
    /// Shard name for one lazily-loaded expert.
    pub fn expert_shard(layer: usize, expert: usize) -> String {
        format!("layer.{layer}.expert.{expert}")
    }
}

enum WeightStorage {
    Dense(Tensor),
    Quantized { tensor: Arc<QTensor>, matmul: QMatMul },
}

/// An opaque reference to one weight buffer, dense or quantized.
pub struct WeightHandle {
    pub name: String,
    pub element_type: ElementType,
    pub layout: Layout,
    storage: WeightStorage,
}

impl WeightHandle {
    pub fn dense(name: impl Into<String>, tensor: Tensor, layout: Layout) -> Result<Self> {
        let element_type = ElementType::from_dense(tensor.dtype()).ok_or_else(|| {
            ModelError::DtypeMismatch {
                expected: DType::F32,
                got: tensor.dtype(),
            }
        })?;
        Ok(Self {
            name: name.into(),
            element_type,
            layout,
            storage: WeightStorage::Dense(tensor),
        })
    }

    pub fn quantized(name: impl Into<String>, tensor: Arc<QTensor>) -> Result<Self> {
        let element_type = match tensor.dtype() {
            GgmlDType::Q4_0 => ElementType::Q4,
            GgmlDType::Q4K => ElementType::Q4k,
            GgmlDType::Q8_0 => ElementType::Q8,
            other => {
                return Err(ModelError::InvalidManifest(format!(
                    "unsupported quantized dtype {other:?}"
                )))
            }
        };
        let matmul = QMatMul::from_arc(tensor.clone())?;
        Ok(Self {
            name: name.into(),
            element_type,
            layout: Layout::Row,
            storage: WeightStorage::Quantized { tensor, matmul },
        })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.storage, WeightStorage::Quantized { .. })
    }

    /// Borrow the dense tensor; fails for quantized storage.
    pub fn tensor(&self) -> Result<&Tensor> {
        match &self.storage {
            WeightStorage::Dense(t) => Ok(t),
            WeightStorage::Quantized { .. } => Err(ModelError::ShapeMismatch {
                expected: format!("dense tensor for '{}'", self.name),
                got: "quantized storage".to_string(),
            }),
        }
    }

    /// A dense copy regardless of storage (norm weights, biases).
    pub fn dense_tensor(&self, device: &Device) -> Result<Tensor> {
        match &self.storage {
            WeightStorage::Dense(t) => Ok(t.clone()),
            WeightStorage::Quantized { tensor, .. } => Ok(tensor.dequantize(device)?),
        }
    }

    /// `x @ w` through the appropriate kernel for this storage.
    pub fn matmul(&self, rec: &mut CommandRecorder, x: &Tensor) -> Result<Tensor> {
        match &self.storage {
            WeightStorage::Dense(w) => {
                let w = if w.dtype() == x.dtype() {
                    w.clone()
                } else {
                    w.to_dtype(x.dtype())?
                };
                Ok(kernels::matmul(rec, x, &w, self.layout)?)
            }
            WeightStorage::Quantized { matmul, .. } => {
                Ok(kernels::quantized_matmul(rec, x, matmul)?)
            }
        }
    }

    /// Approximate resident size in bytes (pool accounting).
    pub fn size_bytes(&self) -> u64 {
        match &self.storage {
            WeightStorage::Dense(t) => {
                (t.elem_count() * self.element_type.dense_size().unwrap_or(4)) as u64
            }
            WeightStorage::Quantized { tensor, .. } => {
                // Block formats average under one byte per element.
                tensor.shape().elem_count() as u64
            }
        }
    }
}

/// Name-keyed registry of weight handles. Owned by the pipeline; insertions
/// after load only happen for lazily materialized experts.
#[derive(Default)]
pub struct WeightRegistry {
    entries: DashMap<String, Arc<WeightHandle>>,
}

impl WeightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<WeightHandle>> {
        self.entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<WeightHandle>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&self, handle: WeightHandle) {
        self.entries.insert(handle.name.clone(), Arc::new(handle));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every handle (shutdown).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.value().size_bytes()).sum()
    }
}

/// External shard source: `load_shard(name) -> bytes`.
///
/// Backed by OPFS in the browser host; here the production implementation is
/// the Hugging Face hub and tests use an in-memory map.
pub trait ShardLoader: Send + Sync {
    fn load_shard(&self, name: &str) -> Result<Vec<u8>>;
}

/// In-memory shard source for tests and embedded models.
#[derive(Default)]
pub struct MemoryShardLoader {
    shards: HashMap<String, Vec<u8>>,
}

impl MemoryShardLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.shards.insert(name.into(), bytes);
    }
}

impl ShardLoader for MemoryShardLoader {
    fn load_shard(&self, name: &str) -> Result<Vec<u8>> {
        self.shards
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::ShardLoadFailed {
                name: name.to_string(),
                reason: "not present in memory loader".to_string(),
            })
    }
}

/// Hugging Face hub shard source. Shard names map onto repo files
/// (`model` -> `model.safetensors`, anything else verbatim).
pub struct HubShardLoader {
    repo_id: String,
}

impl HubShardLoader {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
        }
    }

    fn file_for(name: &str) -> String {
        match name {
            BASE_SHARD => "model.safetensors".to_string(),
            TOKENIZER_SHARD => "tokenizer.json".to_string(),
            other => format!("{other}.safetensors"),
        }
    }
}

impl ShardLoader for HubShardLoader {
    fn load_shard(&self, name: &str) -> Result<Vec<u8>> {
        let map_err = |e: String| ModelError::ShardLoadFailed {
            name: name.to_string(),
            reason: e,
        };
        let api = hf_hub::api::sync::Api::new().map_err(|e| map_err(e.to_string()))?;
        let repo = api.repo(hf_hub::Repo::new(
            self.repo_id.clone(),
            hf_hub::RepoType::Model,
        ));
        let path = repo
            .get(&Self::file_for(name))
            .map_err(|e| map_err(e.to_string()))?;
        std::fs::read(&path).map_err(|e| map_err(e.to_string()))
    }
}

/// Asked to materialize expert weights the first time a layer routes to them.
pub trait ExpertSource: Send + Sync {
    fn ensure_expert_loaded(&self, layer: usize, expert: usize) -> Result<()>;
}

/// Populates the registry from shards and serves on-demand expert loads.
pub struct WeightLoader {
    shards: Arc<dyn ShardLoader>,
    registry: Arc<WeightRegistry>,
    device: Device,
    /// Prefix applied to shard names (draft models live under `draft.`).
    shard_prefix: String,
}

impl WeightLoader {
    pub fn new(
        shards: Arc<dyn ShardLoader>,
        registry: Arc<WeightRegistry>,
        device: Device,
    ) -> Self {
        Self {
            shards,
            registry,
            device,
            shard_prefix: String::new(),
        }
    }

    /// A loader reading the same source under a shard-name prefix.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            shards: self.shards.clone(),
            registry: self.registry.clone(),
            device: self.device.clone(),
            shard_prefix: format!("{}{prefix}", self.shard_prefix),
        }
    }

    pub fn registry(&self) -> &Arc<WeightRegistry> {
        &self.registry
    }

    pub fn shard_source(&self) -> Arc<dyn ShardLoader> {
        self.shards.clone()
    }

    fn shard_name(&self, name: &str) -> String {
        format!("{}{name}", self.shard_prefix)
    }

    pub fn load_raw_shard(&self, name: &str) -> Result<Vec<u8>> {
        self.shards.load_shard(&self.shard_name(name))
    }

    /// Load the base shard into the registry.
    pub fn load_base(&self) -> Result<()> {
        let bytes = self.load_raw_shard(BASE_SHARD)?;
        let count = self.load_shard_bytes(&bytes)?;
        info!("loaded {} base weights", count);
        Ok(())
    }

    /// Parse one shard (safetensors or GGUF, sniffed by magic) and insert
    /// every tensor under its stored name.
    fn load_shard_bytes(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.starts_with(b"GGUF") {
            self.load_gguf(bytes)
        } else {
            self.load_safetensors(bytes)
        }
    }

    fn load_safetensors(&self, bytes: &[u8]) -> Result<usize> {
        let parsed = safetensors::SafeTensors::deserialize(bytes).map_err(|e| {
            ModelError::ShardLoadFailed {
                name: BASE_SHARD.to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut count = 0;
        for (name, view) in parsed.tensors() {
            let tensor = tensor_from_view(&view, &self.device)?;
            self.registry
                .insert(WeightHandle::dense(name, tensor, Layout::Row)?);
            count += 1;
        }
        Ok(count)
    }

    fn load_gguf(&self, bytes: &[u8]) -> Result<usize> {
        let mut cursor = Cursor::new(bytes);
        let content =
            gguf_file::Content::read(&mut cursor).map_err(|e| ModelError::ShardLoadFailed {
                name: BASE_SHARD.to_string(),
                reason: e.to_string(),
            })?;

        let tensor_names: Vec<String> = content.tensor_infos.keys().cloned().collect();
        let mut count = 0;
        for name in tensor_names {
            let qt = content.tensor(&mut cursor, &name, &self.device)?;
            let handle = match qt.dtype() {
                // Norms and biases are stored unquantized inside GGUF.
                GgmlDType::F32 | GgmlDType::F16 => {
                    WeightHandle::dense(name, qt.dequantize(&self.device)?, Layout::Row)?
                }
                GgmlDType::Q4_0 | GgmlDType::Q4K | GgmlDType::Q8_0 => {
                    WeightHandle::quantized(name, Arc::new(qt))?
                }
                other => {
                    debug!("dequantizing unsupported block format {:?} for '{}'", other, name);
                    WeightHandle::dense(name, qt.dequantize(&self.device)?, Layout::Row)?
                }
            };
            self.registry.insert(handle);
            count += 1;
        }
        Ok(count)
    }
}

impl ExpertSource for WeightLoader {
    fn ensure_expert_loaded(&self, layer: usize, expert: usize) -> Result<()> {
        if self.registry.contains(&names::expert(layer, expert, "w1")) {
            return Ok(());
        }
        let shard = names::expert_shard(layer, expert);
        debug!("materializing expert shard '{}'", shard);

        let bytes =
            self.load_raw_shard(&shard)
                .map_err(|e| match e {
                    ModelError::ShardLoadFailed { .. } => ModelError::ExpertLoadFailed { layer, expert },
                    other => other,
                })?;
        self.load_shard_bytes(&bytes)?;

        for part in ["w1", "w2", "w3"] {
            if !self.registry.contains(&names::expert(layer, expert, part)) {
                warn!("expert shard '{}' missing part {}", shard, part);
                return Err(ModelError::ExpertLoadFailed { layer, expert });
            }
        }
        Ok(())
    }
}

/// Convert one safetensors view into a device tensor.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();
    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::F16 => {
            let values: Vec<f16> = data
                .par_chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::BF16 => {
            let values: Vec<bf16> = data
                .par_chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        other => {
            return Err(ModelError::ShardLoadFailed {
                name: "tensor".to_string(),
                reason: format!("unsupported safetensors dtype {other:?}"),
            })
        }
    };
    Ok(tensor)
}

/// Shard construction helpers shared by unit and integration tests.
pub mod testing {
    use super::*;

    struct RawView {
        dtype: safetensors::Dtype,
        shape: Vec<usize>,
        data: Vec<u8>,
    }

    impl safetensors::tensor::View for RawView {
        fn dtype(&self) -> safetensors::Dtype {
            self.dtype
        }
        fn shape(&self) -> &[usize] {
            &self.shape
        }
        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.data)
        }
        fn data_len(&self) -> usize {
            self.data.len()
        }
    }

    /// Builds an f32 safetensors shard from named host tensors.
    #[derive(Default)]
    pub struct ShardBuilder {
        entries: Vec<(String, RawView)>,
    }

    impl ShardBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn tensor(mut self, name: &str, shape: &[usize], data: Vec<f32>) -> Self {
            assert_eq!(shape.iter().product::<usize>(), data.len());
            let bytes = data.iter().flat_map(|f| f.to_le_bytes()).collect();
            self.entries.push((
                name.to_string(),
                RawView {
                    dtype: safetensors::Dtype::F32,
                    shape: shape.to_vec(),
                    data: bytes,
                },
            ));
            self
        }

        pub fn build(self) -> Vec<u8> {
            safetensors::serialize(self.entries, &None).expect("serialize test shard")
        }
    }
}
