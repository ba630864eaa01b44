//! Layer-indexed KV cache
//!
//! Per-layer K/V storage in three layouts: contiguous (preallocated),
//! paged (lazily allocated host pages), and sliding window (ring buffer of
//! the last W positions). GPU-resident with a CPU fork for speculative
//! rollback. Reads copy by default; the attention hot path uses
//! [`KvCache::attention_view`], whose slices are read-only until the next
//! update.
//!
//! Recorded updates are staged, not applied: `record_update` validates and
//! buffers the write, and the buffers only reach the layer stores (and
//! `seq_len`) through [`KvCache::commit_recorded`], called once the pass's
//! recorder has submitted. A failed pass discards the staged writes, so the
//! cache always holds the state of the last successfully completed token.

mod contiguous;
mod paged;
mod window;

use candle_core::{DType, Device, Tensor};
use doppler_runtime::CommandRecorder;

use contiguous::ContiguousLayer;
use paged::PagedLayer;
use window::WindowLayer;

use crate::{ModelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    Contiguous,
    Paged { page_size: usize },
    SlidingWindow { window: usize },
}

#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    pub num_layers: usize,
    pub max_seq_len: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub layout: KvLayout,
}

impl KvCacheConfig {
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Resident bytes for one fully-allocated layer pair (pool accounting).
    pub fn layer_bytes(&self) -> u64 {
        let rows = match self.layout {
            KvLayout::SlidingWindow { window } => window.min(self.max_seq_len),
            _ => self.max_seq_len,
        };
        (2 * rows * self.kv_dim() * self.dtype.size_in_bytes()) as u64
    }
}

enum LayerStore {
    Contiguous(ContiguousLayer),
    Paged(PagedLayer),
    Window(WindowLayer),
}

/// A validated write waiting for its pass to commit.
struct PendingWrite {
    layer: usize,
    k: Tensor,
    v: Tensor,
    start_pos: usize,
}

/// Chronologically ordered K/V for one layer, plus the absolute position of
/// the first returned row.
pub struct AttentionView {
    pub k: Tensor,
    pub v: Tensor,
    pub first_pos: usize,
}

pub struct KvCache {
    config: KvCacheConfig,
    device: Device,
    layers: Vec<LayerStore>,
    seq_len: usize,
    pending: Vec<PendingWrite>,
}

impl KvCache {
    pub fn new(config: KvCacheConfig, device: &Device) -> Result<Self> {
        let kv_dim = config.kv_dim();
        let mut layers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            let store = match config.layout {
                KvLayout::Contiguous => LayerStore::Contiguous(ContiguousLayer::new(
                    config.max_seq_len,
                    kv_dim,
                    config.dtype,
                    device,
                )?),
                KvLayout::Paged { page_size } => {
                    LayerStore::Paged(PagedLayer::new(page_size, kv_dim, config.dtype))
                }
                KvLayout::SlidingWindow { window } => LayerStore::Window(WindowLayer::new(
                    window,
                    kv_dim,
                    config.dtype,
                    device,
                )?),
            };
            layers.push(store);
        }
        Ok(Self {
            config,
            device: device.clone(),
            layers,
            seq_len: 0,
            pending: Vec::new(),
        })
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Tokens currently valid, tracked at the last layer.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn layer_len(&self, layer: usize) -> usize {
        match &self.layers[layer] {
            LayerStore::Contiguous(l) => l.len(),
            LayerStore::Paged(l) => l.len(),
            LayerStore::Window(l) => l.total(),
        }
    }

    /// Copy `n` token rows into layer `layer` at positions
    /// `[start_pos, start_pos + n)`, submitting immediately.
    pub fn update(&mut self, layer: usize, k: &Tensor, v: &Tensor, start_pos: usize) -> Result<()> {
        let (k, v) = self.validate(layer, k, v, start_pos)?;
        self.apply(layer, &k, &v, start_pos)
    }

    /// Same as [`update`](Self::update) but the copies are recorded against
    /// the surrounding forward pass: the write is validated and staged, and
    /// only lands through [`commit_recorded`](Self::commit_recorded) once the
    /// recorder has submitted. Discarding the recorder (the failure path)
    /// leaves the stores untouched.
    pub fn record_update(
        &mut self,
        rec: &mut CommandRecorder,
        layer: usize,
        k: &Tensor,
        v: &Tensor,
        start_pos: usize,
    ) -> Result<()> {
        let (k, v) = self.validate(layer, k, v, start_pos)?;
        // One buffer-to-buffer copy per tensor.
        rec.record()?;
        rec.record()?;
        self.pending.push(PendingWrite {
            layer,
            k,
            v,
            start_pos,
        });
        Ok(())
    }

    /// Apply every staged write in record order. Called once per forward
    /// pass, after `submit_and_wait` succeeds.
    pub fn commit_recorded(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for write in pending {
            self.apply(write.layer, &write.k, &write.v, write.start_pos)?;
        }
        Ok(())
    }

    /// Drop staged writes without applying them (failed or abandoned pass).
    pub fn discard_recorded(&mut self) {
        self.pending.clear();
    }

    /// Staged writes awaiting commit.
    pub fn pending_recorded(&self) -> usize {
        self.pending.len()
    }

    /// Bounds, shape, dtype and device checks for an incoming write; the
    /// returned tensors are converted and device-resident.
    fn validate(
        &self,
        layer: usize,
        k: &Tensor,
        v: &Tensor,
        start_pos: usize,
    ) -> Result<(Tensor, Tensor)> {
        let n = k.dim(0)?;
        let end = start_pos + n;
        if end > self.config.max_seq_len {
            return Err(ModelError::CacheOverflow {
                start: start_pos,
                end,
                max: self.config.max_seq_len,
            });
        }
        let host_only = matches!(self.layers[layer], LayerStore::Paged(_));
        Ok((self.prepare(k, n, host_only)?, self.prepare(v, n, host_only)?))
    }

    fn apply(&mut self, layer: usize, k: &Tensor, v: &Tensor, start_pos: usize) -> Result<()> {
        let end = start_pos + k.dim(0)?;
        match &mut self.layers[layer] {
            LayerStore::Contiguous(l) => l.write(k, v, start_pos)?,
            LayerStore::Paged(l) => l.write(k, v, start_pos)?,
            LayerStore::Window(l) => l.write(k, v, start_pos)?,
        }
        // Mid-layer writes stay invisible until the last layer lands.
        if layer == self.config.num_layers - 1 {
            self.seq_len = self.seq_len.max(end);
        }
        Ok(())
    }

    /// Validate shape/dtype/device of an incoming K or V block.
    fn prepare(&self, src: &Tensor, n: usize, host_only: bool) -> Result<Tensor> {
        let kv_dim = self.config.kv_dim();
        if src.dims() != [n, kv_dim] {
            return Err(ModelError::ShapeMismatch {
                expected: format!("[{n}, {kv_dim}]"),
                got: format!("{:?}", src.dims()),
            });
        }

        if host_only && !matches!(src.device(), Device::Cpu) {
            return Err(ModelError::PagedHostOnly);
        }

        let src = if src.dtype() == self.config.dtype {
            src.clone()
        } else if matches!(src.device(), Device::Cpu) && src.dtype() == DType::F32 {
            // Host f32 converts at the boundary; device buffers never cast
            // silently.
            src.to_dtype(self.config.dtype)?
        } else {
            return Err(ModelError::DtypeMismatch {
                expected: self.config.dtype,
                got: src.dtype(),
            });
        };

        Ok(src.to_device(&self.device)?)
    }

    /// Copy-on-read view of committed positions `[start, end)`.
    pub fn get(&self, layer: usize, start: usize, end: usize) -> Result<(Tensor, Tensor)> {
        match &self.layers[layer] {
            LayerStore::Contiguous(l) => l.read(start, end),
            LayerStore::Paged(l) => l.read(start, end),
            LayerStore::Window(l) => l.read(start, end),
        }
    }

    /// Raw layer buffers for fused kernels, plus the valid length. The
    /// sliding-window variant re-maps positions `p -> p mod W` inside the
    /// same buffer; paged layers materialize a contiguous copy.
    pub fn gpu_buffers(&self, layer: usize) -> Result<(Tensor, Tensor, usize)> {
        match &self.layers[layer] {
            LayerStore::Contiguous(l) => {
                let (k, v) = l.buffers();
                Ok((k, v, l.len()))
            }
            LayerStore::Window(l) => {
                let (k, v) = l.buffers();
                Ok((k, v, l.stored()))
            }
            LayerStore::Paged(l) => {
                let (k, v) = l.read(0, l.len())?;
                let len = l.len();
                Ok((k, v, len))
            }
        }
    }

    /// Committed K/V in chronological order for the attention kernel.
    /// Slices may alias the underlying buffers; treat them as read-only
    /// until the next update.
    pub fn attention_view(&self, layer: usize) -> Result<AttentionView> {
        match &self.layers[layer] {
            LayerStore::Contiguous(l) => {
                let len = l.len();
                if len == 0 {
                    return Err(ModelError::CacheRange { start: 0, end: 0, len });
                }
                let (k, v) = l.view()?;
                Ok(AttentionView { k, v, first_pos: 0 })
            }
            LayerStore::Paged(l) => {
                let len = l.len();
                if len == 0 {
                    return Err(ModelError::CacheRange { start: 0, end: 0, len });
                }
                let (k, v) = l.read(0, len)?;
                Ok(AttentionView { k, v, first_pos: 0 })
            }
            LayerStore::Window(l) => {
                let stored = l.stored();
                if stored == 0 {
                    return Err(ModelError::CacheRange { start: 0, end: 0, len: 0 });
                }
                let first = l.first_pos();
                let (k, v) = l.read(first, l.total())?;
                Ok(AttentionView { k, v, first_pos: first })
            }
        }
    }

    /// Drop all cached tokens (staged writes included), keeping buffers
    /// allocated.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            match layer {
                LayerStore::Contiguous(l) => l.clear(),
                LayerStore::Paged(l) => l.clear(),
                LayerStore::Window(l) => l.clear(),
            }
        }
        self.pending.clear();
        self.seq_len = 0;
    }

    /// Roll back to the first `new_len` committed tokens; staged writes are
    /// discarded.
    pub fn truncate(&mut self, new_len: usize) -> Result<()> {
        self.pending.clear();
        for layer in &mut self.layers {
            match layer {
                LayerStore::Contiguous(l) => l.truncate(new_len),
                LayerStore::Paged(l) => l.truncate(new_len),
                LayerStore::Window(l) => l.truncate(new_len),
            }
        }
        self.seq_len = self.seq_len.min(new_len);
        Ok(())
    }

    /// CPU-resident contiguous clone of the committed state; the
    /// speculative draft's sandbox. Staged writes are not carried over.
    pub fn fork(&self) -> Result<KvCache> {
        let config = KvCacheConfig {
            layout: KvLayout::Contiguous,
            ..self.config.clone()
        };
        let mut clone = KvCache::new(config, &Device::Cpu)?;
        for layer in 0..self.config.num_layers {
            let len = self.layer_len(layer);
            if len == 0 {
                continue;
            }
            let (first, k, v) = match &self.layers[layer] {
                LayerStore::Window(l) => {
                    let first = l.first_pos();
                    let (k, v) = l.read(first, l.total())?;
                    (first, k, v)
                }
                _ => {
                    let (k, v) = self.get(layer, 0, len)?;
                    (0, k, v)
                }
            };
            let k = k.to_dtype(self.config.dtype)?.to_device(&Device::Cpu)?;
            let v = v.to_dtype(self.config.dtype)?.to_device(&Device::Cpu)?;
            match &mut clone.layers[layer] {
                LayerStore::Contiguous(l) => l.write(&k, &v, first)?,
                _ => unreachable!("fork produces contiguous layers"),
            }
        }
        clone.seq_len = self.seq_len;
        Ok(clone)
    }

    /// Release all storage. The cache is unusable afterwards.
    pub fn destroy(&mut self) {
        self.layers.clear();
        self.pending.clear();
        self.seq_len = 0;
    }
}
