//! Contiguous KV layout: preallocated `[max_seq_len, kv_dim]` per layer.

use candle_core::{DType, Device, Tensor};

use crate::{ModelError, Result};

pub(super) struct ContiguousLayer {
    k: Tensor,
    v: Tensor,
    len: usize,
}

impl ContiguousLayer {
    pub fn new(max_seq_len: usize, kv_dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            k: Tensor::zeros((max_seq_len, kv_dim), dtype, device)?,
            v: Tensor::zeros((max_seq_len, kv_dim), dtype, device)?,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn write(&mut self, k: &Tensor, v: &Tensor, start: usize) -> Result<()> {
        let n = k.dim(0)?;
        self.k.slice_set(k, 0, start)?;
        self.v.slice_set(v, 0, start)?;
        self.len = self.len.max(start + n);
        Ok(())
    }

    pub fn read(&self, start: usize, end: usize) -> Result<(Tensor, Tensor)> {
        if start > end || end > self.len {
            return Err(ModelError::CacheRange {
                start,
                end,
                len: self.len,
            });
        }
        let n = end - start;
        Ok((
            self.k.narrow(0, start, n)?.copy()?,
            self.v.narrow(0, start, n)?.copy()?,
        ))
    }

    /// Aliasing view of the valid prefix (attention hot path).
    pub fn view(&self) -> Result<(Tensor, Tensor)> {
        Ok((
            self.k.narrow(0, 0, self.len)?,
            self.v.narrow(0, 0, self.len)?,
        ))
    }

    /// Raw full-size buffers.
    pub fn buffers(&self) -> (Tensor, Tensor) {
        (self.k.clone(), self.v.clone())
    }

    pub fn truncate(&mut self, new_len: usize) {
        self.len = self.len.min(new_len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
