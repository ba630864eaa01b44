//! Sliding-window KV layout: ring buffer of the last `W` positions.
//!
//! Storage is a contiguous `[W, kv_dim]` buffer addressed by `pos mod W`.
//! The absolute position keeps increasing monotonically so RoPE stays
//! indexed at absolute positions.

use candle_core::{DType, Device, Tensor};

use crate::{ModelError, Result};

pub(super) struct WindowLayer {
    k: Tensor,
    v: Tensor,
    window: usize,
    /// Absolute number of positions seen.
    total: usize,
}

impl WindowLayer {
    pub fn new(window: usize, kv_dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            k: Tensor::zeros((window, kv_dim), dtype, device)?,
            v: Tensor::zeros((window, kv_dim), dtype, device)?,
            window,
            total: 0,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Stored length: `min(W, total_seen)`.
    pub fn stored(&self) -> usize {
        self.total.min(self.window)
    }

    /// Absolute position of the oldest stored row.
    pub fn first_pos(&self) -> usize {
        self.total - self.stored()
    }

    pub fn write(&mut self, k: &Tensor, v: &Tensor, start: usize) -> Result<()> {
        let mut n = k.dim(0)?;
        let mut start = start;
        let (mut k, mut v) = (k.clone(), v.clone());

        // Only the last W rows of an oversized write can survive.
        if n > self.window {
            let skip = n - self.window;
            k = k.narrow(0, skip, self.window)?;
            v = v.narrow(0, skip, self.window)?;
            start += skip;
            n = self.window;
        }

        // At most two ring segments.
        let slot = start % self.window;
        let first = n.min(self.window - slot);
        self.k.slice_set(&k.narrow(0, 0, first)?, 0, slot)?;
        self.v.slice_set(&v.narrow(0, 0, first)?, 0, slot)?;
        if first < n {
            self.k.slice_set(&k.narrow(0, first, n - first)?, 0, 0)?;
            self.v.slice_set(&v.narrow(0, first, n - first)?, 0, 0)?;
        }

        self.total = self.total.max(start + n);
        Ok(())
    }

    /// Read absolute positions `[start, end)` in chronological order.
    pub fn read(&self, start: usize, end: usize) -> Result<(Tensor, Tensor)> {
        if start > end || end > self.total || start < self.first_pos() {
            return Err(ModelError::CacheRange {
                start,
                end,
                len: self.total,
            });
        }

        let n = end - start;
        let slot = start % self.window;
        let first = n.min(self.window - slot);

        if first == n {
            Ok((
                self.k.narrow(0, slot, n)?.copy()?,
                self.v.narrow(0, slot, n)?.copy()?,
            ))
        } else {
            let k = Tensor::cat(
                &[
                    &self.k.narrow(0, slot, first)?,
                    &self.k.narrow(0, 0, n - first)?,
                ],
                0,
            )?;
            let v = Tensor::cat(
                &[
                    &self.v.narrow(0, slot, first)?,
                    &self.v.narrow(0, 0, n - first)?,
                ],
                0,
            )?;
            Ok((k, v))
        }
    }

    /// Raw ring buffers (positions re-mapped `p -> p mod W`).
    pub fn buffers(&self) -> (Tensor, Tensor) {
        (self.k.clone(), self.v.clone())
    }

    pub fn truncate(&mut self, new_len: usize) {
        self.total = self.total.min(new_len);
    }

    pub fn clear(&mut self) {
        self.total = 0;
    }
}
