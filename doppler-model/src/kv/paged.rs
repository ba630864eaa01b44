//! Paged KV layout: host pages of `page_size` positions, allocated on write.

use candle_core::{DType, Device, Tensor};

use crate::{ModelError, Result};

pub(super) struct PagedLayer {
    page_size: usize,
    kv_dim: usize,
    dtype: DType,
    k_pages: Vec<Tensor>,
    v_pages: Vec<Tensor>,
    len: usize,
}

impl PagedLayer {
    pub fn new(page_size: usize, kv_dim: usize, dtype: DType) -> Self {
        Self {
            page_size,
            kv_dim,
            dtype,
            k_pages: Vec::new(),
            v_pages: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn ensure_pages(&mut self, last_position: usize) -> Result<()> {
        let needed = last_position / self.page_size + 1;
        while self.k_pages.len() < needed {
            self.k_pages.push(Tensor::zeros(
                (self.page_size, self.kv_dim),
                self.dtype,
                &Device::Cpu,
            )?);
            self.v_pages.push(Tensor::zeros(
                (self.page_size, self.kv_dim),
                self.dtype,
                &Device::Cpu,
            )?);
        }
        Ok(())
    }

    pub fn write(&mut self, k: &Tensor, v: &Tensor, start: usize) -> Result<()> {
        let n = k.dim(0)?;
        let end = start + n;
        self.ensure_pages(end - 1)?;

        let mut pos = start;
        while pos < end {
            let page = pos / self.page_size;
            let local = pos % self.page_size;
            let count = (self.page_size - local).min(end - pos);

            let k_chunk = k.narrow(0, pos - start, count)?;
            let v_chunk = v.narrow(0, pos - start, count)?;
            self.k_pages[page].slice_set(&k_chunk, 0, local)?;
            self.v_pages[page].slice_set(&v_chunk, 0, local)?;

            pos += count;
        }
        self.len = self.len.max(end);
        Ok(())
    }

    /// Materialize positions `[start, end)` into fresh contiguous buffers.
    pub fn read(&self, start: usize, end: usize) -> Result<(Tensor, Tensor)> {
        if start > end || end > self.len {
            return Err(ModelError::CacheRange {
                start,
                end,
                len: self.len,
            });
        }

        let mut k_chunks = Vec::new();
        let mut v_chunks = Vec::new();
        let mut pos = start;
        while pos < end {
            let page = pos / self.page_size;
            let local = pos % self.page_size;
            let count = (self.page_size - local).min(end - pos);
            k_chunks.push(self.k_pages[page].narrow(0, local, count)?);
            v_chunks.push(self.v_pages[page].narrow(0, local, count)?);
            pos += count;
        }

        let k_refs: Vec<&Tensor> = k_chunks.iter().collect();
        let v_refs: Vec<&Tensor> = v_chunks.iter().collect();
        Ok((Tensor::cat(&k_refs, 0)?, Tensor::cat(&v_refs, 0)?))
    }

    pub fn truncate(&mut self, new_len: usize) {
        if new_len < self.len {
            self.len = new_len;
            let keep = if new_len == 0 {
                0
            } else {
                (new_len - 1) / self.page_size + 1
            };
            self.k_pages.truncate(keep);
            self.v_pages.truncate(keep);
        }
    }

    pub fn clear(&mut self) {
        self.k_pages.clear();
        self.v_pages.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize, value: f32) -> Tensor {
        Tensor::full(value, (n, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pages_allocated_lazily() {
        let mut layer = PagedLayer::new(4, 2, DType::F32);
        assert_eq!(layer.k_pages.len(), 0);

        layer.write(&rows(1, 1.0), &rows(1, 1.0), 0).unwrap();
        assert_eq!(layer.k_pages.len(), 1);

        // A write landing in page 2 allocates pages 0..=2.
        layer.write(&rows(1, 2.0), &rows(1, 2.0), 9).unwrap();
        assert_eq!(layer.k_pages.len(), 3);
    }

    #[test]
    fn test_write_spanning_pages() {
        let mut layer = PagedLayer::new(4, 2, DType::F32);
        let k = Tensor::from_vec(
            (0..12).map(|i| i as f32).collect::<Vec<_>>(),
            (6, 2),
            &Device::Cpu,
        )
        .unwrap();
        layer.write(&k, &k, 2).unwrap();
        assert_eq!(layer.len(), 8);

        let (got, _) = layer.read(2, 8).unwrap();
        assert_eq!(got.to_vec2::<f32>().unwrap(), k.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_truncate_drops_tail_pages() {
        let mut layer = PagedLayer::new(4, 2, DType::F32);
        layer.write(&rows(10, 1.0), &rows(10, 1.0), 0).unwrap();
        assert_eq!(layer.k_pages.len(), 3);

        layer.truncate(4);
        assert_eq!(layer.len(), 4);
        assert_eq!(layer.k_pages.len(), 1);
    }
}
