//! Buffer pool - centralized accounting for device memory
//!
//! Single source of truth for device memory within one runtime.
//! Handles allocation tracking, pressure reporting and cost-aware eviction
//! suggestions. The pool is owned by a [`Runtime`](crate::Runtime) and passed
//! down explicitly; it is not a process singleton.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::RuntimeError;

/// What a pooled buffer holds (drives the eviction strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferKind {
    /// Model weights - expensive to reload, keep resident.
    Weights,
    /// KV cache storage - cheap to rebuild but hot.
    KvCache,
    /// Per-forward-pass scratch, released by the recorder.
    Transient,
    /// Other/unknown.
    Other,
}

/// Memory allocation record.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub id: String,
    pub kind: BufferKind,
    pub bytes: u64,
    pub last_used: Instant,
    /// Higher = less likely to evict.
    pub priority: f32,
    /// Time it took to materialize this buffer (for eviction scoring).
    pub load_cost_ms: u64,
}

/// Pool status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_bytes: u64,
    pub allocated_bytes: u64,
    pub available_bytes: u64,
    /// 0.0 - 1.0
    pub pressure: f32,
    pub allocation_count: usize,
}

/// Outcome of an allocation request.
#[derive(Debug)]
pub enum PoolGrant {
    Granted,
    /// Caller must release the suggested ids before retrying.
    NeedEviction { suggested_victims: Vec<String> },
}

/// Device memory pool.
///
/// Thread-safe via interior mutability; acquisitions and releases must be
/// paired, which the command recorder enforces for transient buffers.
pub struct BufferPool {
    total_bytes: u64,
    entries: Mutex<HashMap<String, PoolEntry>>,
    eviction_threshold: f32,
}

impl BufferPool {
    /// `total_bytes = 0` selects a conservative 8 GiB default.
    pub fn new(total_bytes: u64, eviction_threshold: f32) -> Self {
        let total = if total_bytes == 0 {
            8 * 1024 * 1024 * 1024
        } else {
            total_bytes
        };
        Self {
            total_bytes: total,
            entries: Mutex::new(HashMap::new()),
            eviction_threshold,
        }
    }

    /// Request an allocation. Re-requesting a live id refreshes its
    /// last-used stamp instead of double-counting.
    pub fn acquire(
        &self,
        id: &str,
        kind: BufferKind,
        bytes: u64,
        priority: f32,
        load_cost_ms: u64,
    ) -> Result<PoolGrant, RuntimeError> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get_mut(id) {
            existing.last_used = Instant::now();
            return Ok(PoolGrant::Granted);
        }

        let current: u64 = entries.values().map(|e| e.bytes).sum();
        if current + bytes <= self.total_bytes {
            entries.insert(
                id.to_string(),
                PoolEntry {
                    id: id.to_string(),
                    kind,
                    bytes,
                    last_used: Instant::now(),
                    priority,
                    load_cost_ms,
                },
            );
            return Ok(PoolGrant::Granted);
        }

        let needed = current + bytes - self.total_bytes;
        let victims = Self::eviction_candidates(&entries, needed);
        if victims.is_empty() {
            return Err(RuntimeError::BufferAllocationFailed {
                id: id.to_string(),
                bytes,
                reason: format!(
                    "{} bytes available, no evictable buffers",
                    self.total_bytes - current
                ),
            });
        }
        Ok(PoolGrant::NeedEviction {
            suggested_victims: victims,
        })
    }

    /// Release an allocation, returning its record if it existed.
    pub fn release(&self, id: &str) -> Option<PoolEntry> {
        self.entries.lock().remove(id)
    }

    /// Refresh an allocation's last-used stamp.
    pub fn touch(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> PoolStatus {
        let entries = self.entries.lock();
        let allocated: u64 = entries.values().map(|e| e.bytes).sum();
        PoolStatus {
            total_bytes: self.total_bytes,
            allocated_bytes: allocated,
            available_bytes: self.total_bytes.saturating_sub(allocated),
            pressure: allocated as f32 / self.total_bytes as f32,
            allocation_count: entries.len(),
        }
    }

    pub fn should_evict(&self) -> bool {
        self.status().pressure >= self.eviction_threshold
    }

    /// Live transient ids - used by tests to assert acquire/release pairing.
    pub fn live_transients(&self) -> Vec<String> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.kind == BufferKind::Transient)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Pick eviction victims using LRU + priority + reload cost.
    ///
    /// score = (age_seconds * kind_weight) / (priority * 10 * reload_cost_weight)
    /// Transient scratch scores highest, weights lowest.
    fn eviction_candidates(entries: &HashMap<String, PoolEntry>, needed: u64) -> Vec<String> {
        let mut candidates: Vec<_> = entries.values().filter(|e| e.priority < 0.9).collect();

        candidates.sort_by(|a, b| {
            let sa = Self::eviction_score(a);
            let sb = Self::eviction_score(b);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut victims = Vec::new();
        let mut freed = 0u64;
        for candidate in candidates {
            if freed >= needed {
                break;
            }
            victims.push(candidate.id.clone());
            freed += candidate.bytes;
        }
        if freed < needed {
            victims.clear();
        }
        victims
    }

    fn eviction_score(entry: &PoolEntry) -> f32 {
        let age = entry.last_used.elapsed().as_secs_f32();
        let kind_weight = match entry.kind {
            BufferKind::Transient => 4.0,
            BufferKind::KvCache => 1.0,
            BufferKind::Weights => 0.3,
            BufferKind::Other => 1.0,
        };
        let reload_cost = 1.0 + (entry.load_cost_ms as f32 / 1000.0);
        // age starts at 0 for fresh entries; the +0.01 keeps fresh transients
        // rankable ahead of fresh weights.
        ((age + 0.01) * kind_weight) / (entry.priority.max(0.01) * 10.0 * reload_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_acquire_release() {
        let pool = BufferPool::new(1000, 0.8);

        let grant = pool
            .acquire("kv.layer0", BufferKind::KvCache, 100, 0.5, 0)
            .unwrap();
        assert!(matches!(grant, PoolGrant::Granted));

        let status = pool.status();
        assert_eq!(status.allocated_bytes, 100);
        assert_eq!(status.available_bytes, 900);

        let released = pool.release("kv.layer0").unwrap();
        assert_eq!(released.bytes, 100);
        assert_eq!(pool.status().allocated_bytes, 0);
    }

    #[test]
    fn test_reacquire_does_not_double_count() {
        let pool = BufferPool::new(1000, 0.8);
        pool.acquire("embed", BufferKind::Weights, 400, 0.95, 5000)
            .unwrap();
        pool.acquire("embed", BufferKind::Weights, 400, 0.95, 5000)
            .unwrap();
        assert_eq!(pool.status().allocated_bytes, 400);
        assert_eq!(pool.status().allocation_count, 1);
    }

    #[test]
    fn test_eviction_prefers_transients_over_weights() {
        let pool = BufferPool::new(200, 0.8);

        pool.acquire("weights", BufferKind::Weights, 100, 0.5, 7000)
            .unwrap();
        pool.acquire("scratch", BufferKind::Transient, 100, 0.5, 0)
            .unwrap();

        let grant = pool
            .acquire("more-scratch", BufferKind::Transient, 50, 0.5, 0)
            .unwrap();
        match grant {
            PoolGrant::NeedEviction { suggested_victims } => {
                assert!(suggested_victims.contains(&"scratch".to_string()));
                assert!(!suggested_victims.contains(&"weights".to_string()));
            }
            PoolGrant::Granted => panic!("expected NeedEviction"),
        }
    }

    #[test]
    fn test_denied_when_nothing_evictable() {
        let pool = BufferPool::new(100, 0.8);
        pool.acquire("pinned", BufferKind::Weights, 100, 0.95, 7000)
            .unwrap();

        let err = pool
            .acquire("big", BufferKind::Other, 50, 0.5, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::BufferAllocationFailed { .. }
        ));
    }
}
