//! Command recorder - batches kernel submissions per forward pass
//!
//! Kernels record onto the active recorder; the device is synchronized exactly
//! once when the pass submits. Transient pool buffers are bound to the
//! recorder and released on every exit path (submit, error, drop).

use tracing::warn;

use crate::device::Runtime;
use crate::pool::{BufferKind, PoolGrant};
use crate::Result;

/// Accumulates GPU commands for one forward pass.
///
/// In batched mode nothing synchronizes until [`submit_and_wait`]
/// (`submit_and_wait`); the immediate fallback synchronizes every
/// `sync_interval` recorded kernels instead.
///
/// [`submit_and_wait`]: CommandRecorder::submit_and_wait
pub struct CommandRecorder<'a> {
    runtime: &'a Runtime,
    recorded: usize,
    transients: Vec<String>,
    batched: bool,
    submitted: bool,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn batched(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            recorded: 0,
            transients: Vec::new(),
            batched: true,
            submitted: false,
        }
    }

    pub(crate) fn immediate(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            recorded: 0,
            transients: Vec::new(),
            batched: false,
            submitted: false,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    /// Count one recorded kernel. The immediate fallback synchronizes every
    /// `sync_interval` kernels.
    pub fn record(&mut self) -> Result<()> {
        self.recorded += 1;
        if !self.batched && self.recorded % self.runtime.sync_interval() == 0 {
            self.runtime.synchronize()?;
        }
        Ok(())
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Bind a transient pool buffer to this recorder's lifetime.
    pub fn bind_transient(&mut self, id: &str, bytes: u64) -> Result<()> {
        match self
            .runtime
            .pool()
            .acquire(id, BufferKind::Transient, bytes, 0.3, 0)?
        {
            PoolGrant::Granted => {
                self.transients.push(id.to_string());
                Ok(())
            }
            PoolGrant::NeedEviction { suggested_victims } => {
                // Transients are released by their owning recorders; stale ones
                // indicate an unbalanced acquire somewhere upstream.
                warn!(
                    "transient '{}' blocked on eviction of {:?}",
                    id, suggested_victims
                );
                for victim in &suggested_victims {
                    self.runtime.pool().release(victim);
                }
                self.runtime
                    .pool()
                    .acquire(id, BufferKind::Transient, bytes, 0.3, 0)?;
                self.transients.push(id.to_string());
                Ok(())
            }
        }
    }

    fn release_transients(&mut self) {
        for id in self.transients.drain(..) {
            self.runtime.pool().release(&id);
        }
    }

    /// Submit everything recorded so far and wait for completion.
    /// Transient buffers are released afterwards.
    pub fn submit_and_wait(mut self) -> Result<usize> {
        self.runtime.synchronize()?;
        self.release_transients();
        self.submitted = true;
        Ok(self.recorded)
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        // Discard path: a failed pass drops its recorder without submitting.
        if !self.submitted {
            self.release_transients();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_releases_transients() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();
        rec.bind_transient("scratch.hidden", 1024).unwrap();
        rec.record().unwrap();
        assert_eq!(runtime.pool().live_transients().len(), 1);

        let recorded = rec.submit_and_wait().unwrap();
        assert_eq!(recorded, 1);
        assert!(runtime.pool().live_transients().is_empty());
    }

    #[test]
    fn test_drop_without_submit_releases_transients() {
        let runtime = Runtime::cpu();
        {
            let mut rec = runtime.recorder();
            rec.bind_transient("scratch.attn", 2048).unwrap();
            // Simulated failure: recorder dropped without submit.
        }
        assert!(runtime.pool().live_transients().is_empty());
    }

    #[test]
    fn test_immediate_mode_counts_kernels() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.immediate_recorder();
        for _ in 0..40 {
            rec.record().unwrap();
        }
        assert_eq!(rec.recorded(), 40);
        rec.submit_and_wait().unwrap();
    }
}
