//! Device acquisition and the process runtime handle.

use candle_core::Device;
use tracing::info;

use crate::pool::BufferPool;
use crate::recorder::CommandRecorder;
use crate::{Result, RuntimeError};

/// How often the no-recorder fallback synchronizes the device.
///
/// Batching syncs prevents command-buffer buildup on Metal without paying a
/// full round-trip per kernel.
pub const DEFAULT_SYNC_INTERVAL: usize = 16;

/// The shared GPU runtime: device + buffer pool + submit policy.
///
/// Constructed once and passed to every component. Tests use [`Runtime::cpu`].
pub struct Runtime {
    device: Device,
    pool: BufferPool,
    sync_interval: usize,
}

impl Runtime {
    /// Acquire the best available device: CUDA, then Metal, then CPU.
    pub fn new() -> Result<Self> {
        let device = select_best_device();
        info!("runtime device: {:?}", device);
        Ok(Self::with_device(device))
    }

    pub fn with_device(device: Device) -> Self {
        Self {
            device,
            pool: BufferPool::new(0, 0.8),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// CPU-only runtime for tests and CPU-shadow work.
    pub fn cpu() -> Self {
        Self::with_device(Device::Cpu)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self.device, Device::Cpu)
    }

    /// Fail when a GPU-only path is requested on a CPU runtime.
    pub fn require_gpu(&self) -> Result<()> {
        if self.is_gpu() {
            Ok(())
        } else {
            Err(RuntimeError::GpuUnavailable(
                "no Metal or CUDA device acquired".to_string(),
            ))
        }
    }

    /// Block until all submitted work completed. No-op on CPU.
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }

    pub fn sync_interval(&self) -> usize {
        self.sync_interval
    }

    /// Start a recorder that submits once, at the end of a forward pass.
    pub fn recorder(&self) -> CommandRecorder<'_> {
        CommandRecorder::batched(self)
    }

    /// Start a fallback recorder that synchronizes every
    /// [`sync_interval`](Self::sync_interval) kernels. Slower, easier to debug.
    pub fn immediate_recorder(&self) -> CommandRecorder<'_> {
        CommandRecorder::immediate(self)
    }
}

fn select_best_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_runtime() {
        let runtime = Runtime::cpu();
        assert!(!runtime.is_gpu());
        assert!(runtime.require_gpu().is_err());
        runtime.synchronize().unwrap();
    }
}
