//! Synchronization primitives.
//!
//! A [`Fence`] lets the CPU observe GPU completion; waiting on it is the only
//! place the frame loop blocks. A [`Semaphore`] orders queue operations
//! against each other and is never observed by the CPU.

use ash::vk;

use crate::device::Device;
use crate::error::{GpuResultExt, Result};

/// CPU-observable completion flag.
#[derive(Debug)]
pub struct Fence {
    raw: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        let raw = device.backend().create_fence(signaled)?;
        Ok(Self { raw })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::Fence {
        self.raw
    }

    /// Block until the GPU signals this fence.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_signal_from_gpu(&self, device: &Device) {
        device
            .backend()
            .wait_for_fences(&[self.raw], u64::MAX)
            .or_fatal("fence wait");
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self, device: &Device) {
        device
            .backend()
            .reset_fences(&[self.raw])
            .or_fatal("fence reset");
    }

    /// Poll without blocking.
    pub fn is_signaled(&self, device: &Device) -> bool {
        device
            .backend()
            .fence_signaled(self.raw)
            .or_fatal("fence status")
    }

    /// Destroy the fence.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_fence(self.raw);
    }
}

/// Block until every fence in `fences` is signaled.
pub fn wait_all(device: &Device, fences: &[&Fence]) {
    if fences.is_empty() {
        return;
    }
    let raw: Vec<_> = fences.iter().map(|f| f.raw).collect();
    device
        .backend()
        .wait_for_fences(&raw, u64::MAX)
        .or_fatal("fence wait");
}

/// GPU-side ordering primitive between submissions.
#[derive(Debug)]
pub struct Semaphore {
    raw: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn new(device: &Device) -> Result<Self> {
        let raw = device.backend().create_semaphore()?;
        Ok(Self { raw })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    /// Destroy the semaphore.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_semaphore(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use std::sync::Arc;

    fn device() -> Device {
        Device::new(Arc::new(HeadlessBackend::default()))
    }

    #[test]
    fn fence_lifecycle() {
        let device = device();
        let fence = Fence::new(&device, true).unwrap();
        assert!(fence.is_signaled(&device));

        // Waiting twice without a reset is redundant but allowed.
        fence.wait_signal_from_gpu(&device);
        fence.wait_signal_from_gpu(&device);

        fence.reset(&device);
        assert!(!fence.is_signaled(&device));
        fence.destroy(&device);
    }

    #[test]
    fn wait_all_on_signaled_fences() {
        let device = device();
        let a = Fence::new(&device, true).unwrap();
        let b = Fence::new(&device, true).unwrap();
        wait_all(&device, &[&a, &b]);
        wait_all(&device, &[]);
    }

    #[test]
    #[should_panic(expected = "never be signaled")]
    fn waiting_on_an_idle_unsignaled_fence_panics() {
        let device = device();
        let fence = Fence::new(&device, false).unwrap();
        fence.wait_signal_from_gpu(&device);
    }
}
