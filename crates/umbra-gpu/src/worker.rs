//! Per-worker recording context.
//!
//! Command pools and descriptor pools are externally synchronized, so each
//! recording thread owns a [`WorkerContext`] and passes it by `&mut` to the
//! code that records. Nothing here is ambient or thread-local.

use crate::command::{CommandList, CommandPool};
use crate::descriptors::DescriptorPool;
use crate::device::Device;
use crate::error::Result;
use crate::frame::{FrameIndex, PerFrame};

/// Pools owned by one recording thread.
pub struct WorkerContext {
    name: String,
    frame_pools: PerFrame<CommandPool>,
    one_shot: CommandPool,
    descriptors: DescriptorPool,
}

impl WorkerContext {
    /// Create pools for `frames` slots and a descriptor pool of `max_sets` sets.
    pub fn new(device: &Device, name: impl Into<String>, frames: usize, max_sets: u32) -> Result<Self> {
        let name = name.into();
        let frame_pools = PerFrame::try_new(frames, |_| CommandPool::new(device, false))?;
        let one_shot = CommandPool::new(device, true)?;
        let descriptors =
            DescriptorPool::new(device, max_sets, &DescriptorPool::default_sizes(max_sets))?;
        tracing::debug!(worker = %name, frames, max_sets, "worker context created");
        Ok(Self {
            name,
            frame_pools,
            one_shot,
            descriptors,
        })
    }

    /// Worker name for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recycle the command buffers of `frame`. Call only after the slot's
    /// fence has signaled.
    pub fn reset_frame(&mut self, device: &Device, frame: FrameIndex) {
        self.frame_pools[frame].reset(device);
    }

    /// Begin a command list recorded for `frame`.
    pub fn begin<'d>(&mut self, device: &'d Device, frame: FrameIndex) -> CommandList<'d> {
        CommandList::begin(device, &mut self.frame_pools[frame])
    }

    /// Begin a command list for one-shot setup work.
    pub fn begin_one_shot<'d>(&mut self, device: &'d Device) -> CommandList<'d> {
        CommandList::begin(device, &mut self.one_shot)
    }

    /// Recycle one-shot command buffers. Their submissions must be complete.
    pub fn reset_one_shot(&mut self, device: &Device) {
        self.one_shot.reset(device);
    }

    /// Command pool of `frame`.
    pub fn frame_pool(&self, frame: FrameIndex) -> &CommandPool {
        &self.frame_pools[frame]
    }

    /// Descriptor pool of this worker.
    pub fn descriptor_pool(&mut self) -> &mut DescriptorPool {
        &mut self.descriptors
    }

    /// Destroy every pool.
    pub fn destroy(self, device: &Device) {
        for pool in self.frame_pools.into_inner() {
            pool.destroy(device);
        }
        self.one_shot.destroy(device);
        self.descriptors.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use std::sync::Arc;

    fn assert_send<T: Send>() {}

    #[test]
    fn worker_context_is_send() {
        assert_send::<WorkerContext>();
    }

    #[test]
    fn frame_pools_are_independent() {
        let device = Device::new(Arc::new(HeadlessBackend::default()));
        let mut worker = WorkerContext::new(&device, "main", 2, 8).unwrap();
        let (a, b) = (FrameIndex::new(0), FrameIndex::new(1));

        worker.begin(&device, a).finalize();
        worker.begin(&device, b).finalize();
        worker.begin(&device, b).finalize();
        assert_eq!(worker.frame_pool(a).in_use(), 1);
        assert_eq!(worker.frame_pool(b).in_use(), 2);

        worker.reset_frame(&device, b);
        assert_eq!(worker.frame_pool(a).in_use(), 1);
        assert_eq!(worker.frame_pool(b).in_use(), 0);
        worker.destroy(&device);
    }
}
