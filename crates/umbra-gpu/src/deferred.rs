//! Deferred release of staging buffers.
//!
//! A staging buffer is read by the GPU until the frame whose command lists
//! copy out of it completes. Retired buffers are tagged with that frame's
//! number and only destroyed once the renderer reports the frame complete.

use std::collections::VecDeque;

use crate::device::{BufferId, Device};
use crate::renderer::Renderer;

/// A buffer waiting for its frame to complete.
struct PendingRelease {
    buffer: BufferId,
    frame_number: u64,
    bytes: u64,
}

/// Queue of buffers to destroy after the frames that read them complete.
#[derive(Default)]
pub struct StagingReleaseQueue {
    pending: VecDeque<PendingRelease>,
}

impl StagingReleaseQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroy `buffer` once frame `frame_number` has completed.
    ///
    /// Every submission reading `buffer` must precede the submission that
    /// signals that frame's fence.
    pub fn retire(&mut self, device: &Device, buffer: BufferId, frame_number: u64) {
        let bytes = device.buffer(buffer).size;
        self.pending.push_back(PendingRelease {
            buffer,
            frame_number,
            bytes,
        });
    }

    /// Destroy every buffer whose frame has completed. Returns how many were
    /// released.
    ///
    /// Fences are polled, never waited on.
    pub fn collect(&mut self, device: &Device, renderer: &Renderer) -> usize {
        let mut released = 0;
        let mut bytes = 0;
        self.pending.retain(|p| {
            let done = renderer.is_frame_complete(device, p.frame_number);
            if done {
                device.destroy_buffer(p.buffer);
                released += 1;
                bytes += p.bytes;
            }
            !done
        });
        if released > 0 {
            tracing::debug!(released, bytes, remaining = self.pending.len(), "staging buffers released");
        }
        released
    }

    /// Destroy everything immediately.
    ///
    /// Call only after the device is idle.
    pub fn flush(&mut self, device: &Device) {
        while let Some(pending) = self.pending.pop_front() {
            device.destroy_buffer(pending.buffer);
        }
    }

    /// Number of buffers waiting for release.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total size of buffers waiting for release.
    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|p| p.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ImageBarrier;
    use crate::headless::HeadlessBackend;
    use crate::resource::BufferBuilder;
    use ash::vk;
    use gpu_allocator::MemoryLocation;
    use std::sync::Arc;
    use umbra_core::EngineConfig;

    fn staging(device: &Device, size: u64) -> BufferId {
        BufferBuilder::new(device, size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory(MemoryLocation::CpuToGpu)
            .build()
            .unwrap()
    }

    /// Present one frame whose only list transitions the present image.
    fn present_frame(device: &Device, renderer: &mut Renderer, worker: &mut crate::WorkerContext) {
        let frame = renderer.acquire_next_frame(device);
        worker.reset_frame(device, frame);
        let mut cmd = worker.begin(device, frame);
        cmd.push_image_barrier(&ImageBarrier::new(
            &device.image(renderer.present_target(frame).image),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        cmd.finalize();
        renderer.submit_command_lists(
            device,
            &[&cmd],
            &[(renderer.image_available(), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[&renderer.present_target(frame).render_finished],
            Some(renderer.frame_fence()),
        );
        renderer.submit_presentation(device, frame);
    }

    #[test]
    fn released_only_after_frame_completes() {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        let mut renderer = Renderer::new(&device, &EngineConfig::default(), 0).unwrap();
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let mut queue = StagingReleaseQueue::new();

        let base = backend.stats().live_buffers;
        queue.retire(&device, staging(&device, 64), renderer.frame_number());
        queue.retire(&device, staging(&device, 32), renderer.frame_number());
        assert_eq!(queue.pending_bytes(), 96);

        present_frame(&device, &mut renderer, &mut worker);
        assert_eq!(queue.collect(&device, &renderer), 0);
        assert_eq!(backend.stats().live_buffers, base + 2);

        renderer.wait_idle(&device);
        assert_eq!(queue.collect(&device, &renderer), 2);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(backend.stats().live_buffers, base);
    }

    #[test]
    fn flush_releases_everything() {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        let mut queue = StagingReleaseQueue::new();
        queue.retire(&device, staging(&device, 16), 0);
        queue.flush(&device);
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
