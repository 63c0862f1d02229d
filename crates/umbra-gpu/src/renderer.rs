//! Frame orchestrator.
//!
//! One frame is: [`Renderer::acquire_next_frame`], record command lists for
//! the returned [`FrameIndex`], [`Renderer::submit_command_lists`] with the
//! semaphore chain and the frame fence, then
//! [`Renderer::submit_presentation`]. Semaphores order submissions on the
//! GPU; the frame fence only tells the CPU when a slot may be reused.
//!
//! Any backend failure on these paths is treated as device loss and aborts.

use ash::vk;

use umbra_core::constants::{MAX_FRAMES_IN_FLIGHT, MIN_FRAMES_IN_FLIGHT};
use umbra_core::EngineConfig;

use crate::command::CommandList;
use crate::device::{Device, ImageId, ImageViewId};
use crate::error::{fatal, GpuError, GpuResultExt, Result};
use crate::frame::{FrameIndex, PerFrame};
use crate::resource::ImageViewBuilder;
use crate::sync::{Fence, Semaphore};
use crate::worker::WorkerContext;

/// Synchronization objects cycled once per submitted frame.
struct FrameSync {
    image_available: Semaphore,
    in_flight: Fence,
    chain: Vec<Semaphore>,
    /// Frame number of the last frame acquired with this slot.
    last_frame: Option<u64>,
}

impl FrameSync {
    fn new(device: &Device, chain: usize) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
            chain: (0..chain)
                .map(|_| Semaphore::new(device))
                .collect::<Result<_>>()?,
            last_frame: None,
        })
    }

    fn destroy(self, device: &Device) {
        self.image_available.destroy(device);
        self.in_flight.destroy(device);
        for semaphore in self.chain {
            semaphore.destroy(device);
        }
    }
}

/// A present image and the objects tied to it.
pub struct PresentTarget {
    pub image: ImageId,
    pub view: ImageViewId,
    /// Signaled by the last submission of a frame, waited on by presentation.
    pub render_finished: Semaphore,
}

impl PresentTarget {
    fn destroy(self, device: &Device) {
        device.destroy_image_view(self.view);
        device.destroy_image(self.image);
        self.render_finished.destroy(device);
    }
}

/// Owns the present-image ring and drives acquisition, submission and
/// presentation.
pub struct Renderer {
    syncs: Vec<FrameSync>,
    current_sync: usize,
    /// For each present image, the sync slot whose fence covers its last use.
    image_owner: Vec<Option<usize>>,
    targets: PerFrame<PresentTarget>,
    format: vk::Format,
    extent: vk::Extent2D,
    acquired: Option<FrameIndex>,
    frame_number: u64,
}

impl Renderer {
    /// Set up frame synchronization over the backend's present images.
    ///
    /// `chain_semaphores` intermediate semaphores are created per frame for
    /// ordering submissions within one frame.
    pub fn new(device: &Device, config: &EngineConfig, chain_semaphores: usize) -> Result<Self> {
        config.validate()?;
        let frames = config.frames_in_flight;
        debug_assert!((MIN_FRAMES_IN_FLIGHT..=MAX_FRAMES_IN_FLIGHT).contains(&frames));

        let syncs = (0..frames)
            .map(|_| FrameSync::new(device, chain_semaphores))
            .collect::<Result<Vec<_>>>()?;
        let (targets, format, extent) = create_targets(device)?;
        if targets.len() != frames {
            tracing::warn!(
                requested = frames,
                present_images = targets.len(),
                "present image count differs from frames in flight"
            );
        }
        tracing::info!(
            frames_in_flight = frames,
            present_images = targets.len(),
            width = extent.width,
            height = extent.height,
            ?format,
            "renderer initialized"
        );

        Ok(Self {
            syncs,
            current_sync: 0,
            image_owner: vec![None; targets.len()],
            targets,
            format,
            extent,
            acquired: None,
            frame_number: 0,
        })
    }

    /// Number of present slots; size every [`PerFrame`] with this.
    pub fn frame_slots(&self) -> usize {
        self.targets.len()
    }

    /// Number of frames the CPU may record ahead of the GPU.
    pub fn frames_in_flight(&self) -> usize {
        self.syncs.len()
    }

    /// Present image format.
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Present image size.
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Frames presented so far.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Returns true once the GPU has finished every submission of frame
    /// `frame_number` that signaled its frame fence.
    ///
    /// A sync slot is reused only after its fence was waited, so frames whose
    /// slot has moved on are complete; otherwise the fence is polled.
    pub fn is_frame_complete(&self, device: &Device, frame_number: u64) -> bool {
        if frame_number >= self.frame_number {
            return false;
        }
        self.syncs
            .iter()
            .find(|sync| sync.last_frame == Some(frame_number))
            .map_or(true, |sync| sync.in_flight.is_signaled(device))
    }

    /// Present image of `frame`.
    pub fn present_target(&self, frame: FrameIndex) -> &PresentTarget {
        &self.targets[frame]
    }

    /// Every present target.
    pub const fn present_targets(&self) -> &PerFrame<PresentTarget> {
        &self.targets
    }

    /// Semaphore the current acquisition signals.
    pub fn image_available(&self) -> &Semaphore {
        &self.syncs[self.current_sync].image_available
    }

    /// Fence the last submission of the current frame must signal.
    pub fn frame_fence(&self) -> &Fence {
        &self.syncs[self.current_sync].in_flight
    }

    /// Intermediate semaphore `index` of the current frame.
    pub fn chain_semaphore(&self, index: usize) -> &Semaphore {
        &self.syncs[self.current_sync].chain[index]
    }

    /// Acquire the next present slot, aborting on failure.
    pub fn acquire_next_frame(&mut self, device: &Device) -> FrameIndex {
        self.try_acquire_next_frame(device)
            .or_fatal("present image acquisition")
    }

    /// Acquire the next present slot.
    ///
    /// Blocks until the GPU has finished every earlier frame that used the
    /// returned slot, so its per-frame resources may be rewritten. Returns
    /// [`GpuError::SwapchainOutOfDate`] if the swapchain must be recreated;
    /// other failures abort.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn try_acquire_next_frame(&mut self, device: &Device) -> Result<FrameIndex> {
        if let Some(frame) = self.acquired {
            panic!("{frame} acquired again before presentation");
        }

        let sync = &self.syncs[self.current_sync];
        sync.in_flight.wait_signal_from_gpu(device);

        let index = match device
            .backend()
            .acquire_next_image(sync.image_available.raw())
        {
            Ok(index) => index,
            Err(GpuError::SwapchainOutOfDate) => return Err(GpuError::SwapchainOutOfDate),
            Err(err) => fatal("present image acquisition", &err),
        };
        let frame = FrameIndex::new(index);
        assert!(
            frame.get() < self.targets.len(),
            "backend returned out-of-range present image {index}"
        );

        // The slot may have been rendered by a different sync slot whose
        // fence has not been waited yet.
        if let Some(owner) = self.image_owner[frame.get()] {
            if owner != self.current_sync {
                self.syncs[owner].in_flight.wait_signal_from_gpu(device);
            }
        }
        self.image_owner[frame.get()] = Some(self.current_sync);
        sync.in_flight.reset(device);
        self.syncs[self.current_sync].last_frame = Some(self.frame_number);

        self.acquired = Some(frame);
        tracing::trace!(%frame, frame_number = self.frame_number, "frame acquired");
        Ok(frame)
    }

    /// Submit finalized command lists in order as one batch.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_command_lists(
        &self,
        device: &Device,
        lists: &[&CommandList<'_>],
        waits: &[(&Semaphore, vk::PipelineStageFlags)],
        signals: &[&Semaphore],
        fence: Option<&Fence>,
    ) {
        for list in lists {
            assert!(list.is_finalized(), "submitting an unfinalized command list");
        }
        let command_buffers: Vec<_> = lists.iter().map(|l| l.raw()).collect();
        let waits: Vec<_> = waits.iter().map(|(s, stage)| (s.raw(), *stage)).collect();
        let signals: Vec<_> = signals.iter().map(|s| s.raw()).collect();

        device
            .backend()
            .submit(&crate::backend::SubmitInfo {
                command_buffers: &command_buffers,
                waits: &waits,
                signals: &signals,
                fence: fence.map_or(vk::Fence::null(), Fence::raw),
            })
            .or_fatal("queue submit");
    }

    /// Queue presentation of `frame`. Presentation waits on the frame's
    /// `render_finished` semaphore, which the last submission of the frame
    /// must signal. Returns true if the swapchain should be recreated.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_presentation(&mut self, device: &Device, frame: FrameIndex) -> bool {
        assert_eq!(
            self.acquired,
            Some(frame),
            "presenting {frame} which is not the acquired frame"
        );
        let wait = self.targets[frame].render_finished.raw();
        let stale = match device.backend().present(frame.raw(), &[wait]) {
            Ok(suboptimal) => suboptimal,
            Err(GpuError::SwapchainOutOfDate) => true,
            Err(err) => fatal("presentation", &err),
        };

        self.acquired = None;
        self.frame_number += 1;
        self.current_sync = (self.current_sync + 1) % self.syncs.len();
        stale
    }

    /// Submit one list and block until it has executed. Setup only.
    pub fn submit_and_wait(&self, device: &Device, list: &CommandList<'_>) {
        let fence = Fence::new(device, false).or_fatal("fence creation");
        self.submit_command_lists(device, &[list], &[], &[], Some(&fence));
        fence.wait_signal_from_gpu(device);
        fence.destroy(device);
        tracing::debug!(commands = list.len(), "one-shot submission complete");
    }

    /// Create a recording context sized for this renderer's frame slots.
    pub fn create_worker_context(
        &self,
        device: &Device,
        name: &str,
        max_descriptor_sets: u32,
    ) -> Result<WorkerContext> {
        WorkerContext::new(device, name, self.frame_slots(), max_descriptor_sets)
    }

    /// Block until every submitted frame has completed.
    pub fn wait_idle(&self, device: &Device) {
        let fences: Vec<_> = self.syncs.iter().map(|s| &s.in_flight).collect();
        crate::sync::wait_all(device, &fences);
        device.wait_idle();
    }

    /// Rebuild the present images for a new surface size.
    ///
    /// The caller must rebuild everything that references present views.
    pub fn resize(&mut self, device: &Device, width: u32, height: u32) -> Result<()> {
        assert!(self.acquired.is_none(), "resize while a frame is acquired");
        self.wait_idle(device);

        // Views must go before the images they reference.
        for (_, target) in self.targets.iter() {
            device.destroy_image_view(target.view);
            device.destroy_image(target.image);
        }
        device
            .backend()
            .recreate_swapchain(vk::Extent2D { width, height })?;
        let (targets, format, extent) = create_targets(device)?;
        self.image_owner = vec![None; targets.len()];
        for target in std::mem::replace(&mut self.targets, targets).into_inner() {
            target.render_finished.destroy(device);
        }
        self.format = format;
        self.extent = extent;
        tracing::info!(width = extent.width, height = extent.height, "swapchain recreated");
        Ok(())
    }

    /// Destroy synchronization objects and present targets.
    pub fn destroy(self, device: &Device) {
        self.wait_idle(device);
        for sync in self.syncs {
            sync.destroy(device);
        }
        for target in self.targets.into_inner() {
            target.destroy(device);
        }
    }
}

fn create_targets(device: &Device) -> Result<(PerFrame<PresentTarget>, vk::Format, vk::Extent2D)> {
    let info = device.backend().swapchain()?;
    let images = info.images.clone();
    let targets = PerFrame::try_new(images.len(), |frame| {
        let image = device.register_external_image(images[frame.get()], info.format, info.extent);
        Ok::<_, GpuError>(PresentTarget {
            image,
            view: ImageViewBuilder::new(device, image).build()?,
            render_finished: Semaphore::new(device)?,
        })
    })?;
    Ok((targets, info.format, info.extent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ImageBarrier;
    use crate::device::BufferId;
    use crate::headless::{HeadlessBackend, HeadlessConfig};
    use crate::resource::BufferBuilder;
    use gpu_allocator::MemoryLocation;
    use std::sync::Arc;

    fn setup(order: Option<Vec<u32>>, frames: usize) -> (Arc<HeadlessBackend>, Device, Renderer) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            image_count: frames as u32,
            acquire_order: order,
            ..HeadlessConfig::default()
        }));
        let device = Device::new(backend.clone());
        let config = EngineConfig::default().with_frames_in_flight(frames);
        let renderer = Renderer::new(&device, &config, 1).unwrap();
        (backend, device, renderer)
    }

    /// Per-slot host buffers copied into one device buffer every frame.
    fn slot_buffers(device: &Device, renderer: &Renderer) -> (PerFrame<BufferId>, BufferId) {
        let slots = PerFrame::try_new(renderer.frame_slots(), |_| {
            BufferBuilder::new(device, 16)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .memory(MemoryLocation::CpuToGpu)
                .build()
        })
        .unwrap();
        let dst = BufferBuilder::new(device, 16)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .build()
            .unwrap();
        (slots, dst)
    }

    fn run_frame(
        device: &Device,
        renderer: &mut Renderer,
        worker: &mut WorkerContext,
        slots: &PerFrame<BufferId>,
        dst: BufferId,
        value: u8,
    ) -> FrameIndex {
        let frame = renderer.acquire_next_frame(device);
        worker.reset_frame(device, frame);
        device.write_buffer(slots[frame], 0, &[value; 16]);

        let mut first = worker.begin(device, frame);
        first.copy_buffer_to_buffer(slots[frame], 0, dst, 0, 16);
        first.finalize();
        renderer.submit_command_lists(device, &[&first], &[], &[renderer.chain_semaphore(0)], None);

        let mut second = worker.begin(device, frame);
        let image = device.image(renderer.present_target(frame).image);
        second.push_image_barrier(&ImageBarrier::new(
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        second.finalize();
        let render_finished = &renderer.present_target(frame).render_finished;
        renderer.submit_command_lists(
            device,
            &[&second],
            &[
                (renderer.chain_semaphore(0), vk::PipelineStageFlags::TRANSFER),
                (renderer.image_available(), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
            ],
            &[render_finished],
            Some(renderer.frame_fence()),
        );
        renderer.submit_presentation(device, frame);
        frame
    }

    #[test]
    fn round_robin_frames() {
        let (backend, device, mut renderer) = setup(None, 3);
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let (slots, dst) = slot_buffers(&device, &renderer);

        let frames: Vec<_> = (0..6)
            .map(|i| run_frame(&device, &mut renderer, &mut worker, &slots, dst, i).raw())
            .collect();
        assert_eq!(frames, [0, 1, 2, 0, 1, 2]);
        assert_eq!(renderer.frame_number(), 6);

        renderer.wait_idle(&device);
        assert_eq!(backend.buffer_contents(device.buffer(dst).raw), [5; 16]);
        assert_eq!(backend.stats().presents, 6);
    }

    #[test]
    fn reacquired_slot_waits_for_its_previous_fence() {
        // Image 0 comes back before the sync slot that rendered it cycles
        // round, so its fence must be waited explicitly.
        let (backend, device, mut renderer) = setup(Some(vec![0, 0, 1, 0, 1, 1]), 2);
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let (slots, dst) = slot_buffers(&device, &renderer);

        for i in 0..12 {
            run_frame(&device, &mut renderer, &mut worker, &slots, dst, i);
        }
        renderer.wait_idle(&device);
        assert_eq!(backend.buffer_contents(device.buffer(dst).raw), [11; 16]);
        assert_eq!(backend.stats().submissions, 24);
    }

    #[test]
    fn frame_completion_follows_fences() {
        let (_backend, device, mut renderer) = setup(None, 2);
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let (slots, dst) = slot_buffers(&device, &renderer);

        assert!(!renderer.is_frame_complete(&device, 0));
        run_frame(&device, &mut renderer, &mut worker, &slots, dst, 1);
        // Submitted but never waited: the headless queue has not run it.
        assert!(!renderer.is_frame_complete(&device, 0));
        assert!(!renderer.is_frame_complete(&device, 1));

        run_frame(&device, &mut renderer, &mut worker, &slots, dst, 2);
        // Acquiring frame 2 reuses frame 0's slot after waiting its fence.
        run_frame(&device, &mut renderer, &mut worker, &slots, dst, 3);
        assert!(renderer.is_frame_complete(&device, 0));

        renderer.wait_idle(&device);
        assert!(renderer.is_frame_complete(&device, 2));
    }

    #[test]
    #[should_panic(expected = "acquired again before presentation")]
    fn double_acquire_panics() {
        let (_backend, device, mut renderer) = setup(None, 2);
        renderer.acquire_next_frame(&device);
        renderer.acquire_next_frame(&device);
    }

    #[test]
    #[should_panic(expected = "unfinalized command list")]
    fn unfinalized_submission_panics() {
        let (_backend, device, renderer) = setup(None, 2);
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let cmd = worker.begin_one_shot(&device);
        renderer.submit_command_lists(&device, &[&cmd], &[], &[], None);
    }

    #[test]
    fn out_of_date_then_resize() {
        let (backend, device, mut renderer) = setup(None, 2);
        backend.mark_out_of_date();
        assert!(matches!(
            renderer.try_acquire_next_frame(&device),
            Err(GpuError::SwapchainOutOfDate)
        ));

        renderer.resize(&device, 32, 24).unwrap();
        assert_eq!(renderer.extent(), vk::Extent2D { width: 32, height: 24 });
        assert_eq!(device.resource_counts(), (0, 2, 2));

        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let (slots, dst) = slot_buffers(&device, &renderer);
        run_frame(&device, &mut renderer, &mut worker, &slots, dst, 1);
    }
}
