//! Command pools and command lists.
//!
//! A [`CommandList`] is one recording session on one command buffer. It is
//! either recording or finalized; recording into a finalized list, or
//! finalizing twice, panics. Command buffers are recycled by resetting the
//! [`CommandPool`] they came from, which only happens once the frame slot
//! that used them has retired.

use ash::vk;

use crate::backend::{ClearValue, Command};
use crate::barrier::{BufferBarrier, ImageBarrier};
use crate::device::{BufferId, Device, ImageId};
use crate::error::{GpuResultExt, Result};
use crate::pipeline::{Framebuffer, GraphicsPipeline, RenderPass};

/// Command pool handing out reusable primary command buffers.
pub struct CommandPool {
    raw: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next: usize,
}

impl CommandPool {
    /// Create a pool. `transient` hints that buffers are short-lived.
    pub fn new(device: &Device, transient: bool) -> Result<Self> {
        let raw = device.backend().create_command_pool(transient)?;
        Ok(Self {
            raw,
            buffers: Vec::new(),
            next: 0,
        })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::CommandPool {
        self.raw
    }

    /// Take the next free command buffer, allocating if the pool is exhausted.
    pub(crate) fn acquire(&mut self, device: &Device) -> vk::CommandBuffer {
        if self.next == self.buffers.len() {
            let cmd = device
                .backend()
                .allocate_command_buffer(self.raw)
                .or_fatal("command buffer allocation");
            self.buffers.push(cmd);
        }
        let cmd = self.buffers[self.next];
        self.next += 1;
        cmd
    }

    /// Number of command buffers handed out since the last reset.
    pub const fn in_use(&self) -> usize {
        self.next
    }

    /// Number of command buffers ever allocated.
    pub fn allocated(&self) -> usize {
        self.buffers.len()
    }

    /// Recycle every command buffer. None of them may still be executing.
    pub fn reset(&mut self, device: &Device) {
        device
            .backend()
            .reset_command_pool(self.raw)
            .or_fatal("command pool reset");
        self.next = 0;
    }

    /// Destroy the pool and its command buffers.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_command_pool(self.raw);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Recording,
    Finalized,
}

/// A linear recording of GPU work.
pub struct CommandList<'d> {
    device: &'d Device,
    raw: vk::CommandBuffer,
    state: State,
    commands: usize,
    in_render_pass: bool,
    bound_layout: Option<vk::PipelineLayout>,
}

impl<'d> CommandList<'d> {
    /// Begin recording on a command buffer taken from `pool`.
    pub fn begin(device: &'d Device, pool: &mut CommandPool) -> Self {
        let raw = pool.acquire(device);
        device
            .backend()
            .begin_command_buffer(raw)
            .or_fatal("command buffer begin");
        Self {
            device,
            raw,
            state: State::Recording,
            commands: 0,
            in_render_pass: false,
            bound_layout: None,
        }
    }

    /// Raw command buffer.
    pub const fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Device this list records against.
    pub const fn device(&self) -> &'d Device {
        self.device
    }

    /// Number of recorded commands.
    pub const fn len(&self) -> usize {
        self.commands
    }

    /// Returns true if nothing was recorded.
    pub const fn is_empty(&self) -> bool {
        self.commands == 0
    }

    /// Returns true once [`CommandList::finalize`] has run.
    pub fn is_finalized(&self) -> bool {
        self.state == State::Finalized
    }

    #[track_caller]
    fn push(&mut self, command: &Command) {
        assert!(
            self.state == State::Recording,
            "recording into finalized command list"
        );
        self.device.backend().record(self.raw, command);
        self.commands += 1;
    }

    /// Record a single image barrier.
    #[track_caller]
    pub fn push_image_barrier(&mut self, barrier: &ImageBarrier) {
        self.push(&Command::PipelineBarrier {
            src_stage: barrier.src_stage,
            dst_stage: barrier.dst_stage,
            image_barriers: vec![*barrier],
            buffer_barriers: Vec::new(),
        });
    }

    /// Record a single buffer barrier.
    #[track_caller]
    pub fn push_buffer_barrier(&mut self, barrier: &BufferBarrier) {
        self.push(&Command::PipelineBarrier {
            src_stage: barrier.src_stage,
            dst_stage: barrier.dst_stage,
            image_barriers: Vec::new(),
            buffer_barriers: vec![*barrier],
        });
    }

    /// Record several barriers as one dependency; stage masks are the union.
    #[track_caller]
    pub fn push_barriers(&mut self, images: &[ImageBarrier], buffers: &[BufferBarrier]) {
        if images.is_empty() && buffers.is_empty() {
            return;
        }
        let stages = images
            .iter()
            .map(|b| (b.src_stage, b.dst_stage))
            .chain(buffers.iter().map(|b| (b.src_stage, b.dst_stage)));
        let (src_stage, dst_stage) = stages.fold(
            (
                vk::PipelineStageFlags::empty(),
                vk::PipelineStageFlags::empty(),
            ),
            |(src, dst), (s, d)| (src | s, dst | d),
        );
        self.push(&Command::PipelineBarrier {
            src_stage,
            dst_stage,
            image_barriers: images.to_vec(),
            buffer_barriers: buffers.to_vec(),
        });
    }

    /// Copy `size` bytes between buffers.
    #[track_caller]
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) {
        let (src, dst) = (self.device.buffer(src), self.device.buffer(dst));
        assert!(
            src.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC),
            "copy source lacks TRANSFER_SRC usage"
        );
        assert!(
            dst.usage.contains(vk::BufferUsageFlags::TRANSFER_DST),
            "copy destination lacks TRANSFER_DST usage"
        );
        assert!(
            src_offset + size <= src.size && dst_offset + size <= dst.size,
            "buffer copy out of bounds"
        );
        self.push(&Command::CopyBuffer {
            src: src.raw,
            dst: dst.raw,
            regions: vec![vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        });
    }

    /// Copy tightly packed texels at `src_offset` into the whole of `dst`,
    /// which must be in `TRANSFER_DST_OPTIMAL`.
    #[track_caller]
    pub fn copy_buffer_to_image(&mut self, src: BufferId, src_offset: u64, dst: ImageId) {
        let (src, dst) = (self.device.buffer(src), self.device.image(dst));
        assert!(
            dst.usage.contains(vk::ImageUsageFlags::TRANSFER_DST),
            "copy destination image lacks TRANSFER_DST usage"
        );
        let region = vk::BufferImageCopy::default()
            .buffer_offset(src_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(dst.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: dst.extent.width,
                height: dst.extent.height,
                depth: 1,
            });
        self.push(&Command::CopyBufferToImage {
            src: src.raw,
            dst: dst.raw,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions: vec![region],
        });
    }

    /// Begin `render_pass` on `framebuffer`, one clear value per attachment.
    #[track_caller]
    pub fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[ClearValue],
    ) {
        assert!(!self.in_render_pass, "render pass already active");
        assert_eq!(
            clear_values.len(),
            render_pass.attachment_count(),
            "one clear value per attachment"
        );
        self.push(&Command::BeginRenderPass {
            render_pass: render_pass.raw(),
            framebuffer: framebuffer.raw(),
            extent: framebuffer.extent(),
            clear_values: clear_values.to_vec(),
        });
        self.in_render_pass = true;
    }

    /// End the active render pass.
    #[track_caller]
    pub fn end_render_pass(&mut self) {
        assert!(self.in_render_pass, "no active render pass");
        self.push(&Command::EndRenderPass);
        self.in_render_pass = false;
        self.bound_layout = None;
    }

    /// Bind a graphics pipeline.
    #[track_caller]
    pub fn bind_pipeline(&mut self, pipeline: &GraphicsPipeline) {
        self.push(&Command::BindPipeline {
            pipeline: pipeline.pipeline,
        });
        self.bound_layout = Some(pipeline.layout);
    }

    /// Bind a vertex buffer to binding `binding`.
    #[track_caller]
    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferId, offset: u64) {
        let buffer = self.device.buffer(buffer).raw;
        self.push(&Command::BindVertexBuffer {
            binding,
            buffer,
            offset,
        });
    }

    /// Bind a `u32` index buffer.
    #[track_caller]
    pub fn bind_index_buffer(&mut self, buffer: BufferId, offset: u64) {
        let buffer = self.device.buffer(buffer).raw;
        self.push(&Command::BindIndexBuffer {
            buffer,
            offset,
            index_type: vk::IndexType::UINT32,
        });
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.bound_layout
            .unwrap_or_else(|| panic!("no pipeline bound"))
    }

    /// Bind a descriptor set at `index` of the bound pipeline's layout.
    #[track_caller]
    pub fn bind_descriptor_set(&mut self, index: u32, set: vk::DescriptorSet) {
        let layout = self.layout();
        self.push(&Command::BindDescriptorSet {
            layout,
            first_set: index,
            set,
        });
    }

    /// Push constants for the bound pipeline.
    #[track_caller]
    pub fn push_constants(&mut self, stages: vk::ShaderStageFlags, data: &[u8]) {
        let layout = self.layout();
        self.push(&Command::PushConstants {
            layout,
            stages,
            offset: 0,
            data: data.to_vec(),
        });
    }

    /// Cover `extent` with the viewport and scissor.
    #[track_caller]
    pub fn set_viewport_scissor(&mut self, extent: vk::Extent2D) {
        self.push(&Command::SetViewport {
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        });
        self.push(&Command::SetScissor {
            scissor: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
        });
    }

    /// Non-indexed draw.
    #[track_caller]
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        assert!(self.in_render_pass, "draw outside a render pass");
        self.push(&Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    /// Indexed draw.
    #[track_caller]
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        assert!(self.in_render_pass, "draw outside a render pass");
        self.push(&Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    /// Close the recording. Calling this twice panics.
    #[track_caller]
    pub fn finalize(&mut self) {
        assert!(
            self.state == State::Recording,
            "command list finalized twice"
        );
        assert!(!self.in_render_pass, "finalize inside an active render pass");
        self.device
            .backend()
            .end_command_buffer(self.raw)
            .or_fatal("command buffer end");
        self.state = State::Finalized;
    }
}

impl Drop for CommandList<'_> {
    fn drop(&mut self) {
        if self.state == State::Recording && !std::thread::panicking() {
            tracing::warn!(commands = self.commands, "command list dropped without finalize");
            if self.in_render_pass {
                self.device.backend().record(self.raw, &Command::EndRenderPass);
                self.in_render_pass = false;
            }
            self.finalize();
        }
    }
}

impl std::fmt::Debug for CommandList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("raw", &self.raw)
            .field("state", &self.state)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::resource::BufferBuilder;
    use gpu_allocator::MemoryLocation;
    use std::sync::Arc;

    fn setup() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        (backend, device)
    }

    fn buffers(device: &Device) -> (BufferId, BufferId) {
        let src = BufferBuilder::new(device, 64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory(MemoryLocation::CpuToGpu)
            .build()
            .unwrap();
        let dst = BufferBuilder::new(device, 64)
            .usage(vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER)
            .build()
            .unwrap();
        (src, dst)
    }

    #[test]
    fn records_in_order() {
        let (backend, device) = setup();
        let (src, dst) = buffers(&device);
        let mut pool = CommandPool::new(&device, false).unwrap();

        let mut cmd = CommandList::begin(&device, &mut pool);
        cmd.push_buffer_barrier(&BufferBarrier::new(
            &device.buffer(dst),
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        ));
        cmd.copy_buffer_to_buffer(src, 0, dst, 0, 64);
        cmd.finalize();

        assert_eq!(cmd.len(), 2);
        let recorded = backend.recorded_commands(cmd.raw());
        assert!(matches!(recorded[0], Command::PipelineBarrier { .. }));
        assert!(matches!(recorded[1], Command::CopyBuffer { .. }));
    }

    #[test]
    #[should_panic(expected = "recording into finalized command list")]
    fn record_after_finalize_panics() {
        let (_backend, device) = setup();
        let (src, dst) = buffers(&device);
        let mut pool = CommandPool::new(&device, false).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        cmd.finalize();
        cmd.copy_buffer_to_buffer(src, 0, dst, 0, 4);
    }

    #[test]
    #[should_panic(expected = "command list finalized twice")]
    fn double_finalize_panics() {
        let (_backend, device) = setup();
        let mut pool = CommandPool::new(&device, false).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        cmd.finalize();
        cmd.finalize();
    }

    #[test]
    fn drop_finalizes_forgotten_list() {
        let (backend, device) = setup();
        let mut pool = CommandPool::new(&device, false).unwrap();
        let raw = {
            let cmd = CommandList::begin(&device, &mut pool);
            cmd.raw()
        };
        assert!(backend.is_executable(raw));
    }

    #[test]
    fn pool_reuses_buffers_after_reset() {
        let (_backend, device) = setup();
        let mut pool = CommandPool::new(&device, false).unwrap();
        let first = {
            let mut cmd = CommandList::begin(&device, &mut pool);
            cmd.finalize();
            cmd.raw()
        };
        {
            let mut cmd = CommandList::begin(&device, &mut pool);
            cmd.finalize();
            assert_ne!(cmd.raw(), first);
        }
        assert_eq!(pool.in_use(), 2);

        pool.reset(&device);
        let mut cmd = CommandList::begin(&device, &mut pool);
        cmd.finalize();
        assert_eq!(cmd.raw(), first);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    #[should_panic(expected = "copy destination lacks TRANSFER_DST usage")]
    fn copy_into_non_transfer_buffer_panics() {
        let (_backend, device) = setup();
        let (src, _) = buffers(&device);
        let mut pool = CommandPool::new(&device, false).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        cmd.copy_buffer_to_buffer(src, 0, src, 0, 4);
    }
}
