//! Backend seam.
//!
//! Everything above this module talks to the GPU through [`Backend`], a thin
//! object-safe surface over raw Vulkan handle types. [`vulkan::VulkanBackend`]
//! drives a real device through ash; [`crate::headless::HeadlessBackend`]
//! executes the same command stream on the CPU for tests and tooling.

pub mod vulkan;

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::barrier::{BufferBarrier, ImageBarrier};
use crate::error::Result;
use crate::pipeline::GraphicsPipelineConfig;

/// Creation parameters for a buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// Creation parameters for a single-mip 2D image.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// Creation parameters for a 2D image view.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewDesc {
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
}

/// Sampler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// One binding of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Resource referenced by a descriptor write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl DescriptorResource {
    /// Descriptor type this resource is written as.
    pub const fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// A single descriptor update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// One attachment of a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// Single-subpass render pass layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub colors: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
}

impl RenderPassDesc {
    /// Attachments in framebuffer order: colors first, then depth.
    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentDesc> {
        self.colors.iter().chain(self.depth.iter())
    }

    /// Dependency on attachment work recorded before the pass.
    ///
    /// Earlier colour and depth writes are made available to this pass's
    /// writes, and to its attachment reads when an attachment is loaded.
    pub fn external_dependency(&self) -> vk::SubpassDependency {
        let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut src_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        let mut dst_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if self
            .colors
            .iter()
            .any(|c| c.load_op == vk::AttachmentLoadOp::LOAD)
        {
            dst_access |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
        if let Some(depth) = &self.depth {
            stages |= fragment_tests;
            src_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
            dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
            if depth.load_op == vk::AttachmentLoadOp::LOAD {
                dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
            }
        }
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
    }
}

/// Framebuffer creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub attachments: &'a [vk::ImageView],
    pub extent: vk::Extent2D,
}

/// Attachment clear value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    /// Convert to the Vulkan union.
    pub const fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One recorded GPU operation.
#[derive(Clone, Debug)]
pub enum Command {
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: Vec<ImageBarrier>,
        buffer_barriers: Vec<BufferBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline {
        pipeline: vk::Pipeline,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        first_set: u32,
        set: vk::DescriptorSet,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport {
        viewport: vk::Viewport,
    },
    SetScissor {
        scissor: vk::Rect2D,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

impl Command {
    /// Returns true for draw calls.
    pub const fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

/// A queue submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub signals: &'a [vk::Semaphore],
    /// `vk::Fence::null()` for no fence.
    pub fence: vk::Fence,
}

/// Present images exposed by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Host view of a mapped buffer; unmaps on drop.
pub struct MappedMemory<'a> {
    ptr: NonNull<u8>,
    len: usize,
    unmap: Option<Box<dyn FnOnce() + 'a>>,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> MappedMemory<'a> {
    /// Wrap a host pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes and must not
    /// be aliased until the returned guard is dropped.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, unmap: Option<Box<dyn FnOnce() + 'a>>) -> Self {
        Self {
            ptr,
            len,
            unmap,
            _marker: PhantomData,
        }
    }

    /// Copy `data` to `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.len)
            .unwrap_or_else(|| {
                panic!(
                    "write of {} bytes at {offset} exceeds mapping of {} bytes",
                    data.len(),
                    self.len
                )
            });
        self[offset..end].copy_from_slice(data);
    }
}

impl Deref for MappedMemory<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `MappedMemory::new`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for MappedMemory<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `MappedMemory::new`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

/// GPU backend.
///
/// All methods take `&self`; implementations synchronize internally so a
/// device can be shared between recording threads.
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Returns true if memory for `location` can be allocated.
    fn supports_location(&self, location: MemoryLocation) -> bool;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Map a host-visible buffer.
    fn map_buffer(&self, buffer: vk::Buffer) -> Result<MappedMemory<'_>>;

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, transient: bool) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Return every command buffer of `pool` to the initial state.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn record(&self, cmd: vk::CommandBuffer, command: &Command);
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn submit(&self, submit: &SubmitInfo<'_>) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Current present images.
    fn swapchain(&self) -> Result<SwapchainInfo>;
    /// Rebuild present images for a new surface size.
    fn recreate_swapchain(&self, extent: vk::Extent2D) -> Result<SwapchainInfo>;
    /// Acquire a present image; `signal` is signaled once it is available.
    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<u32>;
    /// Queue presentation of `image_index` after `waits`. Returns true if the
    /// swapchain is suboptimal.
    fn present(&self, image_index: u32, waits: &[vk::Semaphore]) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn mapped_memory_unmaps_on_drop() {
        let mut bytes = vec![0u8; 8];
        let unmapped = Cell::new(false);
        {
            let ptr = NonNull::new(bytes.as_mut_ptr()).unwrap();
            let mut mapped =
                unsafe { MappedMemory::new(ptr, 8, Some(Box::new(|| unmapped.set(true)))) };
            mapped.write(2, &[1, 2, 3]);
            assert!(!unmapped.get());
        }
        assert!(unmapped.get());
        assert_eq!(bytes, [0, 0, 1, 2, 3, 0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "exceeds mapping")]
    fn mapped_memory_rejects_overflow() {
        let mut bytes = vec![0u8; 4];
        let ptr = NonNull::new(bytes.as_mut_ptr()).unwrap();
        let mut mapped = unsafe { MappedMemory::new(ptr, 4, None) };
        mapped.write(2, &[0; 3]);
    }

    #[test]
    fn render_pass_attachment_order() {
        let color = AttachmentDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth = AttachmentDesc {
            format: vk::Format::D32_SFLOAT,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..color
        };
        let desc = RenderPassDesc {
            colors: vec![color, color],
            depth: Some(depth),
        };
        let formats: Vec<_> = desc.attachments().map(|a| a.format).collect();
        assert_eq!(
            formats,
            [
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::D32_SFLOAT
            ]
        );
    }

    fn present_color(load_op: vk::AttachmentLoadOp) -> AttachmentDesc {
        AttachmentDesc {
            format: vk::Format::B8G8R8A8_UNORM,
            load_op,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    #[test]
    fn loading_pass_waits_for_earlier_color_writes() {
        let desc = RenderPassDesc {
            colors: vec![present_color(vk::AttachmentLoadOp::LOAD)],
            depth: None,
        };
        let dep = desc.external_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert!(dep
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert_eq!(dep.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn clearing_pass_with_depth_orders_depth_writes() {
        let color = present_color(vk::AttachmentLoadOp::CLEAR);
        let desc = RenderPassDesc {
            colors: vec![color],
            depth: Some(AttachmentDesc {
                format: vk::Format::D32_SFLOAT,
                ..color
            }),
        };
        let dep = desc.external_dependency();
        assert!(!dep.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_READ));
        assert!(dep
            .src_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(dep
            .src_stage_mask
            .contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
    }
}
