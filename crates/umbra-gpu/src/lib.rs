//! Explicit GPU layer for the Umbra renderer.
//!
//! This crate provides:
//! - A backend seam with a Vulkan implementation and a CPU-executing headless one
//! - Resource builders over a handle arena (buffers, images, views)
//! - A closed barrier transition table
//! - Command lists with recording and finalized states
//! - Fences, semaphores and the frame ring driving acquire, submit and present
//! - Per-worker command and descriptor pools
//! - The streamer that uploads models, materials and textures through staging buffers

pub mod backend;
pub mod barrier;
pub mod command;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod pipeline;
pub mod renderer;
pub mod resource;
pub mod streamer;
pub mod sync;
pub mod worker;

pub use backend::vulkan::{VulkanBackend, VulkanConfig};
pub use backend::{Backend, ClearValue, Command, SamplerDesc};
pub use barrier::{BufferBarrier, ImageBarrier};
pub use command::{CommandList, CommandPool};
pub use deferred::StagingReleaseQueue;
pub use descriptors::{DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use device::{BufferId, Device, ImageId, ImageViewId};
pub use error::{fatal, GpuError, GpuResultExt, Result};
pub use frame::{FrameIndex, PerFrame};
pub use pipeline::{Framebuffer, GraphicsPipeline, GraphicsPipelineConfig, RenderPass, Sampler};
pub use renderer::{PresentTarget, Renderer};
pub use resource::{Buffer, BufferBuilder, Image, ImageBuilder, ImageView, ImageViewBuilder};
pub use streamer::{GpuMaterial, GpuModel, GpuStreamer, GpuTexture, StagingBuffer, UploadReport};
pub use sync::{Fence, Semaphore};
pub use worker::WorkerContext;

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
