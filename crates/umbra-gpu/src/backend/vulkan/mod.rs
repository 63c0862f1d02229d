//! Vulkan backend over ash and gpu-allocator.
//!
//! One graphics queue serves submission and presentation. Memory for buffers
//! and images comes from a shared [`Allocator`]; host-visible allocations are
//! persistently mapped, so [`Backend::map_buffer`] only hands out a view.

mod instance;
mod swapchain;

pub use swapchain::{calculate_extent, clamp_image_count, select_present_mode, select_surface_format};

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use umbra_core::EngineConfig;

use super::{
    Backend, BufferDesc, Command, DescriptorBinding, DescriptorResource, DescriptorWrite,
    FramebufferDesc, ImageDesc, ImageViewDesc, MappedMemory, RenderPassDesc, SamplerDesc,
    SubmitInfo, SwapchainInfo,
};
use crate::error::{GpuError, Result};
use crate::pipeline::GraphicsPipelineConfig;
use swapchain::Presenter;

/// Backend construction parameters.
#[derive(Clone, Debug)]
pub struct VulkanConfig {
    pub app_name: String,
    pub validation: bool,
    pub vsync: bool,
    /// Requested present image count.
    pub image_count: u32,
    /// Initial surface size.
    pub extent: vk::Extent2D,
}

impl VulkanConfig {
    /// Derive backend settings from the engine configuration.
    pub fn from_engine(config: &EngineConfig, app_name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            app_name: app_name.into(),
            validation: config.validation,
            vsync: config.vsync,
            image_count: u32::try_from(config.frames_in_flight).unwrap_or(2),
            extent: vk::Extent2D { width, height },
        }
    }
}

struct BufferMemory {
    allocation: Allocation,
    size: u64,
}

/// Buffers with a live [`MappedMemory`] guard.
#[derive(Default)]
struct MappedBuffers(Mutex<HashSet<vk::Buffer>>);

impl MappedBuffers {
    #[track_caller]
    fn claim(&self, buffer: vk::Buffer) {
        assert!(self.0.lock().insert(buffer), "buffer {buffer:?} mapped twice");
    }

    fn release(&self, buffer: vk::Buffer) {
        self.0.lock().remove(&buffer);
    }

    fn contains(&self, buffer: vk::Buffer) -> bool {
        self.0.lock().contains(&buffer)
    }
}

/// Backend driving a Vulkan device.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    device_name: String,
    queue_family: u32,
    queue: Mutex<vk::Queue>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocator: Mutex<Option<Allocator>>,
    buffers: Mutex<HashMap<vk::Buffer, BufferMemory>>,
    mapped: MappedBuffers,
    images: Mutex<HashMap<vk::Image, Allocation>>,
    presenter: Option<Mutex<Presenter>>,
}

impl VulkanBackend {
    /// Create a device that presents to `window`.
    pub fn new<W>(window: &W, config: &VulkanConfig) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("window handle: {e}")))?
            .as_raw();
        Self::create(config, Some((display, handle)))
    }

    /// Create a device without a surface. Swapchain operations fail.
    pub fn offscreen(config: &VulkanConfig) -> Result<Self> {
        Self::create(config, None)
    }

    fn create(config: &VulkanConfig, window: Option<(RawDisplayHandle, RawWindowHandle)>) -> Result<Self> {
        // SAFETY: the loaded library stays alive in `_entry` for the
        // lifetime of the backend.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("failed to load Vulkan: {e}")))?;

        // SAFETY: entry is loaded.
        let instance = unsafe {
            instance::create_instance(
                &entry,
                &config.app_name,
                config.validation,
                window.map(|(display, _)| display),
            )?
        };

        let surface = match window {
            Some((display, handle)) => {
                // SAFETY: the window handles are valid for the caller's window.
                let surface =
                    unsafe { ash_window::create_surface(&entry, &instance, display, handle, None) }
                        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
                Some((surface, ash::khr::surface::Instance::new(&entry, &instance)))
            }
            None => None,
        };

        // SAFETY: instance and surface are valid.
        let selected = unsafe {
            instance::select_physical_device(
                &instance,
                surface.as_ref().map(|(surface, loader)| (loader, *surface)),
            )?
        };
        // SAFETY: as above.
        let (device, queue) =
            unsafe { instance::create_device(&instance, &selected, surface.is_some())? };
        // SAFETY: as above.
        let device_name = unsafe { instance::device_name(&instance, selected.physical_device) };
        // SAFETY: as above.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(selected.physical_device) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selected.physical_device,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let presenter = match surface {
            Some((surface, surface_loader)) => {
                let mut presenter = Presenter {
                    surface,
                    surface_loader,
                    swapchain_loader: ash::khr::swapchain::Device::new(&instance, &device),
                    swapchain: vk::SwapchainKHR::null(),
                    images: Vec::new(),
                    format: vk::Format::UNDEFINED,
                    extent: config.extent,
                    vsync: config.vsync,
                    requested_images: config.image_count,
                };
                // SAFETY: no previous swapchain exists.
                unsafe {
                    presenter.build(selected.physical_device, selected.queue_family, config.extent)?;
                }
                Some(Mutex::new(presenter))
            }
            None => None,
        };

        tracing::info!(
            device = %device_name,
            queue_family = selected.queue_family,
            presenting = presenter.is_some(),
            validation = config.validation,
            "Vulkan backend created"
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device: selected.physical_device,
            device,
            device_name,
            queue_family: selected.queue_family,
            queue: Mutex::new(queue),
            memory_properties,
            allocator: Mutex::new(Some(allocator)),
            buffers: Mutex::new(HashMap::new()),
            mapped: MappedBuffers::default(),
            images: Mutex::new(HashMap::new()),
            presenter,
        })
    }

    /// Name of the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Raw ash device.
    pub const fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::Other("allocator already shut down".into()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(err) = allocator.free(allocation) {
                tracing::error!(%err, "failed to free GPU allocation");
            }
        }
    }

    fn presenter(&self) -> Result<&Mutex<Presenter>> {
        self.presenter
            .as_ref()
            .ok_or_else(|| GpuError::SwapchainCreation("offscreen backend has no surface".into()))
    }

    fn update_one(&self, set: vk::DescriptorSet, write: &DescriptorWrite) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(write.binding)
            .dst_array_element(write.array_element)
            .descriptor_type(write.resource.descriptor_type());
        match write.resource {
            DescriptorResource::UniformBuffer {
                buffer,
                offset,
                range,
            }
            | DescriptorResource::StorageBuffer {
                buffer,
                offset,
                range,
            } => {
                let info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }];
                // SAFETY: the set and buffer are live; caller guarantees the set is idle.
                unsafe { self.device.update_descriptor_sets(&[base.buffer_info(&info)], &[]) };
            }
            DescriptorResource::CombinedImageSampler {
                view,
                sampler,
                layout,
            } => {
                let info = [vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }];
                // SAFETY: as above.
                unsafe { self.device.update_descriptor_sets(&[base.image_info(&info)], &[]) };
            }
        }
    }
}

impl Backend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn supports_location(&self, location: MemoryLocation) -> bool {
        let required = match location {
            MemoryLocation::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE
            }
            MemoryLocation::Unknown => return false,
        };
        self.memory_properties.memory_types[..self.memory_properties.memory_type_count as usize]
            .iter()
            .any(|ty| ty.property_flags.contains(required))
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        if !self.supports_location(desc.location) {
            return Err(GpuError::UnsupportedMemoryType(desc.location));
        }
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: device is valid.
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        // SAFETY: buffer was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(err) => {
                // SAFETY: unbound and unused.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        // SAFETY: allocation satisfies the buffer's requirements.
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }
        self.buffers.lock().insert(
            buffer,
            BufferMemory {
                allocation,
                size: desc.size,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        assert!(!self.mapped.contains(buffer), "buffer {buffer:?} destroyed while mapped");
        let memory = self.buffers.lock().remove(&buffer);
        // SAFETY: the caller guarantees no pending GPU work uses the buffer.
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(memory) = memory {
            self.free(memory.allocation);
        }
    }

    fn map_buffer(&self, buffer: vk::Buffer) -> Result<MappedMemory<'_>> {
        let buffers = self.buffers.lock();
        let memory = buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::Other(format!("map of unknown buffer {buffer:?}")))?;
        let ptr = memory
            .allocation
            .mapped_ptr()
            .ok_or_else(|| GpuError::Other(format!("buffer {buffer:?} is not host visible")))?;
        let len = usize::try_from(memory.size)
            .map_err(|_| GpuError::AllocationFailed(format!("{} bytes", memory.size)))?;
        let ptr: NonNull<u8> = ptr.cast();
        drop(buffers);
        self.mapped.claim(buffer);
        // SAFETY: host-visible allocations stay mapped until freed, which
        // destroy_buffer refuses while a guard is live. The claim above
        // rules out a second guard aliasing this one.
        Ok(unsafe {
            MappedMemory::new(ptr, len, Some(Box::new(move || self.mapped.release(buffer))))
        })
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        if !self.supports_location(desc.location) {
            return Err(GpuError::UnsupportedMemoryType(desc.location));
        }
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: device is valid.
        let image = unsafe { self.device.create_image(&info, None)? };
        // SAFETY: image was just created.
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate(desc.name, requirements, desc.location, false) {
            Ok(allocation) => allocation,
            Err(err) => {
                // SAFETY: unbound and unused.
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };
        // SAFETY: allocation satisfies the image's requirements.
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }
        self.images.lock().insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let allocation = self.images.lock().remove(&image);
        // SAFETY: the caller guarantees no pending GPU work uses the image.
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect)
                    .level_count(1)
                    .layer_count(1),
            );
        // SAFETY: image is live.
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: caller guarantees the view is idle.
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(0.0);
        // SAFETY: device is valid.
        Ok(unsafe { self.device.create_sampler(&info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: caller guarantees the sampler is idle.
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        // SAFETY: device is valid.
        Ok(unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: caller guarantees no pending submission uses the fence.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        // SAFETY: fences are live.
        Ok(unsafe { self.device.wait_for_fences(fences, true, timeout_ns)? })
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        // SAFETY: fences are live and not pending.
        Ok(unsafe { self.device.reset_fences(fences)? })
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        // SAFETY: fence is live.
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        // SAFETY: device is valid.
        Ok(unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: caller guarantees no pending operation uses the semaphore.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, transient: bool) -> Result<vk::CommandPool> {
        let flags = if transient {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::empty()
        };
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(flags);
        // SAFETY: device is valid.
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: caller guarantees none of the pool's buffers are pending.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        // SAFETY: as above.
        Ok(unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        })
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: pool is live and owned by the calling worker.
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: cmd is in the initial state.
        Ok(unsafe { self.device.begin_command_buffer(cmd, &info)? })
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        let device = &self.device;
        // SAFETY: cmd is recording and every handle in `command` is live.
        unsafe {
            match command {
                Command::PipelineBarrier {
                    src_stage,
                    dst_stage,
                    image_barriers,
                    buffer_barriers,
                } => {
                    let images: Vec<_> = image_barriers.iter().map(|b| b.to_vk()).collect();
                    let buffers: Vec<_> = buffer_barriers.iter().map(|b| b.to_vk()).collect();
                    device.cmd_pipeline_barrier(
                        cmd,
                        *src_stage,
                        *dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &buffers,
                        &images,
                    );
                }
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cmd, *src, *dst, regions);
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(cmd, *src, *dst, *dst_layout, regions),
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_values,
                } => {
                    let clears: Vec<_> = clear_values.iter().map(|c| c.to_vk()).collect();
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: *extent,
                        })
                        .clear_values(&clears);
                    device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cmd),
                Command::BindPipeline { pipeline } => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, *pipeline);
                }
                Command::BindVertexBuffer {
                    binding,
                    buffer,
                    offset,
                } => device.cmd_bind_vertex_buffers(cmd, *binding, &[*buffer], &[*offset]),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cmd, *buffer, *offset, *index_type),
                Command::BindDescriptorSet {
                    layout,
                    first_set,
                    set,
                } => device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    *layout,
                    *first_set,
                    &[*set],
                    &[],
                ),
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => device.cmd_push_constants(cmd, *layout, *stages, *offset, data),
                Command::SetViewport { viewport } => device.cmd_set_viewport(cmd, 0, &[*viewport]),
                Command::SetScissor { scissor } => device.cmd_set_scissor(cmd, 0, &[*scissor]),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: cmd is recording.
        Ok(unsafe { self.device.end_command_buffer(cmd)? })
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&self, submit: &SubmitInfo<'_>) -> Result<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = submit.waits.iter().copied().unzip();
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signals);
        let queue = self.queue.lock();
        // SAFETY: the queue lock provides external synchronization.
        Ok(unsafe { self.device.queue_submit(*queue, &[info], submit.fence)? })
    }

    fn wait_idle(&self) -> Result<()> {
        let _queue = self.queue.lock();
        // SAFETY: holding the only queue's lock.
        Ok(unsafe { self.device.device_wait_idle()? })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: device is valid.
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: caller guarantees the layout is unused.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        // SAFETY: device is valid.
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: caller guarantees the pool's sets are idle.
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        // SAFETY: as above.
        Ok(unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        })
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: pool is owned by the calling worker.
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter()
            .next()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        for write in writes {
            self.update_one(set, write);
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        let attachments: Vec<_> = desc
            .attachments()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(a.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
            })
            .collect();
        let color_refs: Vec<_> = (0..desc.colors.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.colors.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let dependencies = [desc.external_dependency()];
        let subpasses = [subpass];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        // SAFETY: device is valid; info outlives the call.
        Ok(unsafe { self.device.create_render_pass(&info, None)? })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: caller guarantees the render pass is unused.
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        // SAFETY: views and render pass are live.
        Ok(unsafe { self.device.create_framebuffer(&info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: caller guarantees the framebuffer is idle.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        // SAFETY: set layouts are live.
        Ok(unsafe { self.device.create_pipeline_layout(&info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: caller guarantees the layout is unused.
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline> {
        let module = |code: &[u32]| {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            // SAFETY: code was validated as SPIR-V by the caller.
            unsafe { self.device.create_shader_module(&info, None) }
                .map_err(|e| GpuError::InvalidShader(e.to_string()))
        };
        let vertex = module(&config.vertex_shader)?;
        let fragment = match module(&config.fragment_shader) {
            Ok(fragment) => fragment,
            Err(err) => {
                // SAFETY: unused module.
                unsafe { self.device.destroy_shader_module(vertex, None) };
                return Err(err);
            }
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(c"main"),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .line_width(1.0);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend = if config.alpha_blend {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };
        let blends = vec![blend; config.color_attachment_count as usize];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blends);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        // SAFETY: every referenced handle is live.
        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        // SAFETY: modules are no longer referenced once creation returns.
        unsafe {
            self.device.destroy_shader_module(vertex, None);
            self.device.destroy_shader_module(fragment, None);
        }
        let pipelines = result.map_err(|(_, e)| GpuError::PipelineCreation(e.to_string()))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".into()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: caller guarantees the pipeline is unused.
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn swapchain(&self) -> Result<SwapchainInfo> {
        let presenter = self.presenter()?.lock();
        Ok(SwapchainInfo {
            images: presenter.images.clone(),
            format: presenter.format,
            extent: presenter.extent,
        })
    }

    fn recreate_swapchain(&self, extent: vk::Extent2D) -> Result<SwapchainInfo> {
        self.wait_idle()?;
        {
            let mut presenter = self.presenter()?.lock();
            // SAFETY: the device is idle.
            unsafe { presenter.build(self.physical_device, self.queue_family, extent)? };
        }
        self.swapchain()
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<u32> {
        let presenter = self.presenter()?.lock();
        // SAFETY: the renderer hands out unsignaled acquire semaphores.
        unsafe { presenter.acquire(signal) }
    }

    fn present(&self, image_index: u32, waits: &[vk::Semaphore]) -> Result<bool> {
        let presenter = self.presenter()?.lock();
        let queue = self.queue.lock();
        // SAFETY: the queue lock provides external synchronization.
        unsafe { presenter.present(*queue, image_index, waits) }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            tracing::error!(%err, "wait idle failed during shutdown");
        }
        if let Some(presenter) = self.presenter.as_mut() {
            // SAFETY: the device is idle.
            unsafe { presenter.get_mut().destroy() };
        }

        let buffers: Vec<_> = self.buffers.get_mut().drain().collect();
        let images: Vec<_> = self.images.get_mut().drain().collect();
        if !buffers.is_empty() || !images.is_empty() {
            tracing::warn!(
                buffers = buffers.len(),
                images = images.len(),
                "GPU resources still alive at shutdown"
            );
        }
        for (buffer, memory) in buffers {
            // SAFETY: the device is idle.
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(memory.allocation);
        }
        for (image, allocation) in images {
            // SAFETY: the device is idle.
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
        }

        // The allocator frees its memory blocks on drop, which needs the device.
        drop(self.allocator.get_mut().take());

        // SAFETY: every child object has been destroyed.
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::info!("Vulkan backend destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn config() -> VulkanConfig {
        VulkanConfig::from_engine(&EngineConfig::default(), "umbra-gpu tests", 64, 64)
    }

    #[test]
    fn config_follows_engine_settings() {
        let engine = EngineConfig {
            vsync: true,
            ..EngineConfig::default().with_frames_in_flight(3)
        };
        let config = VulkanConfig::from_engine(&engine, "app", 800, 600);
        assert!(config.vsync);
        assert_eq!(config.image_count, 3);
        assert_eq!(config.extent.width, 800);
    }

    #[test]
    fn mapping_is_exclusive_until_released() {
        let mapped = MappedBuffers::default();
        let buffer = vk::Buffer::from_raw(7);
        mapped.claim(buffer);
        assert!(mapped.contains(buffer));
        mapped.claim(vk::Buffer::from_raw(8));
        mapped.release(buffer);
        assert!(!mapped.contains(buffer));
        mapped.claim(buffer);
    }

    #[test]
    #[should_panic(expected = "mapped twice")]
    fn second_mapping_panics() {
        let mapped = MappedBuffers::default();
        mapped.claim(vk::Buffer::from_raw(7));
        mapped.claim(vk::Buffer::from_raw(7));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn offscreen_backend_has_no_swapchain() {
        let backend = VulkanBackend::offscreen(&config()).unwrap();
        assert!(backend.supports_location(MemoryLocation::GpuOnly));
        assert!(!backend.supports_location(MemoryLocation::Unknown));
        assert!(matches!(
            backend.swapchain(),
            Err(GpuError::SwapchainCreation(_))
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_buffer_round_trip() {
        let backend = VulkanBackend::offscreen(&config()).unwrap();
        let buffer = backend
            .create_buffer(&BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "round trip",
            })
            .unwrap();
        backend.map_buffer(buffer).unwrap().write(4, &[1, 2, 3, 4]);
        assert_eq!(&backend.map_buffer(buffer).unwrap()[4..8], &[1, 2, 3, 4]);
        backend.destroy_buffer(buffer);
    }
}
