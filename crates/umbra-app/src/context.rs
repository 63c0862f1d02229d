//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use umbra_core::EngineConfig;
use umbra_gpu::{Device, GpuStreamer, Renderer, VulkanBackend, VulkanConfig};
use umbra_render::FrameComposer;
use winit::window::Window;

/// Device-level state shared by every application callback.
///
/// Field order is drop order: the device goes before the window its
/// surface was created from.
pub struct AppContext {
    /// Device over the Vulkan backend.
    pub device: Device,
    /// Present-image ring, acquisition and submission.
    pub renderer: Renderer,
    /// Resident scene assets.
    pub streamer: GpuStreamer,
    /// Configuration the device and passes were built with.
    pub config: EngineConfig,
    /// Total frames rendered.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
    device_name: String,
    /// The window handle.
    pub window: Arc<Window>,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, title: &str, config: EngineConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let vulkan = VulkanConfig::from_engine(&config, title, size.width.max(1), size.height.max(1));
        let backend = VulkanBackend::new(window.as_ref(), &vulkan)?;
        let device_name = backend.device_name().to_owned();
        tracing::info!(gpu = %device_name, "Vulkan device created");

        let device = Device::new(Arc::new(backend));
        let renderer = Renderer::new(&device, &config, FrameComposer::CHAIN_SEMAPHORES)?;

        Ok(Self {
            device,
            renderer,
            streamer: GpuStreamer::new(),
            config,
            frame_count: 0,
            last_frame_time: Instant::now(),
            device_name,
            window,
        })
    }

    /// Name of the physical device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.extent()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Number of frames the CPU may record ahead of the GPU.
    pub fn frames_in_flight(&self) -> usize {
        self.renderer.frames_in_flight()
    }

    /// Release the streamer and frame ring. Passes must already be destroyed.
    pub(crate) fn destroy(self) {
        self.renderer.wait_idle(&self.device);
        self.streamer.destroy(&self.device);
        self.renderer.destroy(&self.device);
        self.device.destroy_all();
    }
}
