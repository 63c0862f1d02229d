//! Surface and swapchain.

use ash::vk;

use crate::error::{GpuError, Result};

/// A window surface with its swapchain.
pub struct Presenter {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub vsync: bool,
    pub requested_images: u32,
}

impl Presenter {
    /// Build (or rebuild, when `self.swapchain` is not null) the swapchain
    /// at `extent`.
    ///
    /// # Safety
    /// The previous swapchain's images must no longer be in use.
    pub unsafe fn build(
        &mut self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        extent: vk::Extent2D,
    ) -> Result<()> {
        // SAFETY: surface and physical device outlive the presenter.
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            )
        };

        let surface_format = select_surface_format(&formats)?;
        let present_mode = select_present_mode(&modes, self.vsync);
        let extent = calculate_extent(&caps, extent.width, extent.height);
        let image_count = clamp_image_count(&caps, self.requested_images);

        let families = [queue_family];
        let old = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        // SAFETY: create_info references live handles.
        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?
        };
        if old != vk::SwapchainKHR::null() {
            // SAFETY: caller guarantees the old images are idle.
            unsafe { self.swapchain_loader.destroy_swapchain(old, None) };
        }
        // SAFETY: swapchain was just created.
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };

        tracing::debug!(
            images = images.len(),
            width = extent.width,
            height = extent.height,
            ?present_mode,
            format = ?surface_format.format,
            "swapchain built"
        );

        self.swapchain = swapchain;
        self.images = images;
        self.format = surface_format.format;
        self.extent = extent;
        Ok(())
    }

    /// Acquire the next image, signaling `semaphore`.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire(&self, semaphore: vk::Semaphore) -> Result<u32> {
        // SAFETY: guaranteed by the caller.
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    tracing::trace!(index, "acquired image from suboptimal swapchain");
                }
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present `index` after `waits`. Returns true when the swapchain should
    /// be rebuilt.
    ///
    /// # Safety
    /// `queue` must be externally synchronized by the caller.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(&self, queue: vk::Queue, index: u32, waits: &[vk::Semaphore]) -> Result<bool> {
        let swapchains = [self.swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: guaranteed by the caller.
        match unsafe { self.swapchain_loader.queue_present(queue, &info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy the swapchain and surface.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

/// Prefer an sRGB BGRA surface; otherwise take the first reported format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".into()))
}

/// FIFO with vsync; otherwise mailbox, then immediate, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface extent, or the desired size clamped to the surface limits.
pub fn calculate_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// Clamp the requested image count to what the surface allows.
pub fn clamp_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_format_preferred() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            ..unorm
        };
        assert_eq!(select_surface_format(&[unorm, srgb]).unwrap(), srgb);
        assert_eq!(select_surface_format(&[unorm]).unwrap(), unorm);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_fallbacks() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&all[..1], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_clamped_when_surface_is_flexible() {
        let extent = calculate_extent(&caps(2, 8), 8000, 0);
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn image_count_respects_limits() {
        assert_eq!(clamp_image_count(&caps(2, 8), 3), 3);
        assert_eq!(clamp_image_count(&caps(3, 8), 2), 3);
        assert_eq!(clamp_image_count(&caps(2, 2), 3), 2);
        assert_eq!(clamp_image_count(&caps(2, 0), 5), 5);
    }
}
