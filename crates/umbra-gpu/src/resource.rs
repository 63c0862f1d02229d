//! Buffers, images and image views, and the builders that create them.
//!
//! A builder collects every creation parameter first and only touches the
//! GPU in `build()`, so no resource ever exists half-configured. Parameters
//! that can never be valid (zero size, no usage) are programmer errors and
//! panic; failures the device reports (allocation, unsupported memory
//! location) come back as [`GpuError`].

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::{BufferDesc, ImageDesc, ImageViewDesc};
use crate::barrier::aspect_for_format;
use crate::device::{BufferId, Device, ImageId, ImageViewId};
use crate::error::{GpuError, Result};

/// A buffer owned by the device arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    pub raw: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl Buffer {
    /// Returns true if the CPU may map this buffer.
    pub fn is_host_visible(&self) -> bool {
        self.location != MemoryLocation::GpuOnly
    }
}

/// A single-mip 2D image owned by the device arena.
///
/// Layout is not tracked here; whoever records barriers against the image
/// knows which layout it is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Image {
    pub raw: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    /// Owned by the swapchain; never destroyed through the device.
    pub external: bool,
}

/// A 2D view of an [`Image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageView {
    pub raw: vk::ImageView,
    pub image: ImageId,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
}

fn check_location(device: &Device, location: MemoryLocation) -> Result<()> {
    if device.backend().supports_location(location) {
        Ok(())
    } else {
        tracing::error!(?location, "requested memory location is not supported");
        Err(GpuError::UnsupportedMemoryType(location))
    }
}

/// Builder for [`Buffer`].
#[must_use = "a builder does nothing until build() is called"]
pub struct BufferBuilder<'d> {
    device: &'d Device,
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    name: String,
}

impl<'d> BufferBuilder<'d> {
    /// Start describing a buffer of `size` bytes in device-local memory.
    pub fn new(device: &'d Device, size: u64) -> Self {
        Self {
            device,
            size,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
            name: String::from("buffer"),
        }
    }

    /// Add usage flags.
    pub fn usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    /// Set the memory location.
    pub fn memory(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    /// Set the debug name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the buffer and register it with the device.
    pub fn build(self) -> Result<BufferId> {
        assert!(self.size > 0, "buffer `{}` has zero size", self.name);
        assert!(!self.usage.is_empty(), "buffer `{}` has no usage flags", self.name);
        check_location(self.device, self.location)?;

        let raw = self.device.backend().create_buffer(&BufferDesc {
            size: self.size,
            usage: self.usage,
            location: self.location,
            name: &self.name,
        })?;
        tracing::debug!(name = %self.name, size = self.size, location = ?self.location, "buffer created");

        Ok(self.device.insert_buffer(Buffer {
            raw,
            size: self.size,
            usage: self.usage,
            location: self.location,
        }))
    }
}

/// Builder for [`Image`].
#[must_use = "a builder does nothing until build() is called"]
pub struct ImageBuilder<'d> {
    device: &'d Device,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    location: MemoryLocation,
    name: String,
}

impl<'d> ImageBuilder<'d> {
    /// Start describing a `width` x `height` RGBA8 image.
    pub fn new(device: &'d Device, width: u32, height: u32) -> Self {
        Self {
            device,
            extent: vk::Extent2D { width, height },
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
            name: String::from("image"),
        }
    }

    /// Set the texel format.
    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    /// Add usage flags.
    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    /// Set the memory location.
    pub fn memory(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    /// Set the debug name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create and bind the image and register it with the device.
    pub fn build(self) -> Result<ImageId> {
        assert!(
            self.extent.width > 0 && self.extent.height > 0,
            "image `{}` has zero extent",
            self.name
        );
        assert!(!self.usage.is_empty(), "image `{}` has no usage flags", self.name);
        check_location(self.device, self.location)?;

        let raw = self.device.backend().create_image(&ImageDesc {
            extent: self.extent,
            format: self.format,
            usage: self.usage,
            location: self.location,
            name: &self.name,
        })?;
        tracing::debug!(
            name = %self.name,
            width = self.extent.width,
            height = self.extent.height,
            format = ?self.format,
            "image created"
        );

        Ok(self.device.insert_image(Image {
            raw,
            format: self.format,
            extent: self.extent,
            usage: self.usage,
            aspect: aspect_for_format(self.format),
            external: false,
        }))
    }
}

/// Builder for [`ImageView`].
#[must_use = "a builder does nothing until build() is called"]
pub struct ImageViewBuilder<'d> {
    device: &'d Device,
    image: ImageId,
    format: Option<vk::Format>,
    aspect: Option<vk::ImageAspectFlags>,
}

impl<'d> ImageViewBuilder<'d> {
    /// Start describing a view of `image`; format and aspect default to the image's.
    pub const fn new(device: &'d Device, image: ImageId) -> Self {
        Self {
            device,
            image,
            format: None,
            aspect: None,
        }
    }

    /// Reinterpret the image with a compatible format.
    pub const fn format(mut self, format: vk::Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Restrict the view to some aspects.
    pub const fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = Some(aspect);
        self
    }

    /// Create the view and register it with the device.
    pub fn build(self) -> Result<ImageViewId> {
        let image = self.device.image(self.image);
        let format = self.format.unwrap_or(image.format);
        let aspect = self.aspect.unwrap_or(image.aspect);
        assert!(
            image.aspect.contains(aspect),
            "view aspect {aspect:?} not present in image aspect {:?}",
            image.aspect
        );

        let raw = self
            .device
            .backend()
            .create_image_view(image.raw, &ImageViewDesc { format, aspect })?;

        Ok(self.device.insert_image_view(ImageView {
            raw,
            image: self.image,
            format,
            aspect,
        }))
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
    fn buffer_builder_records_parameters() {
        let device = device();
        let id = BufferBuilder::new(&device, 1024)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .name("vertices")
            .build()
            .unwrap();

        let buffer = device.buffer(id);
        assert_eq!(buffer.size, 1024);
        assert_eq!(
            buffer.usage,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(buffer.location, MemoryLocation::GpuOnly);
        assert!(!buffer.is_host_visible());
    }

    #[test]
    #[should_panic(expected = "zero size")]
    fn zero_sized_buffer_panics() {
        let device = device();
        let _ = BufferBuilder::new(&device, 0)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .build();
    }

    #[test]
    #[should_panic(expected = "no usage flags")]
    fn buffer_without_usage_panics() {
        let device = device();
        let _ = BufferBuilder::new(&device, 16).build();
    }

    #[test]
    fn unsupported_location_is_an_error() {
        let device = device();
        let err = BufferBuilder::new(&device, 16)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .memory(MemoryLocation::Unknown)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::UnsupportedMemoryType(MemoryLocation::Unknown)
        ));
    }

    #[test]
    fn depth_image_gets_depth_aspect_and_view() {
        let device = device();
        let image = ImageBuilder::new(&device, 64, 32)
            .format(vk::Format::D32_SFLOAT)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .build()
            .unwrap();
        assert_eq!(device.image(image).aspect, vk::ImageAspectFlags::DEPTH);

        let view = ImageViewBuilder::new(&device, image).build().unwrap();
        let view = device.image_view(view);
        assert_eq!(view.image, image);
        assert_eq!(view.format, vk::Format::D32_SFLOAT);
        assert_eq!(view.aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    #[should_panic(expected = "not present in image aspect")]
    fn view_with_foreign_aspect_panics() {
        let device = device();
        let image = ImageBuilder::new(&device, 4, 4)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .build()
            .unwrap();
        let _ = ImageViewBuilder::new(&device, image)
            .aspect(vk::ImageAspectFlags::DEPTH)
            .build();
    }
}
