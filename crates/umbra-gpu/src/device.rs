//! Device: the backend plus the arena of resources created through it.
//!
//! Everything else holds a `&Device` and refers to resources by
//! [`BufferId`], [`ImageId`] and [`ImageViewId`]. Looking up a handle that
//! was never created, or was already destroyed, is a programmer error.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::RwLock;
use umbra_core::{Arena, Handle};

use crate::backend::{Backend, MappedMemory};
use crate::barrier::aspect_for_format;
use crate::error::GpuResultExt;
use crate::resource::{Buffer, Image, ImageView};

/// Handle to a [`Buffer`].
pub type BufferId = Handle<Buffer>;
/// Handle to an [`Image`].
pub type ImageId = Handle<Image>;
/// Handle to an [`ImageView`].
pub type ImageViewId = Handle<ImageView>;

#[derive(Default)]
struct Resources {
    buffers: Arena<Buffer>,
    images: Arena<Image>,
    views: Arena<ImageView>,
}

/// Logical GPU device.
pub struct Device {
    backend: Arc<dyn Backend>,
    resources: RwLock<Resources>,
}

impl Device {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        tracing::info!(backend = backend.name(), "device created");
        Self {
            backend,
            resources: RwLock::new(Resources::default()),
        }
    }

    /// The backend.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Shared handle to the backend.
    pub fn backend_arc(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    pub(crate) fn insert_buffer(&self, buffer: Buffer) -> BufferId {
        self.resources.write().buffers.insert(buffer)
    }

    pub(crate) fn insert_image(&self, image: Image) -> ImageId {
        self.resources.write().images.insert(image)
    }

    pub(crate) fn insert_image_view(&self, view: ImageView) -> ImageViewId {
        self.resources.write().views.insert(view)
    }

    /// Register a present image owned by the swapchain.
    pub fn register_external_image(
        &self,
        raw: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> ImageId {
        self.insert_image(Image {
            raw,
            format,
            extent,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            aspect: aspect_for_format(format),
            external: true,
        })
    }

    /// Look up a buffer.
    #[track_caller]
    pub fn buffer(&self, id: BufferId) -> Buffer {
        match self.resources.read().buffers.get(id) {
            Some(buffer) => *buffer,
            None => panic!("unknown buffer {id:?}"),
        }
    }

    /// Look up an image.
    #[track_caller]
    pub fn image(&self, id: ImageId) -> Image {
        match self.resources.read().images.get(id) {
            Some(image) => *image,
            None => panic!("unknown image {id:?}"),
        }
    }

    /// Look up an image view.
    #[track_caller]
    pub fn image_view(&self, id: ImageViewId) -> ImageView {
        match self.resources.read().views.get(id) {
            Some(view) => *view,
            None => panic!("unknown image view {id:?}"),
        }
    }

    /// Returns true if `id` names a live buffer.
    pub fn contains_buffer(&self, id: BufferId) -> bool {
        self.resources.read().buffers.contains(id)
    }

    /// Map a host-visible buffer for CPU access.
    ///
    /// Device-local buffers are never written by the CPU; mapping one panics.
    #[track_caller]
    pub fn map_buffer(&self, id: BufferId) -> MappedMemory<'_> {
        let buffer = self.buffer(id);
        assert!(
            buffer.location != MemoryLocation::GpuOnly,
            "CPU mapping of device-local buffer {id:?}"
        );
        self.backend.map_buffer(buffer.raw).or_fatal("buffer map")
    }

    /// Copy `data` into a host-visible buffer at `offset`.
    pub fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) {
        let mut mapped = self.map_buffer(id);
        mapped.write(offset as usize, data);
    }

    /// Destroy a buffer. The caller guarantees no pending GPU work uses it.
    pub fn destroy_buffer(&self, id: BufferId) {
        let Some(buffer) = self.resources.write().buffers.remove(id) else {
            panic!("destroy of unknown buffer {id:?}");
        };
        self.backend.destroy_buffer(buffer.raw);
    }

    /// Destroy an image. Swapchain images are only unregistered.
    pub fn destroy_image(&self, id: ImageId) {
        let Some(image) = self.resources.write().images.remove(id) else {
            panic!("destroy of unknown image {id:?}");
        };
        if !image.external {
            self.backend.destroy_image(image.raw);
        }
    }

    /// Destroy an image view.
    pub fn destroy_image_view(&self, id: ImageViewId) {
        let Some(view) = self.resources.write().views.remove(id) else {
            panic!("destroy of unknown image view {id:?}");
        };
        self.backend.destroy_image_view(view.raw);
    }

    /// Number of live (buffers, images, views).
    pub fn resource_counts(&self) -> (usize, usize, usize) {
        let resources = self.resources.read();
        (
            resources.buffers.len(),
            resources.images.len(),
            resources.views.len(),
        )
    }

    /// Block until the GPU is idle.
    pub fn wait_idle(&self) {
        self.backend.wait_idle().or_fatal("device wait idle");
    }

    /// Destroy every remaining resource. Call after [`Device::wait_idle`].
    pub fn destroy_all(&self) {
        let mut resources = self.resources.write();
        let (views, images, buffers) = (
            resources.views.drain(),
            resources.images.drain(),
            resources.buffers.drain(),
        );
        drop(resources);

        if !(views.is_empty() && images.is_empty() && buffers.is_empty()) {
            tracing::debug!(
                views = views.len(),
                images = images.len(),
                buffers = buffers.len(),
                "destroying remaining resources"
            );
        }
        for (_, view) in views {
            self.backend.destroy_image_view(view.raw);
        }
        for (_, image) in images.into_iter().filter(|(_, image)| !image.external) {
            self.backend.destroy_image(image.raw);
        }
        for (_, buffer) in buffers {
            self.backend.destroy_buffer(buffer.raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::resource::BufferBuilder;

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        (backend, device)
    }

    #[test]
    fn write_then_read_host_buffer() {
        let (backend, device) = device();
        let id = BufferBuilder::new(&device, 8)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory(MemoryLocation::CpuToGpu)
            .build()
            .unwrap();

        device.write_buffer(id, 4, &[9, 8, 7, 6]);
        assert_eq!(
            backend.buffer_contents(device.buffer(id).raw),
            [0, 0, 0, 0, 9, 8, 7, 6]
        );
    }

    #[test]
    #[should_panic(expected = "CPU mapping of device-local buffer")]
    fn mapping_device_local_panics() {
        let (_backend, device) = device();
        let id = BufferBuilder::new(&device, 8)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .build()
            .unwrap();
        let _ = device.map_buffer(id);
    }

    #[test]
    #[should_panic(expected = "unknown buffer")]
    fn destroyed_handle_is_rejected() {
        let (_backend, device) = device();
        let id = BufferBuilder::new(&device, 8)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .build()
            .unwrap();
        device.destroy_buffer(id);
        let _ = device.buffer(id);
    }

    #[test]
    fn destroy_all_releases_backend_objects() {
        let (backend, device) = device();
        for _ in 0..3 {
            BufferBuilder::new(&device, 8)
                .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
                .build()
                .unwrap();
        }
        let external = device.register_external_image(
            vk::Image::null(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
        );
        assert!(device.image(external).external);
        assert_eq!(device.resource_counts(), (3, 1, 0));

        device.destroy_all();
        assert_eq!(device.resource_counts(), (0, 0, 0));
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
