//! Descriptor set layouts, pools and writes.

use ash::vk;

use crate::backend::{DescriptorBinding, DescriptorResource, DescriptorWrite};
use crate::device::{BufferId, Device, ImageViewId};
use crate::error::{GpuError, Result};
use crate::pipeline::Sampler;

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    #[must_use]
    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        assert!(
            self.bindings.iter().all(|b| b.binding != binding),
            "descriptor binding {binding} declared twice"
        );
        self.bindings.push(DescriptorBinding {
            binding,
            ty,
            count,
            stages,
        });
        self
    }

    /// Add a uniform buffer binding.
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Add a storage buffer binding.
    #[must_use]
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stages)
    }

    /// Add a sampled image binding.
    #[must_use]
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, stages)
    }

    /// Build the layout.
    pub fn build(self, device: &Device) -> Result<DescriptorSetLayout> {
        let raw = device
            .backend()
            .create_descriptor_set_layout(&self.bindings)?;
        Ok(DescriptorSetLayout {
            raw,
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout.
pub struct DescriptorSetLayout {
    raw: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    /// Raw handle.
    pub const fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    /// Declared bindings.
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Pool sizes needed for `sets` sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.bindings
            .iter()
            .map(|b| vk::DescriptorPoolSize {
                ty: b.ty,
                descriptor_count: b.count * sets,
            })
            .collect()
    }

    /// Destroy the layout.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_descriptor_set_layout(self.raw);
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    raw: vk::DescriptorPool,
    max_sets: u32,
    allocated: u32,
}

impl DescriptorPool {
    /// Default pool sizes, generous enough for the built-in passes.
    pub fn default_sizes(max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
        ]
    }

    /// Create a new descriptor pool.
    pub fn new(device: &Device, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Result<Self> {
        let raw = device.backend().create_descriptor_pool(max_sets, sizes)?;
        Ok(Self {
            raw,
            max_sets,
            allocated: 0,
        })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::DescriptorPool {
        self.raw
    }

    /// Sets allocated since the last reset.
    pub const fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Allocate one set.
    pub fn allocate(
        &mut self,
        device: &Device,
        layout: &DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        if self.allocated == self.max_sets {
            return Err(GpuError::DescriptorPoolExhausted(self.max_sets));
        }
        let set = device
            .backend()
            .allocate_descriptor_set(self.raw, layout.raw())?;
        self.allocated += 1;
        Ok(set)
    }

    /// Free every set. None may be referenced by pending work.
    pub fn reset(&mut self, device: &Device) -> Result<()> {
        device.backend().reset_descriptor_pool(self.raw)?;
        self.allocated = 0;
        Ok(())
    }

    /// Destroy the pool.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_descriptor_pool(self.raw);
    }
}

/// Batches writes into one descriptor set.
#[must_use = "writes are applied by update()"]
pub struct DescriptorWriter<'d> {
    device: &'d Device,
    set: vk::DescriptorSet,
    writes: Vec<DescriptorWrite>,
}

impl<'d> DescriptorWriter<'d> {
    /// Start writing into `set`.
    pub const fn new(device: &'d Device, set: vk::DescriptorSet) -> Self {
        Self {
            device,
            set,
            writes: Vec::new(),
        }
    }

    /// Bind the whole of a uniform buffer.
    pub fn uniform_buffer(self, binding: u32, buffer: BufferId) -> Self {
        let size = self.device.buffer(buffer).size;
        self.uniform_buffer_range(binding, buffer, 0, size)
    }

    /// Bind a range of a uniform buffer.
    pub fn uniform_buffer_range(
        mut self,
        binding: u32,
        buffer: BufferId,
        offset: u64,
        range: u64,
    ) -> Self {
        let buffer = self.device.buffer(buffer);
        assert!(
            buffer.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER),
            "buffer bound as uniform lacks UNIFORM_BUFFER usage"
        );
        self.writes.push(DescriptorWrite {
            binding,
            array_element: 0,
            resource: DescriptorResource::UniformBuffer {
                buffer: buffer.raw,
                offset,
                range,
            },
        });
        self
    }

    /// Bind a sampled image in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn sampled_image(mut self, binding: u32, view: ImageViewId, sampler: &Sampler) -> Self {
        let view = self.device.image_view(view);
        self.writes.push(DescriptorWrite {
            binding,
            array_element: 0,
            resource: DescriptorResource::CombinedImageSampler {
                view: view.raw,
                sampler: sampler.raw(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        });
        self
    }

    /// Apply the writes.
    pub fn update(self) {
        if !self.writes.is_empty() {
            self.device
                .backend()
                .update_descriptor_set(self.set, &self.writes);
        }
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
    fn pool_sizes_scale_with_set_count() {
        let device = device();
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)
            .unwrap();
        let sizes = layout.pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 3));
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_binding_panics() {
        let _ = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn pool_exhaustion_and_reset() {
        let device = device();
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(&device)
            .unwrap();
        let mut pool = DescriptorPool::new(&device, 2, &layout.pool_sizes(2)).unwrap();

        pool.allocate(&device, &layout).unwrap();
        pool.allocate(&device, &layout).unwrap();
        assert!(matches!(
            pool.allocate(&device, &layout),
            Err(GpuError::DescriptorPoolExhausted(2))
        ));

        pool.reset(&device).unwrap();
        assert_eq!(pool.allocated(), 0);
        pool.allocate(&device, &layout).unwrap();
    }
}
