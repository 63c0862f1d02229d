//! Per-frame-slot uniform and vertex storage.
//!
//! Each slot owns its own buffers, so the CPU can fill the slot it just
//! acquired while the GPU still reads the others. Uniform buffers live in
//! device-local memory and are refreshed through a host-visible staging
//! twin: barrier into the transfer state, copy, barrier back to uniform
//! reads. Scratch vertex buffers are host-visible and only need a
//! host-write barrier.

use ash::vk;
use gpu_allocator::MemoryLocation;

use umbra_gpu::{
    BufferBarrier, BufferBuilder, BufferId, CommandList, Device, FrameIndex, PerFrame, Result,
};

struct UniformSlot {
    staging: BufferId,
    uniform: BufferId,
    written: u64,
}

/// One device-local uniform buffer per frame slot plus its staging twin.
pub struct UniformRing {
    slots: PerFrame<UniformSlot>,
    size: u64,
}

impl UniformRing {
    /// Create `frames` slots of `size` bytes.
    pub fn new(device: &Device, name: &str, size: u64, frames: usize) -> Result<Self> {
        let slots = PerFrame::try_new(frames, |frame| {
            let staging = BufferBuilder::new(device, size)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .memory(MemoryLocation::CpuToGpu)
                .name(format!("{name} staging {}", frame.get()))
                .build()?;
            let uniform = BufferBuilder::new(device, size)
                .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
                .name(format!("{name} {}", frame.get()))
                .build()?;
            Ok::<_, umbra_gpu::GpuError>(UniformSlot {
                staging,
                uniform,
                written: 0,
            })
        })?;
        Ok(Self { slots, size })
    }

    /// Capacity of one slot in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Number of slots.
    pub fn frames(&self) -> usize {
        self.slots.len()
    }

    /// Uniform buffer of `frame`, for descriptor writes.
    pub fn buffer(&self, frame: FrameIndex) -> BufferId {
        self.slots[frame].uniform
    }

    /// Staging twin of `frame`.
    pub fn staging(&self, frame: FrameIndex) -> BufferId {
        self.slots[frame].staging
    }

    /// Bytes staged for `frame` by the last [`UniformRing::write`].
    pub fn written(&self, frame: FrameIndex) -> u64 {
        self.slots[frame].written
    }

    /// Zero every staging twin and record its transfer, so each uniform
    /// buffer starts out zeroed and in the uniform-read state.
    pub fn prime(&self, device: &Device, cmd: &mut CommandList<'_>) {
        let zeros = vec![0; self.size as usize];
        for (_, slot) in self.slots.iter() {
            device.write_buffer(slot.staging, 0, &zeros);
        }
        let mut before = Vec::with_capacity(self.slots.len() * 2);
        for (_, slot) in self.slots.iter() {
            before.push(BufferBarrier::new(
                &device.buffer(slot.staging),
                vk::AccessFlags::HOST_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ));
            before.push(BufferBarrier::new(
                &device.buffer(slot.uniform),
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ));
        }
        cmd.push_barriers(&[], &before);
        for (_, slot) in self.slots.iter() {
            cmd.copy_buffer_to_buffer(slot.staging, 0, slot.uniform, 0, self.size);
        }
        let after: Vec<_> = self
            .slots
            .iter()
            .map(|(_, slot)| {
                BufferBarrier::new(
                    &device.buffer(slot.uniform),
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::UNIFORM_READ,
                )
            })
            .collect();
        cmd.push_barriers(&[], &after);
    }

    /// Stage `bytes` for `frame`. The slot must not be in use by the GPU.
    #[track_caller]
    pub fn write(&mut self, device: &Device, frame: FrameIndex, bytes: &[u8]) {
        assert!(
            bytes.len() as u64 <= self.size,
            "{} uniform bytes do not fit a {} byte slot",
            bytes.len(),
            self.size
        );
        let slot = &mut self.slots[frame];
        device.write_buffer(slot.staging, 0, bytes);
        slot.written = bytes.len() as u64;
    }

    /// Record the copy of the staged bytes of `frame` into its uniform buffer.
    pub fn record_upload(&self, cmd: &mut CommandList<'_>, frame: FrameIndex) {
        let slot = &self.slots[frame];
        if slot.written == 0 {
            return;
        }
        let device = cmd.device();
        let uniform = device.buffer(slot.uniform);
        cmd.push_barriers(
            &[],
            &[
                BufferBarrier::new(
                    &device.buffer(slot.staging),
                    vk::AccessFlags::HOST_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                ),
                BufferBarrier::new(
                    &uniform,
                    vk::AccessFlags::UNIFORM_READ,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            ],
        );
        cmd.copy_buffer_to_buffer(slot.staging, 0, slot.uniform, 0, slot.written);
        cmd.push_buffer_barrier(&BufferBarrier::new(
            &uniform,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::UNIFORM_READ,
        ));
    }

    /// Destroy every slot.
    pub fn destroy(self, device: &Device) {
        for slot in self.slots.into_inner() {
            device.destroy_buffer(slot.staging);
            device.destroy_buffer(slot.uniform);
        }
    }
}

struct VertexSlot {
    buffer: BufferId,
    count: u32,
}

/// Host-visible scratch vertex buffer per frame slot.
pub struct VertexRing {
    slots: PerFrame<VertexSlot>,
    stride: u64,
    capacity: u32,
}

impl VertexRing {
    /// Create `frames` slots holding `capacity` vertices of `stride` bytes.
    pub fn new(device: &Device, name: &str, stride: u64, capacity: u32, frames: usize) -> Result<Self> {
        let slots = PerFrame::try_new(frames, |frame| {
            let buffer = BufferBuilder::new(device, stride * u64::from(capacity))
                .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
                .memory(MemoryLocation::CpuToGpu)
                .name(format!("{name} vertices {}", frame.get()))
                .build()?;
            Ok::<_, umbra_gpu::GpuError>(VertexSlot { buffer, count: 0 })
        })?;
        Ok(Self {
            slots,
            stride,
            capacity,
        })
    }

    /// Maximum vertices per slot.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Vertex buffer of `frame`.
    pub fn buffer(&self, frame: FrameIndex) -> BufferId {
        self.slots[frame].buffer
    }

    /// Vertices written to `frame` by the last [`VertexRing::write`].
    pub fn count(&self, frame: FrameIndex) -> u32 {
        self.slots[frame].count
    }

    /// Copy `vertices` into `frame`. The slot must not be in use by the GPU.
    #[track_caller]
    pub fn write<T: bytemuck::Pod>(&mut self, device: &Device, frame: FrameIndex, vertices: &[T]) {
        assert_eq!(
            std::mem::size_of::<T>() as u64,
            self.stride,
            "vertex type does not match ring stride"
        );
        assert!(
            vertices.len() <= self.capacity as usize,
            "{} vertices exceed ring capacity {}",
            vertices.len(),
            self.capacity
        );
        let slot = &mut self.slots[frame];
        if !vertices.is_empty() {
            device.write_buffer(slot.buffer, 0, bytemuck::cast_slice(vertices));
        }
        slot.count = vertices.len() as u32;
    }

    /// Make the host writes of `frame` visible to vertex fetch.
    pub fn record_upload(&self, cmd: &mut CommandList<'_>, frame: FrameIndex) {
        let slot = &self.slots[frame];
        if slot.count == 0 {
            return;
        }
        let buffer = cmd.device().buffer(slot.buffer);
        cmd.push_buffer_barrier(&BufferBarrier::new(
            &buffer,
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        ));
    }

    /// Destroy every slot.
    pub fn destroy(self, device: &Device) {
        for slot in self.slots.into_inner() {
            device.destroy_buffer(slot.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use umbra_gpu::backend::Command;
    use umbra_gpu::headless::HeadlessBackend;
    use umbra_gpu::CommandPool;

    fn setup() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        (backend, device)
    }

    #[test]
    fn upload_copies_only_written_bytes() {
        let (backend, device) = setup();
        let mut ring = UniformRing::new(&device, "test", 32, 2).unwrap();
        let frame = FrameIndex::new(1);
        ring.write(&device, frame, &[7; 12]);

        let mut pool = CommandPool::new(&device, false).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        ring.record_upload(&mut cmd, frame);
        ring.record_upload(&mut cmd, FrameIndex::new(0));
        cmd.finalize();

        let recorded = backend.recorded_commands(cmd.raw());
        assert_eq!(recorded.len(), 3);
        match &recorded[1] {
            Command::CopyBuffer { regions, .. } => assert_eq!(regions[0].size, 12),
            other => panic!("expected a copy, got {other:?}"),
        }
    }

    #[test]
    fn prime_zeroes_every_slot() {
        let (backend, device) = setup();
        let renderer = umbra_gpu::Renderer::new(&device, &umbra_core::EngineConfig::default(), 0).unwrap();
        let ring = UniformRing::new(&device, "test", 16, 3).unwrap();
        // Host-visible memory carries whatever the allocator handed out.
        for frame in 0..3 {
            device.write_buffer(ring.staging(FrameIndex::new(frame)), 0, &[0xAB; 16]);
        }

        let mut pool = CommandPool::new(&device, true).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        ring.prime(&device, &mut cmd);
        cmd.finalize();
        assert_eq!(cmd.len(), 5);
        renderer.submit_and_wait(&device, &cmd);

        for frame in 0..3 {
            let frame = FrameIndex::new(frame);
            assert_eq!(backend.buffer_contents(device.buffer(ring.buffer(frame)).raw), [0; 16]);
            assert_eq!(backend.buffer_contents(device.buffer(ring.staging(frame)).raw), [0; 16]);
        }
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn oversized_write_panics() {
        let (_backend, device) = setup();
        let mut ring = UniformRing::new(&device, "test", 8, 2).unwrap();
        ring.write(&device, FrameIndex::new(0), &[0; 9]);
    }

    #[test]
    fn empty_vertex_slot_records_nothing() {
        let (_backend, device) = setup();
        let mut ring = VertexRing::new(&device, "lines", 4, 8, 2).unwrap();
        ring.write::<u32>(&device, FrameIndex::new(0), &[]);
        ring.write(&device, FrameIndex::new(1), &[1u32, 2, 3]);
        assert_eq!(ring.count(FrameIndex::new(1)), 3);

        let mut pool = CommandPool::new(&device, false).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        ring.record_upload(&mut cmd, FrameIndex::new(0));
        assert!(cmd.is_empty());
        ring.record_upload(&mut cmd, FrameIndex::new(1));
        assert_eq!(cmd.len(), 1);
        cmd.finalize();
    }
}
