//! Smoke test against a real Vulkan device.

use std::sync::Arc;

use umbra_core::EngineConfig;
use umbra_gpu::{vk, BufferBuilder, Device, MemoryLocation, VulkanBackend, VulkanConfig};

#[test]
#[ignore = "Requires GPU hardware"]
fn offscreen_device_maps_host_buffers() {
    let config = VulkanConfig::from_engine(&EngineConfig::default(), "umbra-test", 64, 64);
    let backend = Arc::new(VulkanBackend::offscreen(&config).expect("Vulkan device"));
    assert!(!backend.device_name().is_empty());
    let device = Device::new(backend);

    let buffer = BufferBuilder::new(&device, 256)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
        .memory(MemoryLocation::CpuToGpu)
        .name("smoke")
        .build()
        .unwrap();
    device.write_buffer(buffer, 16, &[1, 2, 3, 4]);
    device.wait_idle();
    device.destroy_buffer(buffer);
    assert_eq!(device.resource_counts(), (0, 0, 0));
}
