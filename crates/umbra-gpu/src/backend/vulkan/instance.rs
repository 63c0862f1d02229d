//! Instance creation, physical device selection and logical device setup.

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{GpuError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan 1.2 instance with the extensions needed to present to
/// `display`, or none when rendering offscreen.
///
/// # Safety
/// `entry` must be a loaded Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::Other("application name contains a NUL byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Umbra")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions: Vec<*const c_char> = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?
            .to_vec(),
        None => Vec::new(),
    };
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());

    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        // SAFETY: caller guarantees a valid entry.
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if found {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
        }
    }

    #[cfg(target_os = "macos")]
    let flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers)
        .flags(flags);

    // SAFETY: every pointer in create_info outlives this call.
    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

/// A physical device and the queue family the renderer submits to.
#[derive(Clone, Copy, Debug)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub score: i32,
}

/// Pick the highest-scoring device with a graphics queue that can present
/// (when `present` is given).
///
/// # Safety
/// `instance` must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    present: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Result<SelectedDevice> {
    // SAFETY: caller guarantees a valid instance.
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<SelectedDevice> = None;
    for physical_device in devices {
        // SAFETY: `physical_device` was enumerated from `instance`.
        let Some(queue_family) = (unsafe { find_queue_family(instance, physical_device, present) })
        else {
            continue;
        };
        // SAFETY: as above.
        let score = unsafe { score_physical_device(instance, physical_device) };
        if score < 0 {
            continue;
        }
        if best.map_or(true, |b| score > b.score) {
            best = Some(SelectedDevice {
                physical_device,
                queue_family,
                score,
            });
        }
    }

    best.ok_or(GpuError::NoSuitableDevice)
}

unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    present: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Option<u32> {
    // SAFETY: caller guarantees valid handles.
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families.iter().enumerate().find_map(|(index, family)| {
        let index = u32::try_from(index).ok()?;
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            return None;
        }
        let can_present = present.map_or(true, |(loader, surface)| {
            // SAFETY: caller guarantees valid handles.
            unsafe {
                loader
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            }
        });
        can_present.then_some(index)
    })
}

unsafe fn score_physical_device(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> i32 {
    // SAFETY: caller guarantees valid handles.
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    if vk::api_version_major(properties.api_version) == 1
        && vk::api_version_minor(properties.api_version) < 2
    {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // SAFETY: caller guarantees valid handles.
    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size >> 30)
        .sum();
    score += i32::try_from(vram_gb).unwrap_or(i32::MAX / 2);
    score
}

/// Readable device name.
///
/// # Safety
/// Handles must be valid.
pub unsafe fn device_name(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> String {
    // SAFETY: caller guarantees valid handles.
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    properties
        .device_name_as_c_str()
        .map_or_else(|_| "unknown".to_owned(), |name| name.to_string_lossy().into_owned())
}

/// Create the logical device with one queue from `queue_family`.
///
/// # Safety
/// Handles must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
    swapchain: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0_f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(&priorities)];

    let extensions: Vec<*const c_char> = if swapchain {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    // SAFETY: caller guarantees valid handles; create_info outlives the call.
    let device = unsafe { instance.create_device(selected.physical_device, &create_info, None)? };
    // SAFETY: queue 0 of the family was requested above.
    let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };
    Ok((device, queue))
}
