//! GPU error types and the fatal-failure policy.
//!
//! Setup paths (builders, pipeline creation, backend construction) return
//! [`Result`]. Per-frame paths treat any failing GPU call as device loss:
//! they log the failure and abort through [`fatal`] instead of handing an
//! error back into the frame loop.

use ash::vk;
use gpu_allocator::MemoryLocation;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The device exposes no memory type for the requested location.
    #[error("Unsupported memory location: {0:?}")]
    UnsupportedMemoryType(MemoryLocation),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Shader module creation failed.
    #[error("Invalid shader: {0}")]
    InvalidShader(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Descriptor pool exhausted.
    #[error("Descriptor pool exhausted ({0} sets)")]
    DescriptorPoolExhausted(u32),

    /// Core error.
    #[error(transparent)]
    Core(#[from] umbra_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Abort after a GPU failure that the frame loop cannot recover from.
#[cold]
#[track_caller]
pub fn fatal(context: &str, err: &GpuError) -> ! {
    tracing::error!(%err, "fatal GPU failure during {context}");
    panic!("fatal GPU failure during {context}: {err}");
}

/// Extension for results produced on per-frame paths.
pub trait GpuResultExt<T> {
    /// Unwrap the value or abort via [`fatal`].
    fn or_fatal(self, context: &str) -> T;
}

impl<T> GpuResultExt<T> for Result<T> {
    #[track_caller]
    fn or_fatal(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(context, &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_passes_through() {
        let value: Result<u32> = Ok(7);
        assert_eq!(value.or_fatal("test"), 7);
    }

    #[test]
    #[should_panic(expected = "fatal GPU failure during queue submit")]
    fn error_aborts() {
        let value: Result<()> = Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        value.or_fatal("queue submit");
    }

    #[test]
    fn vulkan_error_converts() {
        let err: GpuError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(err, GpuError::Vulkan(_)));
    }
}
