//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
///
/// Errors fall into three groups:
/// - recoverable at the call site (allocation failures, invalid handles)
/// - recoverable by rebuilding the swapchain ([`RhiError::is_stale`])
/// - fatal for the session ([`RhiError::is_fatal`])
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// The allocator could not satisfy an image or buffer request
    #[error("Allocation failed: {0}")]
    AllocationError(String),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain creation or query error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Presentation failed
    #[error("Present error: {0}")]
    PresentError(String),

    /// The device or its queue was lost
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A frame slot's fence did not signal within the configured timeout
    #[error("Timed out waiting for the fence of frame slot {slot}")]
    FenceTimeout {
        /// Index of the slot that never signaled.
        slot: usize,
    },

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A caller-supplied value is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RhiError {
    /// Returns true when the session cannot continue issuing frames.
    pub fn is_fatal(&self) -> bool {
        match self {
            RhiError::DeviceLost(_) | RhiError::FenceTimeout { .. } => true,
            RhiError::VulkanError(result) => *result == vk::Result::ERROR_DEVICE_LOST,
            _ => false,
        }
    }

    /// Returns true when the error is cured by recreating the swapchain.
    pub fn is_stale(&self) -> bool {
        match self {
            RhiError::PresentError(_) | RhiError::SurfaceError(_) => true,
            RhiError::VulkanError(result) => matches!(
                *result,
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR
            ),
            _ => false,
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RhiError::DeviceLost("queue".into()).is_fatal());
        assert!(RhiError::FenceTimeout { slot: 1 }.is_fatal());
        assert!(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(!RhiError::AllocationError("oom".into()).is_fatal());
        assert!(!RhiError::PresentError("lost".into()).is_fatal());
    }

    #[test]
    fn test_stale_classification() {
        assert!(RhiError::PresentError("out of date".into()).is_stale());
        assert!(RhiError::SurfaceError("gone".into()).is_stale());
        assert!(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR).is_stale());
        assert!(!RhiError::FenceTimeout { slot: 0 }.is_stale());
        assert!(!RhiError::NoSuitableGpu.is_stale());
    }

    #[test]
    fn test_invalid_argument_is_recoverable() {
        let err = RhiError::InvalidArgument("offset 12 past end".into());
        assert!(!err.is_fatal());
        assert!(!err.is_stale());
        assert_eq!(err.to_string(), "Invalid argument: offset 12 past end");
    }
}
