//! Device seams used by the frame pipeline.
//!
//! The pipeline components never call Vulkan directly. They go through three
//! capability traits, each implemented by the Vulkan backend
//! ([`crate::vulkan::VulkanBackend`]) and by the software backend
//! ([`crate::headless::HeadlessDevice`]):
//!
//! - [`GpuDevice`] - semaphores, fences, command pools, queue submission, image views
//! - [`PresentBackend`] - surfaces, swapchains, acquire and present
//! - [`DeviceAllocator`] - device memory for images and buffers
//!
//! [`GpuContext`] bundles the three so they can be passed around as one owned
//! value.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_rhi::device::GpuContext;
//! use cadence_rhi::headless::HeadlessDevice;
//!
//! let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(640, 480)));
//! let fence = context.device().create_fence(true).expect("fence");
//! assert!(context.device().fence_signaled(fence).expect("status"));
//! context.device().destroy_fence(fence);
//! ```

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::RhiResult;

/// Something a presentable surface can be created for.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceTarget {
    /// A native window.
    Window {
        /// Display connection handle.
        display: RawDisplayHandle,
        /// Window handle.
        window: RawWindowHandle,
    },
    /// An offscreen surface of a fixed initial size (software backend only).
    Headless {
        /// Initial width in pixels.
        width: u32,
        /// Initial height in pixels.
        height: u32,
    },
}

/// A command buffer submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitDesc {
    /// Primary command buffer to execute.
    pub command_buffer: vk::CommandBuffer,
    /// Semaphore to wait on before the color output stage (may be null).
    pub wait_semaphore: vk::Semaphore,
    /// Stage at which the wait happens.
    pub wait_stage: vk::PipelineStageFlags,
    /// Semaphore signaled when execution completes (may be null).
    pub signal_semaphore: vk::Semaphore,
    /// Fence signaled when execution completes (may be null).
    pub fence: vk::Fence,
}

/// Result of asking the presentation engine for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; `suboptimal` asks for a rebuild after this frame.
    Acquired {
        /// Index into the swapchain image list.
        index: u32,
        /// The swapchain still works but no longer matches the surface.
        suboptimal: bool,
    },
    /// The swapchain is out of date or the wait timed out.
    Stale,
}

/// Result of a present request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The image was queued for display.
    Presented,
    /// The image was queued but the swapchain must be rebuilt.
    Stale,
}

/// Parameters for swapchain creation, already resolved against the surface.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Swapchain being replaced, or null.
    pub old_swapchain: vk::SwapchainKHR,
}

/// Surface capabilities, formats and present modes.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Checks if the swapchain support is adequate for rendering.
    ///
    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Opaque identifier for a live device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationHandle(u64);

impl AllocationHandle {
    /// Wraps a backend-chosen identifier.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the backend identifier.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Memory bound to a freshly created image or buffer.
#[derive(Debug)]
pub struct MemoryBlock {
    /// Handle to pass back when freeing.
    pub handle: AllocationHandle,
    /// Device memory object backing the resource.
    pub memory: vk::DeviceMemory,
    /// Memory type the block was allocated from.
    pub memory_type_index: u32,
    /// Allocation size in bytes.
    pub size: vk::DeviceSize,
    /// Host pointer when the memory is host-visible and persistently mapped.
    pub mapped: Option<NonNull<u8>>,
}

/// Image creation request.
#[derive(Clone, Copy, Debug)]
pub struct ImageAllocDesc<'a> {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
    /// Debug name attached to the allocation.
    pub name: &'a str,
}

/// Buffer creation request.
#[derive(Clone, Copy, Debug)]
pub struct BufferAllocDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Debug name attached to the allocation.
    pub name: &'a str,
}

/// Synchronization objects, command recording and queue access.
///
/// Destroy calls accept null handles and ignore them.
pub trait GpuDevice: Send + Sync {
    /// Creates an unsignaled binary semaphore.
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Creates a fence, optionally in the signaled state.
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);

    /// Blocks until the fence signals or the timeout expires.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool>;

    /// Returns the fence to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    /// Non-blocking fence status query.
    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;

    /// Creates a command pool on the graphics queue family.
    fn create_command_pool(&self) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Resets every command buffer allocated from the pool.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;

    /// Allocates one primary command buffer.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer>;

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn graphics_queue(&self) -> vk::Queue;

    fn present_queue(&self) -> vk::Queue;

    /// Submits one command buffer to `queue`.
    fn submit(&self, queue: vk::Queue, submit: &SubmitDesc) -> RhiResult<()>;

    /// Creates a single-level 2D view over `image`.
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    /// Blocks until all queues are idle.
    fn wait_idle(&self) -> RhiResult<()>;

    /// The raw Vulkan device, for recording commands into a command buffer.
    ///
    /// The software backend has none.
    fn raw_device(&self) -> Option<&ash::Device> {
        None
    }
}

/// Surfaces, swapchains and presentation.
pub trait PresentBackend: Send + Sync {
    /// Creates a presentable surface for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::SurfaceError`] when the target cannot be
    /// presented to by this backend.
    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<vk::SurfaceKHR>;

    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    /// Queries what the surface currently supports.
    fn surface_support(&self, surface: vk::SurfaceKHR) -> RhiResult<SwapchainSupportDetails>;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR>;

    /// Images owned by the swapchain, in presentation-engine order.
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquires the next image, signaling `semaphore` when it is ready.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        semaphore: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome>;

    /// Queues `image_index` for presentation after `wait_semaphore` signals.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RhiResult<PresentOutcome>;
}

/// Device memory for images and buffers.
///
/// Allocation creates the resource and binds its memory; freeing releases
/// both together.
pub trait DeviceAllocator: Send + Sync {
    fn allocate_image(&self, desc: &ImageAllocDesc<'_>) -> RhiResult<(vk::Image, MemoryBlock)>;

    fn free_image(&self, image: vk::Image, allocation: AllocationHandle) -> RhiResult<()>;

    fn allocate_buffer(&self, desc: &BufferAllocDesc<'_>) -> RhiResult<(vk::Buffer, MemoryBlock)>;

    fn free_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) -> RhiResult<()>;
}

/// Owned bundle of the device seams.
///
/// Cloning is cheap; every clone refers to the same backend.
#[derive(Clone)]
pub struct GpuContext {
    device: Arc<dyn GpuDevice>,
    present: Arc<dyn PresentBackend>,
    allocator: Arc<dyn DeviceAllocator>,
}

impl GpuContext {
    /// Builds a context from one backend implementing all three seams.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: GpuDevice + PresentBackend + DeviceAllocator + 'static,
    {
        Self {
            device: backend.clone(),
            present: backend.clone(),
            allocator: backend,
        }
    }

    /// Builds a context from separately provided seams.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        present: Arc<dyn PresentBackend>,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Self {
        Self {
            device,
            present,
            allocator,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[inline]
    pub fn present(&self) -> &Arc<dyn PresentBackend> {
        &self.present
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GpuContext>();
    }

    #[test]
    fn test_allocation_handle_roundtrips_raw() {
        let handle = AllocationHandle::from_raw(42);
        assert_eq!(handle.as_raw(), 42);
    }

    #[test]
    fn test_swapchain_support_details_is_adequate() {
        let adequate = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_formats = SwapchainSupportDetails {
            formats: vec![],
            ..adequate.clone()
        };
        assert!(!no_formats.is_adequate());

        let no_modes = SwapchainSupportDetails {
            present_modes: vec![],
            ..adequate
        };
        assert!(!no_modes.is_adequate());
    }
}
