//! Vulkan implementation of the device seams.
//!
//! [`VulkanBackend`] is built from an [`instance::Instance`] and the GPU picked
//! by [`physical_device::select_physical_device`], and implements
//! [`GpuDevice`](crate::device::GpuDevice),
//! [`PresentBackend`](crate::device::PresentBackend) and
//! [`DeviceAllocator`](crate::device::DeviceAllocator) on top of `ash`,
//! `ash-window` and `gpu-allocator`.

mod backend;
pub mod instance;
pub mod physical_device;

pub use backend::VulkanBackend;
