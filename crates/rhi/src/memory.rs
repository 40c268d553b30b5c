//! Memory allocator facade.
//!
//! [`MemoryAllocator`] is the only component that allocates device memory
//! for the frame pipeline. It wraps a [`DeviceAllocator`] backend and
//! reports every allocate and free to an injected [`AllocationObserver`]
//! (usually the [`AllocationRegistry`](crate::registry::AllocationRegistry)).
//!
//! # Overview
//!
//! - [`ImageResource`] - image, view and allocation, owned by whoever created it
//! - [`BufferResource`] - buffer and allocation, optionally persistently mapped
//! - [`MemoryHint`] - where the memory should live and whether to keep it mapped
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_rhi::device::GpuContext;
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::memory::{MemoryAllocator, MemoryHint};
//! use cadence_rhi::registry::AllocationRegistry;
//! use cadence_rhi::vk;
//!
//! # fn main() -> Result<(), cadence_rhi::RhiError> {
//! let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(800, 600)));
//! let registry = Arc::new(AllocationRegistry::new());
//! let memory = MemoryAllocator::new(&context, registry.clone());
//!
//! let mut staging = memory.create_buffer(
//!     256,
//!     vk::BufferUsageFlags::TRANSFER_SRC,
//!     MemoryHint::UPLOAD,
//!     "staging",
//! )?;
//! staging.write(0, &[1, 2, 3, 4])?;
//! assert_eq!(registry.live_count(), 1);
//!
//! memory.destroy_buffer(&mut staging);
//! assert_eq!(registry.live_count(), 0);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{debug, error, warn};

use crate::device::{
    AllocationHandle, BufferAllocDesc, DeviceAllocator, GpuContext, GpuDevice, ImageAllocDesc,
};
use crate::error::{RhiError, RhiResult};
use crate::registry::{AllocationObserver, DeviceAllocationRecord};

/// Placement and mapping preference for an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHint {
    pub location: MemoryLocation,
    /// Keep the memory mapped for the lifetime of the resource.
    pub persistent_map: bool,
}

impl MemoryHint {
    /// Device-local, not host-visible.
    pub const DEVICE_LOCAL: Self = Self {
        location: MemoryLocation::GpuOnly,
        persistent_map: false,
    };

    /// Host-visible memory written by the CPU, mapped for its whole lifetime.
    pub const UPLOAD: Self = Self {
        location: MemoryLocation::CpuToGpu,
        persistent_map: true,
    };

    /// Host-visible memory read back by the CPU, mapped for its whole lifetime.
    pub const READBACK: Self = Self {
        location: MemoryLocation::GpuToCpu,
        persistent_map: true,
    };
}

/// An image, its 2D view and the memory behind it.
///
/// `allocation` is `None` for images the presentation engine owns.
#[derive(Debug, Default)]
pub struct ImageResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<AllocationHandle>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl ImageResource {
    /// True while both the image and its allocation are live.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.image != vk::Image::null() && self.allocation.is_some()
    }
}

/// Host pointer into a persistently mapped allocation.
#[derive(Debug)]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the pointer refers to device memory owned by the enclosing
// BufferResource, which is the only path to it.
unsafe impl Send for MappedMemory {}

impl MappedMemory {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A buffer and the memory behind it.
#[derive(Debug, Default)]
pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub allocation: Option<AllocationHandle>,
    pub size: vk::DeviceSize,
    /// Present only while the buffer is host-visible and mapped.
    pub mapped: Option<MappedMemory>,
}

impl BufferResource {
    /// True while both the buffer and its allocation are live.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null() && self.allocation.is_some()
    }

    /// Writes data to the buffer at the specified offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Byte offset into the buffer
    /// * `data` - Data to write
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer memory is not mapped
    /// - The write would exceed the buffer size
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset
            .checked_add(data.len() as vk::DeviceSize)
            .ok_or_else(|| RhiError::InvalidArgument("Write offset overflows".to_string()))?;
        if end > self.size {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        let mapped = self
            .mapped
            .as_ref()
            .ok_or_else(|| RhiError::InvalidHandle("Buffer memory is not mapped".to_string()))?;

        unsafe {
            let dst = mapped.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(())
    }

    /// Writes a slice of plain-old-data values at `offset`.
    pub fn write_pod<T: bytemuck::Pod>(
        &mut self,
        offset: vk::DeviceSize,
        values: &[T],
    ) -> RhiResult<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// Reads the mapped contents back.
    ///
    /// Returns `None` when the buffer is not mapped.
    pub fn read(&self) -> Option<&[u8]> {
        self.mapped
            .as_ref()
            .map(|m| unsafe { std::slice::from_raw_parts(m.as_ptr(), m.len()) })
    }
}

/// Something that may hold a device allocation.
pub trait AllocatedResource {
    fn allocation(&self) -> Option<AllocationHandle>;
}

impl AllocatedResource for ImageResource {
    fn allocation(&self) -> Option<AllocationHandle> {
        if self.is_valid() { self.allocation } else { None }
    }
}

impl AllocatedResource for BufferResource {
    fn allocation(&self) -> Option<AllocationHandle> {
        if self.is_valid() { self.allocation } else { None }
    }
}

/// Returns true for formats that carry a depth component.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect used for the default view of an image of `format`.
pub fn view_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Creates and destroys device-memory-backed images and buffers.
///
/// # Thread Safety
///
/// All methods take `&self`; the bookkeeping map is behind a `Mutex`.
pub struct MemoryAllocator {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<dyn DeviceAllocator>,
    observer: Arc<dyn AllocationObserver>,
    live: Mutex<HashMap<AllocationHandle, DeviceAllocationRecord>>,
}

impl MemoryAllocator {
    /// Creates a facade over the context's allocator, reporting to `observer`.
    pub fn new(context: &GpuContext, observer: Arc<dyn AllocationObserver>) -> Self {
        Self {
            device: context.device().clone(),
            allocator: context.allocator().clone(),
            observer,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<AllocationHandle, DeviceAllocationRecord>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an image with bound memory and a 2D view.
    ///
    /// Depth formats get a depth-aspect view, everything else a color view.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationError`] when the extent is zero, the
    /// format is undefined, or the backend cannot satisfy the request.
    pub fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        hint: MemoryHint,
        tag: &str,
    ) -> RhiResult<ImageResource> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::AllocationError(format!(
                "Image '{}' has zero extent {}x{}",
                tag, extent.width, extent.height
            )));
        }
        if format == vk::Format::UNDEFINED {
            return Err(RhiError::AllocationError(format!(
                "Image '{tag}' has an undefined format"
            )));
        }

        let (image, block) = self
            .allocator
            .allocate_image(&ImageAllocDesc {
                format,
                extent,
                usage,
                location: hint.location,
                name: tag,
            })
            .map_err(into_allocation_error)?;

        let view = match self
            .device
            .create_image_view(image, format, view_aspect(format))
        {
            Ok(view) => view,
            Err(e) => {
                if let Err(free_err) = self.allocator.free_image(image, block.handle) {
                    error!("Failed to free image '{}' after view failure: {}", tag, free_err);
                }
                return Err(e);
            }
        };

        let record =
            DeviceAllocationRecord::new(block.memory_type_index, block.memory, block.size, tag);
        self.observer.on_allocate(&record);
        self.live().insert(block.handle, record);

        debug!(
            "Created image '{}': {}x{} {:?}, {} bytes",
            tag, extent.width, extent.height, format, block.size
        );

        Ok(ImageResource {
            image,
            view,
            allocation: Some(block.handle),
            extent,
            format,
        })
    }

    /// Creates a buffer with bound memory.
    ///
    /// When `hint.persistent_map` is set the returned buffer's `mapped`
    /// pointer is valid immediately and stays valid until destruction.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationError`] when the size is zero, mapping
    /// was requested for memory that is not host-visible, or the backend
    /// cannot satisfy the request.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        hint: MemoryHint,
        tag: &str,
    ) -> RhiResult<BufferResource> {
        if size == 0 {
            return Err(RhiError::AllocationError(format!(
                "Buffer '{tag}' size must be greater than 0"
            )));
        }

        let (buffer, block) = self
            .allocator
            .allocate_buffer(&BufferAllocDesc {
                size,
                usage,
                location: hint.location,
                name: tag,
            })
            .map_err(into_allocation_error)?;

        let mapped = if hint.persistent_map {
            match block.mapped {
                Some(ptr) => Some(MappedMemory {
                    ptr,
                    len: size as usize,
                }),
                None => {
                    if let Err(e) = self.allocator.free_buffer(buffer, block.handle) {
                        error!("Failed to free unmappable buffer '{}': {}", tag, e);
                    }
                    return Err(RhiError::AllocationError(format!(
                        "Buffer '{}' requested mapping but {:?} memory is not host-visible",
                        tag, hint.location
                    )));
                }
            }
        } else {
            None
        };

        let record =
            DeviceAllocationRecord::new(block.memory_type_index, block.memory, block.size, tag);
        self.observer.on_allocate(&record);
        self.live().insert(block.handle, record);

        debug!("Created buffer '{}': {} bytes", tag, size);

        Ok(BufferResource {
            buffer,
            allocation: Some(block.handle),
            size,
            mapped,
        })
    }

    /// Releases the image with its memory, then its view.
    ///
    /// Calling this on an already destroyed or never created resource is a no-op.
    pub fn destroy_image(&self, resource: &mut ImageResource) {
        if let Some(handle) = resource.allocation.take() {
            if let Err(e) = self.allocator.free_image(resource.image, handle) {
                error!("Failed to free image allocation: {}", e);
            }
            self.notify_free(handle);
        }
        resource.image = vk::Image::null();

        if resource.view != vk::ImageView::null() {
            self.device.destroy_image_view(resource.view);
            resource.view = vk::ImageView::null();
        }
    }

    /// Unmaps and releases the buffer with its memory.
    ///
    /// Calling this on an already destroyed or never created resource is a no-op.
    pub fn destroy_buffer(&self, resource: &mut BufferResource) {
        resource.mapped = None;

        if let Some(handle) = resource.allocation.take() {
            if let Err(e) = self.allocator.free_buffer(resource.buffer, handle) {
                error!("Failed to free buffer allocation: {}", e);
            }
            self.notify_free(handle);
        }
        resource.buffer = vk::Buffer::null();
    }

    fn notify_free(&self, handle: AllocationHandle) {
        let record = self.live().remove(&handle);
        match record {
            Some(record) => self.observer.on_free(&record),
            None => warn!("Freed allocation {:?} that was not tracked", handle),
        }
    }

    /// Size of the memory behind `resource`, or 0 when it is not valid.
    pub fn allocation_size(&self, resource: &impl AllocatedResource) -> vk::DeviceSize {
        resource
            .allocation()
            .and_then(|handle| self.live().get(&handle).map(|r| r.size))
            .unwrap_or(0)
    }

    /// Number of allocations created through this facade and not yet destroyed.
    pub fn outstanding(&self) -> usize {
        self.live().len()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        let live = self.live();
        if !live.is_empty() {
            warn!(
                "Memory allocator dropped with {} outstanding allocation(s)",
                live.len()
            );
        }
    }
}

fn into_allocation_error(err: RhiError) -> RhiError {
    match err {
        RhiError::AllocatorError(inner) => RhiError::AllocationError(inner.to_string()),
        RhiError::VulkanError(
            result @ (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
        ) => RhiError::AllocationError(result.to_string()),
        other => other,
    }
}
