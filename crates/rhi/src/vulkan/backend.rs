//! Vulkan logical device, queues, presentation and memory allocation.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use super::instance::Instance;
use super::physical_device::{PhysicalDeviceInfo, select_physical_device};
use crate::device::{
    AcquireOutcome, AllocationHandle, BufferAllocDesc, DeviceAllocator, GpuDevice, ImageAllocDesc,
    MemoryBlock, PresentBackend, PresentOutcome, SubmitDesc, SurfaceTarget, SwapchainDesc,
    SwapchainSupportDetails,
};
use crate::error::{RhiError, RhiResult};

/// Required device extensions.
const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// Converts a timeout to nanoseconds, saturating at `u64::MAX`.
fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// Vulkan implementation of every device seam.
///
/// Owns the instance, the logical device, one graphics queue (also used for
/// presentation) and a `gpu-allocator` allocator. Every allocation is
/// dedicated, so each one has its own `VkDeviceMemory` and the allocation
/// registry's identity is unique per allocation.
///
/// # Thread Safety
///
/// Shared through `Arc`. The allocator and the table of live allocations are
/// behind mutexes; queue submission is externally synchronized by the
/// single render thread.
pub struct VulkanBackend {
    device: ash::Device,
    physical: PhysicalDeviceInfo,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<AllocationHandle, Allocation>>,
    next_allocation: AtomicU64,
    graphics_family: u32,
    graphics_queue: vk::Queue,
    // Dropped after the device.
    instance: Instance,
}

impl VulkanBackend {
    /// Creates the instance, picks a GPU and creates the logical device.
    ///
    /// # Arguments
    ///
    /// * `enable_validation` - Enable the validation layer when installed
    /// * `display` - Display surfaces will be created for, if any
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::LoadingError`] without a Vulkan loader,
    /// [`RhiError::NoSuitableGpu`] without a Vulkan 1.3 GPU, and
    /// [`RhiError::VulkanError`] / [`RhiError::AllocatorError`] if device or
    /// allocator creation fails.
    pub fn new(enable_validation: bool, display: Option<RawDisplayHandle>) -> RhiResult<Arc<Self>> {
        let instance = Instance::new(enable_validation, display)?;
        let physical = select_physical_device(instance.handle())?;
        let graphics_family = physical
            .queue_families
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical.device, &create_info, None)?
        };
        info!(
            "Logical device created with {} extension(s)",
            DEVICE_EXTENSIONS.len()
        );

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        debug!("Graphics queue retrieved from family {}", graphics_family);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };
        info!("GPU memory allocator initialized");

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), &device);

        Ok(Arc::new(Self {
            device,
            physical,
            surface_loader,
            swapchain_loader,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            next_allocation: AtomicU64::new(1),
            graphics_family,
            graphics_queue,
            instance,
        }))
    }

    /// Returns the selected GPU.
    #[inline]
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    fn allocator(&self) -> MutexGuard<'_, Option<Allocator>> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocations(&self) -> MutexGuard<'_, HashMap<AllocationHandle, Allocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates dedicated memory for a resource and records it.
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        scheme: AllocationScheme,
        linear: bool,
    ) -> RhiResult<(AllocationHandle, Allocation)> {
        let mut guard = self.allocator();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| RhiError::AllocationError("allocator already destroyed".to_string()))?;

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: scheme,
        })?;
        let handle = AllocationHandle::from_raw(self.next_allocation.fetch_add(1, Ordering::Relaxed));
        Ok((handle, allocation))
    }

    fn release(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator().as_mut()
            && let Err(e) = allocator.free(allocation)
        {
            warn!("Failed to free allocation: {}", e);
        }
    }

    fn memory_block(
        &self,
        handle: AllocationHandle,
        allocation: &Allocation,
        type_bits: u32,
    ) -> MemoryBlock {
        let memory_type_index = self
            .physical
            .memory_type_index(type_bits, allocation.memory_properties())
            .unwrap_or_default();
        MemoryBlock {
            handle,
            memory: unsafe { allocation.memory() },
            memory_type_index,
            size: allocation.size(),
            mapped: allocation.mapped_ptr().map(NonNull::cast),
        }
    }
}

impl GpuDevice for VulkanBackend {
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("lost while waiting for a fence".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.graphics_family);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if pool != vk::CommandPool::null() {
            unsafe { self.device.destroy_command_pool(pool, None) };
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn present_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn submit(&self, queue: vk::Queue, submit: &SubmitDesc) -> RhiResult<()> {
        let command_buffers = [submit.command_buffer];
        let wait_semaphores = [submit.wait_semaphore];
        let wait_stages = [submit.wait_stage];
        let signal_semaphores = [submit.signal_semaphore];

        let mut info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if submit.wait_semaphore != vk::Semaphore::null() {
            info = info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }
        if submit.signal_semaphore != vk::Semaphore::null() {
            info = info.signal_semaphores(&signal_semaphores);
        }

        match unsafe { self.device.queue_submit(queue, &[info], submit.fence) } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("queue submission".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if view != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        match unsafe { self.device.device_wait_idle() } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("lost while waiting for idle".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn raw_device(&self) -> Option<&ash::Device> {
        Some(&self.device)
    }
}

impl PresentBackend for VulkanBackend {
    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<vk::SurfaceKHR> {
        let SurfaceTarget::Window { display, window } = *target else {
            return Err(RhiError::SurfaceError(
                "the Vulkan backend needs a native window".to_string(),
            ));
        };

        let surface = unsafe {
            ash_window::create_surface(
                self.instance.entry(),
                self.instance.handle(),
                display,
                window,
                None,
            )?
        };

        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical.device,
                self.graphics_family,
                surface,
            )
        };
        match supported {
            Ok(true) => {
                info!("Window surface created");
                Ok(surface)
            }
            Ok(false) => {
                unsafe { self.surface_loader.destroy_surface(surface, None) };
                Err(RhiError::SurfaceError(format!(
                    "queue family {} cannot present to this surface",
                    self.graphics_family
                )))
            }
            Err(e) => {
                unsafe { self.surface_loader.destroy_surface(surface, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        if surface != vk::SurfaceKHR::null() {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
        }
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> RhiResult<SwapchainSupportDetails> {
        let physical = self.physical.device;
        unsafe {
            Ok(SwapchainSupportDetails {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical, surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical, surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };
        debug!(
            "Swapchain created: {}x{}, {:?}",
            desc.extent.width, desc.extent.height, desc.present_mode
        );
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        semaphore: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns(timeout),
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                Ok(AcquireOutcome::Stale)
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("lost during acquire".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RhiResult<PresentOutcome> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let mut info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&indices);
        if wait_semaphore != vk::Semaphore::null() {
            info = info.wait_semaphores(&wait_semaphores);
        }

        match unsafe { self.swapchain_loader.queue_present(queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("lost during present".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl DeviceAllocator for VulkanBackend {
    fn allocate_image(&self, desc: &ImageAllocDesc<'_>) -> RhiResult<(vk::Image, MemoryBlock)> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let (handle, allocation) = match self.allocate(
            desc.name,
            requirements,
            desc.location,
            AllocationScheme::DedicatedImage(image),
            false,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.release(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        let block = self.memory_block(handle, &allocation, requirements.memory_type_bits);
        self.allocations().insert(handle, allocation);
        Ok((image, block))
    }

    fn free_image(&self, image: vk::Image, allocation: AllocationHandle) -> RhiResult<()> {
        let allocation = self
            .allocations()
            .remove(&allocation)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown allocation {allocation:?}")))?;
        self.release(allocation);
        unsafe { self.device.destroy_image(image, None) };
        Ok(())
    }

    fn allocate_buffer(&self, desc: &BufferAllocDesc<'_>) -> RhiResult<(vk::Buffer, MemoryBlock)> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let (handle, allocation) = match self.allocate(
            desc.name,
            requirements,
            desc.location,
            AllocationScheme::DedicatedBuffer(buffer),
            true,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.release(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        let block = self.memory_block(handle, &allocation, requirements.memory_type_bits);
        self.allocations().insert(handle, allocation);
        Ok((buffer, block))
    }

    fn free_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) -> RhiResult<()> {
        let allocation = self
            .allocations()
            .remove(&allocation)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown allocation {allocation:?}")))?;
        self.release(allocation);
        unsafe { self.device.destroy_buffer(buffer, None) };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }

        let leaked: Vec<Allocation> = self.allocations().drain().map(|(_, a)| a).collect();
        if !leaked.is_empty() {
            warn!("{} allocation(s) still live at device teardown", leaked.len());
        }
        for allocation in leaked {
            self.release(allocation);
        }

        // The allocator frees its memory blocks through the device.
        drop(self.allocator().take());

        unsafe { self.device.destroy_device(None) };
        info!("Logical device destroyed");
    }
}

// SAFETY: ash::Device and the extension loaders are function tables plus
// handles. The allocator and allocation table are behind mutexes, and queue
// access is externally synchronized by the render thread.
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_extensions_defined() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanBackend>();
    }

    #[test]
    fn test_timeout_saturates() {
        assert_eq!(timeout_ns(Duration::from_millis(5)), 5_000_000);
        assert_eq!(timeout_ns(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_headless_target_is_rejected_or_vulkan_missing() {
        match VulkanBackend::new(false, None) {
            Ok(backend) => {
                let target = SurfaceTarget::Headless {
                    width: 64,
                    height: 64,
                };
                assert!(matches!(
                    backend.create_surface(&target),
                    Err(RhiError::SurfaceError(_))
                ));
            }
            Err(e) => eprintln!("Skipping test: Vulkan backend unavailable: {e}"),
        }
    }
}
