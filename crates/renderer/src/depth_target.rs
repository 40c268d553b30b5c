//! Depth attachment sized to the swapchain.
//!
//! The [`DepthTarget`] owns one depth image allocated through the
//! [`MemoryAllocator`]. It is rebuilt whenever the swapchain is rebuilt and
//! released during the allocator stage of shutdown.

use ash::vk;
use tracing::{debug, info};

use cadence_core::DepthFormat;
use cadence_rhi::RhiResult;
use cadence_rhi::memory::{ImageResource, MemoryAllocator, MemoryHint};

/// Maps the configured depth format to a Vulkan format.
///
/// Returns `None` when depth is disabled.
pub fn depth_vk_format(format: DepthFormat) -> Option<vk::Format> {
    match format {
        DepthFormat::D32 => Some(vk::Format::D32_SFLOAT),
        DepthFormat::D24S8 => Some(vk::Format::D24_UNORM_S8_UINT),
        DepthFormat::None => None,
    }
}

/// Optional depth image matching the swapchain extent.
#[derive(Debug)]
pub struct DepthTarget {
    format: Option<vk::Format>,
    image: ImageResource,
}

impl DepthTarget {
    /// Creates an empty target; nothing is allocated until [`DepthTarget::resize`].
    pub fn new(format: Option<vk::Format>) -> Self {
        Self {
            format,
            image: ImageResource::default(),
        }
    }

    /// Releases the current image and allocates one at `extent`.
    ///
    /// Does nothing beyond the release when depth is disabled.
    ///
    /// # Errors
    ///
    /// Returns the allocator error if the new image cannot be created; the
    /// target is left empty in that case.
    pub fn resize(&mut self, memory: &MemoryAllocator, extent: vk::Extent2D) -> RhiResult<()> {
        self.destroy(memory);
        let Some(format) = self.format else {
            return Ok(());
        };

        self.image = memory.create_image(
            format,
            extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            MemoryHint::DEVICE_LOCAL,
            "depth_target",
        )?;
        info!(
            "Created depth target: {}x{} ({:?})",
            extent.width, extent.height, format
        );
        Ok(())
    }

    /// Releases the image. Safe to call repeatedly.
    pub fn destroy(&mut self, memory: &MemoryAllocator) {
        if self.image.is_valid() {
            memory.destroy_image(&mut self.image);
            debug!("Destroyed depth target");
        }
    }

    /// The live depth image, if depth is enabled and allocated.
    pub fn image(&self) -> Option<&ImageResource> {
        self.image.is_valid().then_some(&self.image)
    }

    #[inline]
    pub fn format(&self) -> Option<vk::Format> {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadence_rhi::device::GpuContext;
    use cadence_rhi::headless::HeadlessDevice;
    use cadence_rhi::registry::AllocationRegistry;

    use super::*;

    fn allocator() -> (Arc<AllocationRegistry>, MemoryAllocator) {
        let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(32, 32)));
        let registry = Arc::new(AllocationRegistry::new());
        let memory = MemoryAllocator::new(&context, registry.clone());
        (registry, memory)
    }

    #[test]
    fn test_depth_format_mapping() {
        assert_eq!(depth_vk_format(DepthFormat::D32), Some(vk::Format::D32_SFLOAT));
        assert_eq!(
            depth_vk_format(DepthFormat::D24S8),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(depth_vk_format(DepthFormat::None), None);
    }

    #[test]
    fn test_resize_replaces_the_allocation() {
        let (registry, memory) = allocator();
        let mut depth = DepthTarget::new(Some(vk::Format::D32_SFLOAT));
        assert!(depth.image().is_none());

        depth
            .resize(&memory, vk::Extent2D { width: 32, height: 32 })
            .expect("depth");
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.live_bytes(), 32 * 32 * 4);

        depth
            .resize(&memory, vk::Extent2D { width: 16, height: 8 })
            .expect("depth");
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.live_bytes(), 16 * 8 * 4);
        assert_eq!(
            depth.image().map(|image| image.extent),
            Some(vk::Extent2D { width: 16, height: 8 })
        );

        depth.destroy(&memory);
        depth.destroy(&memory);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_disabled_depth_allocates_nothing() {
        let (registry, memory) = allocator();
        let mut depth = DepthTarget::new(None);
        depth
            .resize(&memory, vk::Extent2D { width: 32, height: 32 })
            .expect("resize");
        assert!(depth.image().is_none());
        assert_eq!(registry.live_count(), 0);
    }
}
