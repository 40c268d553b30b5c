//! Per-image color targets that live beside the swapchain.
//!
//! Two flavors exist:
//! - offscreen targets, device-local images the scene can render into and
//!   sample from
//! - viewport targets, host-readable images an embedding UI or a screenshot
//!   path copies frames into
//!
//! Both hold one [`ImageResource`] per swapchain image, matching the
//! swapchain's format and extent, and are rebuilt whenever it is.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{debug, info};

use cadence_rhi::RhiResult;
use cadence_rhi::memory::{ImageResource, MemoryAllocator, MemoryHint};

/// Which kind of color targets an [`OffscreenTargets`] allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Offscreen,
    Viewport,
}

impl TargetKind {
    fn usage(self) -> vk::ImageUsageFlags {
        match self {
            TargetKind::Offscreen => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            }
            TargetKind::Viewport => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
            }
        }
    }

    fn hint(self) -> MemoryHint {
        match self {
            TargetKind::Offscreen => MemoryHint::DEVICE_LOCAL,
            TargetKind::Viewport => MemoryHint {
                location: MemoryLocation::GpuToCpu,
                persistent_map: false,
            },
        }
    }

    fn tag(self) -> &'static str {
        match self {
            TargetKind::Offscreen => "offscreen_target",
            TargetKind::Viewport => "viewport_target",
        }
    }
}

/// One color image per swapchain image, or nothing when disabled.
#[derive(Debug)]
pub struct OffscreenTargets {
    kind: TargetKind,
    enabled: bool,
    images: Vec<ImageResource>,
}

impl OffscreenTargets {
    /// Creates an empty set; nothing is allocated until [`OffscreenTargets::resize`].
    pub fn new(kind: TargetKind, enabled: bool) -> Self {
        Self {
            kind,
            enabled,
            images: Vec::new(),
        }
    }

    /// Releases the current images and allocates `count` new ones.
    ///
    /// # Errors
    ///
    /// Returns the allocator error of the first image that fails. Images
    /// allocated before the failure are released, leaving the set empty.
    pub fn resize(
        &mut self,
        memory: &MemoryAllocator,
        format: vk::Format,
        extent: vk::Extent2D,
        count: usize,
    ) -> RhiResult<()> {
        self.destroy(memory);
        if !self.enabled {
            return Ok(());
        }

        self.images.reserve(count);
        for _ in 0..count {
            match memory.create_image(
                format,
                extent,
                self.kind.usage(),
                self.kind.hint(),
                self.kind.tag(),
            ) {
                Ok(image) => self.images.push(image),
                Err(e) => {
                    self.destroy(memory);
                    return Err(e);
                }
            }
        }

        info!(
            "Created {} {:?} target(s): {}x{} ({:?})",
            count, self.kind, extent.width, extent.height, format
        );
        Ok(())
    }

    /// Releases every image. Safe to call repeatedly.
    pub fn destroy(&mut self, memory: &MemoryAllocator) {
        if self.images.is_empty() {
            return;
        }
        for image in &mut self.images {
            memory.destroy_image(image);
        }
        debug!("Destroyed {} {:?} target(s)", self.images.len(), self.kind);
        self.images.clear();
    }

    /// Target paired with swapchain image `index`.
    pub fn image(&self, index: u32) -> Option<&ImageResource> {
        self.images.get(index as usize)
    }

    #[inline]
    pub fn images(&self) -> &[ImageResource] {
        &self.images
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    #[inline]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadence_rhi::device::GpuContext;
    use cadence_rhi::headless::HeadlessDevice;
    use cadence_rhi::registry::AllocationRegistry;

    use super::*;

    const FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

    fn allocator(budget: u64) -> (Arc<AllocationRegistry>, MemoryAllocator) {
        let backend = HeadlessDevice::new(32, 32).with_memory_budget(budget);
        let context = GpuContext::from_backend(Arc::new(backend));
        let registry = Arc::new(AllocationRegistry::new());
        let memory = MemoryAllocator::new(&context, registry.clone());
        (registry, memory)
    }

    #[test]
    fn test_resize_allocates_one_image_per_swapchain_image() {
        let (registry, memory) = allocator(u64::MAX);
        let mut targets = OffscreenTargets::new(TargetKind::Offscreen, true);

        targets
            .resize(&memory, FORMAT, vk::Extent2D { width: 16, height: 16 }, 3)
            .expect("targets");
        assert_eq!(targets.len(), 3);
        assert_eq!(registry.live_count(), 3);
        assert!(targets.images().iter().all(ImageResource::is_valid));

        targets
            .resize(&memory, FORMAT, vk::Extent2D { width: 8, height: 8 }, 2)
            .expect("targets");
        assert_eq!(targets.len(), 2);
        assert_eq!(registry.live_count(), 2);
        assert_eq!(
            targets.image(1).map(|image| image.extent),
            Some(vk::Extent2D { width: 8, height: 8 })
        );
        assert!(targets.image(2).is_none());

        targets.destroy(&memory);
        targets.destroy(&memory);
        assert!(targets.is_empty());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_viewport_targets_are_host_readable() {
        let (registry, memory) = allocator(u64::MAX);
        let mut targets = OffscreenTargets::new(TargetKind::Viewport, true);
        targets
            .resize(&memory, FORMAT, vk::Extent2D { width: 4, height: 4 }, 2)
            .expect("targets");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|record| record.tag == "viewport_target"));
        assert!(snapshot.iter().all(|record| record.memory_type_index == 2));
        targets.destroy(&memory);
    }

    #[test]
    fn test_disabled_targets_allocate_nothing() {
        let (registry, memory) = allocator(u64::MAX);
        let mut targets = OffscreenTargets::new(TargetKind::Offscreen, false);
        targets
            .resize(&memory, FORMAT, vk::Extent2D { width: 16, height: 16 }, 3)
            .expect("resize");
        assert!(targets.is_empty());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_partial_failure_leaves_nothing_behind() {
        // Room for two 16x16 RGBA images but not a third.
        let (registry, memory) = allocator(2 * 16 * 16 * 4 + 10);
        let mut targets = OffscreenTargets::new(TargetKind::Offscreen, true);
        let result = targets.resize(&memory, FORMAT, vk::Extent2D { width: 16, height: 16 }, 3);

        assert!(result.is_err());
        assert!(targets.is_empty());
        assert_eq!(registry.live_count(), 0);
    }
}
