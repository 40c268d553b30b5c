//! Swapchain management.
//!
//! This module handles surface binding, swapchain creation and recreation,
//! image acquisition, and presentation.
//!
//! # Overview
//!
//! The [`SwapchainManager`] owns the surface, the current swapchain and one
//! [`ImageResource`] per presentable image. It moves through
//! [`SwapchainState`]:
//!
//! ```text
//! Uninitialized -> SurfaceBound -> Created -> (Stale) -> Recreating -> Created -> ... -> Destroyed
//! ```
//!
//! A swapchain becomes stale when acquire or present reports it out of
//! date, or when acquire times out. The caller must call
//! [`SwapchainManager::recreate`] before the next frame.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cadence_rhi::device::{AcquireOutcome, GpuContext, SurfaceTarget};
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::swapchain::{SwapchainManager, SwapchainProperties};
//!
//! # fn main() -> Result<(), cadence_rhi::RhiError> {
//! let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(800, 600)));
//! let mut swapchain = SwapchainManager::new(&context, Duration::from_secs(1));
//! swapchain.create_surface(&SurfaceTarget::Headless { width: 800, height: 600 })?;
//!
//! let support = swapchain.query_support()?;
//! let properties = SwapchainProperties::select(&support, 800, 600)?;
//! swapchain.create(properties, &support)?;
//!
//! let semaphore = context.device().create_semaphore()?;
//! if let AcquireOutcome::Acquired { index, .. } = swapchain.request_image(semaphore)? {
//!     swapchain.present(context.device().present_queue(), index, semaphore)?;
//! }
//!
//! swapchain.destroy();
//! context.device().destroy_semaphore(semaphore);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::{
    AcquireOutcome, GpuContext, GpuDevice, PresentBackend, PresentOutcome, SurfaceTarget,
    SwapchainDesc, SwapchainSupportDetails,
};
use crate::error::{RhiError, RhiResult};
use crate::memory::ImageResource;

/// Lifecycle of a [`SwapchainManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    SurfaceBound,
    Created,
    /// Acquire or present reported the swapchain out of date.
    Stale,
    Recreating,
    Destroyed,
}

/// Resolved swapchain parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainProperties {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainProperties {
    /// Picks format, present mode, extent and image count for a surface.
    ///
    /// `width` and `height` are used only when the surface leaves the
    /// extent up to the swapchain.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainError`] if the surface offers no format
    /// or no present mode.
    pub fn select(support: &SwapchainSupportDetails, width: u32, height: u32) -> RhiResult<Self> {
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        Ok(Self {
            surface_format: choose_surface_format(&support.formats),
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_extent(&support.capabilities, width, height),
            image_count: determine_image_count(&support.capabilities),
        })
    }
}

/// Owns the surface, swapchain and presentable images.
///
/// # Thread Safety
///
/// The manager is driven from the render thread only.
pub struct SwapchainManager {
    device: Arc<dyn GpuDevice>,
    present: Arc<dyn PresentBackend>,
    state: SwapchainState,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    /// Handle being replaced; only set while a recreation is in progress.
    previous: Option<vk::SwapchainKHR>,
    images: Vec<ImageResource>,
    properties: Option<SwapchainProperties>,
    acquire_timeout: Duration,
}

impl SwapchainManager {
    /// Creates an empty manager; no Vulkan objects exist until
    /// [`SwapchainManager::create_surface`].
    pub fn new(context: &GpuContext, acquire_timeout: Duration) -> Self {
        Self {
            device: context.device().clone(),
            present: context.present().clone(),
            state: SwapchainState::Uninitialized,
            surface: vk::SurfaceKHR::null(),
            swapchain: vk::SwapchainKHR::null(),
            previous: None,
            images: Vec::new(),
            properties: None,
            acquire_timeout,
        }
    }

    /// Binds a presentable surface.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceError`] if a surface is already bound or the
    /// backend cannot create one for `target`.
    pub fn create_surface(&mut self, target: &SurfaceTarget) -> RhiResult<()> {
        if self.state != SwapchainState::Uninitialized {
            return Err(RhiError::SurfaceError(format!(
                "Surface cannot be bound in state {:?}",
                self.state
            )));
        }

        self.surface = self.present.create_surface(target).map_err(|e| match e {
            RhiError::SurfaceError(_) => e,
            other => RhiError::SurfaceError(other.to_string()),
        })?;
        self.state = SwapchainState::SurfaceBound;
        info!("Surface bound");
        Ok(())
    }

    /// Queries the bound surface's capabilities, formats and present modes.
    pub fn query_support(&self) -> RhiResult<SwapchainSupportDetails> {
        if self.surface == vk::SurfaceKHR::null() {
            return Err(RhiError::SurfaceError("No surface bound".to_string()));
        }
        self.present.surface_support(self.surface)
    }

    /// Current surface extent, if the surface reports one.
    ///
    /// Returns `None` when the surface lets the swapchain pick its extent.
    pub fn surface_extent(&self) -> RhiResult<Option<vk::Extent2D>> {
        let capabilities = self.query_support()?.capabilities;
        if capabilities.current_extent.width == u32::MAX {
            Ok(None)
        } else {
            Ok(Some(capabilities.current_extent))
        }
    }

    /// Creates a swapchain and its presentable images.
    ///
    /// An existing swapchain is passed as `old_swapchain` and kept as the
    /// previous handle so in-flight presents can finish against it.
    ///
    /// # Errors
    ///
    /// Returns an error if no surface is bound, the extent is zero, or the
    /// backend fails to create the swapchain or its image views.
    pub fn create(
        &mut self,
        properties: SwapchainProperties,
        support: &SwapchainSupportDetails,
    ) -> RhiResult<()> {
        if self.surface == vk::SurfaceKHR::null() {
            return Err(RhiError::SwapchainError("No surface bound".to_string()));
        }
        if properties.extent.width == 0 || properties.extent.height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "Cannot create a {}x{} swapchain",
                properties.extent.width, properties.extent.height
            )));
        }

        info!(
            "Creating swapchain: {}x{}, format {:?}, color space {:?}, present mode {:?}, {} images",
            properties.extent.width,
            properties.extent.height,
            properties.surface_format.format,
            properties.surface_format.color_space,
            properties.present_mode,
            properties.image_count
        );

        let swapchain = self.present.create_swapchain(&SwapchainDesc {
            surface: self.surface,
            image_count: properties.image_count,
            surface_format: properties.surface_format,
            extent: properties.extent,
            present_mode: properties.present_mode,
            pre_transform: support.capabilities.current_transform,
            old_swapchain: self.swapchain,
        })?;

        if self.swapchain != vk::SwapchainKHR::null() {
            if let Some(older) = self.previous.replace(self.swapchain) {
                self.present.destroy_swapchain(older);
            }
        }
        self.swapchain = swapchain;

        // Views of a swapchain created earlier are released before the new set.
        self.destroy_images();
        let images = self.present.swapchain_images(swapchain)?;
        self.images.reserve(images.len());
        for image in images {
            let view = self.device.create_image_view(
                image,
                properties.surface_format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            self.images.push(ImageResource {
                image,
                view,
                allocation: None,
                extent: properties.extent,
                format: properties.surface_format.format,
            });
        }

        info!("Swapchain created with {} images", self.images.len());
        self.properties = Some(properties);
        self.state = SwapchainState::Created;
        Ok(())
    }

    /// Rebuilds the swapchain for new surface properties.
    ///
    /// Old presentable images are released first, the new swapchain is
    /// created with the old one as `old_swapchain`, and the old handle is
    /// destroyed once creation succeeds. On failure the manager stays
    /// [`SwapchainState::Stale`].
    ///
    /// # Safety
    ///
    /// The caller must ensure no submitted work still references the old
    /// images (normally by waiting for the device to become idle).
    pub fn recreate(
        &mut self,
        properties: SwapchainProperties,
        support: &SwapchainSupportDetails,
    ) -> RhiResult<()> {
        info!(
            "Recreating swapchain for new size: {}x{}",
            properties.extent.width, properties.extent.height
        );
        self.state = SwapchainState::Recreating;
        self.destroy_images();

        if let Err(e) = self.create(properties, support) {
            self.state = SwapchainState::Stale;
            return Err(e);
        }

        if let Some(previous) = self.previous.take() {
            self.present.destroy_swapchain(previous);
            debug!("Destroyed previous swapchain");
        }
        Ok(())
    }

    /// Acquires the next presentable image.
    ///
    /// Times out after the configured acquire timeout. A timeout or an
    /// out-of-date report marks the swapchain stale and returns
    /// [`AcquireOutcome::Stale`].
    pub fn request_image(&mut self, image_available: vk::Semaphore) -> RhiResult<AcquireOutcome> {
        if self.state != SwapchainState::Created || self.is_zero_area() {
            return Ok(AcquireOutcome::Stale);
        }

        let outcome = match self.present.acquire_next_image(
            self.swapchain,
            self.acquire_timeout,
            image_available,
        ) {
            Ok(outcome) => outcome,
            Err(e) if e.is_stale() => {
                debug!("Acquire reported a stale swapchain: {}", e);
                AcquireOutcome::Stale
            }
            Err(e) => return Err(e),
        };

        if outcome == AcquireOutcome::Stale {
            self.state = SwapchainState::Stale;
        }
        Ok(outcome)
    }

    /// Presents `image_index` once `render_finished` signals.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PresentError`] when presentation fails in a way that
    /// a rebuild can cure; the swapchain is marked stale in that case.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        render_finished: vk::Semaphore,
    ) -> RhiResult<PresentOutcome> {
        if self.state != SwapchainState::Created || self.is_zero_area() {
            return Ok(PresentOutcome::Stale);
        }

        match self
            .present
            .queue_present(queue, self.swapchain, image_index, render_finished)
        {
            Ok(PresentOutcome::Presented) => Ok(PresentOutcome::Presented),
            Ok(PresentOutcome::Stale) => {
                self.state = SwapchainState::Stale;
                Ok(PresentOutcome::Stale)
            }
            Err(e) if e.is_stale() => {
                warn!("Present failed: {}", e);
                self.state = SwapchainState::Stale;
                Err(RhiError::PresentError(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Flags the swapchain for recreation before the next frame.
    pub fn mark_stale(&mut self) {
        if self.state == SwapchainState::Created {
            self.state = SwapchainState::Stale;
        }
    }

    /// Destroys images, swapchain handle(s), then the surface.
    ///
    /// Safe to call repeatedly and from any state.
    pub fn destroy(&mut self) {
        if self.state == SwapchainState::Destroyed {
            return;
        }

        self.destroy_images();

        if let Some(previous) = self.previous.take() {
            self.present.destroy_swapchain(previous);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            self.present.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
            info!("Swapchain destroyed");
        }
        if self.surface != vk::SurfaceKHR::null() {
            self.present.destroy_surface(self.surface);
            self.surface = vk::SurfaceKHR::null();
            info!("Surface destroyed");
        }

        self.properties = None;
        self.state = SwapchainState::Destroyed;
    }

    /// Destroys the views of the presentable images.
    ///
    /// The images themselves belong to the swapchain.
    fn destroy_images(&mut self) {
        for image in &mut self.images {
            if image.view != vk::ImageView::null() {
                self.device.destroy_image_view(image.view);
            }
            image.view = vk::ImageView::null();
            image.image = vk::Image::null();
        }
        if !self.images.is_empty() {
            debug!("Destroyed {} presentable image view(s)", self.images.len());
        }
        self.images.clear();
    }

    fn is_zero_area(&self) -> bool {
        self.properties
            .is_none_or(|p| p.extent.width == 0 || p.extent.height == 0)
    }

    #[inline]
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// True when acquire or present reported the swapchain out of date.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.state == SwapchainState::Stale
    }

    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn properties(&self) -> Option<&SwapchainProperties> {
        self.properties.as_ref()
    }

    /// Returns the swapchain extent, or zero before creation.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.properties.map(|p| p.extent).unwrap_or_default()
    }

    /// Returns the swapchain image format, or `UNDEFINED` before creation.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.properties
            .map(|p| p.surface_format.format)
            .unwrap_or_default()
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns all presentable images in acquisition-index order.
    #[inline]
    pub fn images(&self) -> &[ImageResource] {
        &self.images
    }

    #[inline]
    pub fn image(&self, index: u32) -> Option<&ImageResource> {
        self.images.get(index as usize)
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Chooses the best surface format from the available formats.
///
/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR color space.
/// Falls back to the first available format if the preferred format is not available.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    if let Some(&format) = preferred {
        debug!("Selected preferred surface format: B8G8R8A8_SRGB with SRGB_NONLINEAR");
        return format;
    }

    let alternative = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    if let Some(&format) = alternative {
        warn!("Using fallback surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    let first = formats.first().copied().unwrap_or_default();
    warn!("Using first available surface format: {:?}", first.format);
    first
}

/// Chooses the best present mode from the available modes.
///
/// Prefers MAILBOX, falls back to FIFO which every implementation supports.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        debug!("Selected MAILBOX present mode (triple buffering)");
        return vk::PresentModeKHR::MAILBOX;
    }

    debug!("Selected FIFO present mode (vsync)");
    vk::PresentModeKHR::FIFO
}

/// Chooses the swapchain extent (resolution).
///
/// If the current extent is not set (width/height are u32::MAX),
/// clamps the requested size to the surface's min/max extents.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let extent = vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    };

    debug!(
        "Calculated extent: {}x{} (requested: {}x{})",
        extent.width, extent.height, width, height
    );

    extent
}

/// Determines the number of swapchain images.
///
/// One more than the minimum, capped by the maximum when there is one.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;

    // A max_image_count of 0 means no limit
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn bound_manager(width: u32, height: u32) -> (Arc<HeadlessDevice>, GpuContext, SwapchainManager) {
        let backend = Arc::new(HeadlessDevice::new(width, height));
        let context = GpuContext::from_backend(backend.clone());
        let mut manager = SwapchainManager::new(&context, Duration::from_millis(100));
        manager
            .create_surface(&SurfaceTarget::Headless { width, height })
            .expect("surface");
        (backend, context, manager)
    }

    fn create(manager: &mut SwapchainManager) {
        let support = manager.query_support().expect("support");
        let extent = support.capabilities.current_extent;
        let properties =
            SwapchainProperties::select(&support, extent.width, extent.height).expect("select");
        manager.create(properties, &support).expect("create");
    }

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_second_choice_unorm() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_fallback() {
        let formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_present_mode_prefers_mailbox() {
        let modes = vec![
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_choose_present_mode_fallback_to_fifo() {
        let modes = vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1080);
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 3000, 3000);
        assert_eq!((extent.width, extent.height), (2000, 2000));

        let extent = choose_extent(&capabilities, 50, 50);
        assert_eq!((extent.width, extent.height), (100, 100));

        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_determine_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);
    }

    #[test]
    fn test_select_rejects_inadequate_support() {
        let support = SwapchainSupportDetails {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(matches!(
            SwapchainProperties::select(&support, 10, 10),
            Err(RhiError::SwapchainError(_))
        ));
    }

    #[test]
    fn test_state_transitions() {
        let backend = Arc::new(HeadlessDevice::new(320, 240));
        let context = GpuContext::from_backend(backend.clone());
        let mut manager = SwapchainManager::new(&context, Duration::from_millis(100));
        assert_eq!(manager.state(), SwapchainState::Uninitialized);

        manager
            .create_surface(&SurfaceTarget::Headless {
                width: 320,
                height: 240,
            })
            .expect("surface");
        assert_eq!(manager.state(), SwapchainState::SurfaceBound);

        create(&mut manager);
        assert_eq!(manager.state(), SwapchainState::Created);
        assert_eq!(manager.image_count(), backend.swapchain_image_count());

        manager.mark_stale();
        assert!(manager.is_stale());

        manager.destroy();
        assert_eq!(manager.state(), SwapchainState::Destroyed);
    }

    #[test]
    fn test_second_surface_is_rejected() {
        let (_backend, _context, mut manager) = bound_manager(64, 64);
        let err = manager
            .create_surface(&SurfaceTarget::Headless {
                width: 64,
                height: 64,
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::SurfaceError(_)));
    }

    #[test]
    fn test_recreate_replaces_images_and_previous_handle() {
        let (backend, _context, mut manager) = bound_manager(640, 480);
        create(&mut manager);

        let old_handle = manager.handle();
        let old_views: Vec<_> = manager.images().iter().map(|i| i.view).collect();

        backend.resize_surface(1024, 768);
        let support = manager.query_support().expect("support");
        let properties = SwapchainProperties::select(&support, 1024, 768).expect("select");
        manager.recreate(properties, &support).expect("recreate");

        assert_ne!(manager.handle(), old_handle);
        assert!(!backend.is_swapchain_alive(old_handle));
        assert_eq!(backend.live_swapchains(), 1);
        assert_eq!(manager.image_count(), backend.swapchain_image_count());
        assert_eq!(manager.extent(), vk::Extent2D { width: 1024, height: 768 });
        for view in old_views {
            assert!(!backend.is_image_view_alive(view));
        }
        assert_eq!(backend.live_image_views(), manager.images().len());
    }

    #[test]
    fn test_second_create_releases_earlier_views() {
        let (backend, _context, mut manager) = bound_manager(64, 64);
        create(&mut manager);
        let first_views: Vec<_> = manager.images().iter().map(|i| i.view).collect();
        assert_eq!(backend.live_image_views(), first_views.len());

        create(&mut manager);
        assert_eq!(backend.live_image_views(), manager.images().len());
        assert!(first_views.iter().all(|view| !backend.is_image_view_alive(*view)));

        manager.destroy();
        assert_eq!(backend.live_image_views(), 0);
        assert_eq!(backend.live_swapchains(), 0);
    }

    #[test]
    fn test_request_image_marks_stale_when_surface_changes() {
        let (backend, context, mut manager) = bound_manager(200, 200);
        create(&mut manager);
        let semaphore = context.device().create_semaphore().expect("semaphore");

        assert!(matches!(
            manager.request_image(semaphore).expect("acquire"),
            AcquireOutcome::Acquired { .. }
        ));

        backend.resize_surface(300, 300);
        assert_eq!(
            manager.request_image(semaphore).expect("acquire"),
            AcquireOutcome::Stale
        );
        assert!(manager.is_stale());

        // Stale swapchains do not reach the backend again.
        let acquires = backend.counters().acquires;
        assert_eq!(
            manager.request_image(semaphore).expect("acquire"),
            AcquireOutcome::Stale
        );
        assert_eq!(backend.counters().acquires, acquires);
        context.device().destroy_semaphore(semaphore);
    }

    #[test]
    fn test_present_failure_is_present_error_and_stale() {
        let (backend, context, mut manager) = bound_manager(200, 200);
        create(&mut manager);
        let semaphore = context.device().create_semaphore().expect("semaphore");

        let AcquireOutcome::Acquired { index, .. } = manager.request_image(semaphore).expect("acquire")
        else {
            panic!("expected an image");
        };
        backend.fail_next_present();
        let err = manager
            .present(context.device().present_queue(), index, semaphore)
            .unwrap_err();
        assert!(matches!(err, RhiError::PresentError(_)));
        assert!(manager.is_stale());
        context.device().destroy_semaphore(semaphore);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (backend, _context, mut manager) = bound_manager(128, 128);
        create(&mut manager);

        manager.destroy();
        manager.destroy();

        assert_eq!(manager.handle(), vk::SwapchainKHR::null());
        assert_eq!(manager.surface(), vk::SurfaceKHR::null());
        assert!(manager.images().is_empty());
        assert_eq!(backend.live_swapchains(), 0);
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(backend.live_image_views(), 0);
    }
}
