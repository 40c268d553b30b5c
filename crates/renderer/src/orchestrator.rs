//! Per-tick frame sequencing.
//!
//! The [`FrameOrchestrator`] owns the swapchain, the frame slots, the command
//! layer, the memory facade and the image targets, and drives them in a fixed
//! order every tick:
//!
//! ```text
//! 1. Drain window events (resize / close)
//! 2. Poll the surface extent; zero area skips the tick
//! 3. Rebuild the swapchain if it was flagged stale or the extent changed
//! 4. Wait for the slot's fence, reset it, reset the slot's command pool
//! 5. Acquire an image (one rebuild-and-retry on staleness)
//! 6. Record and submit the slot's command buffer
//! 7. Present; staleness flags a rebuild for the next tick
//! 8. Advance the slot
//! ```
//!
//! The fence wait comes before the acquire: the slot's semaphores and
//! command pool are only reused once the GPU is done with them, and an
//! acquire never signals a semaphore that an unfinished submission still
//! waits on.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_core::Config;
//! use cadence_renderer::{FrameOrchestrator, NoopRenderer, TickOutcome};
//! use cadence_rhi::device::{GpuContext, SurfaceTarget};
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::registry::AllocationRegistry;
//!
//! # fn main() -> Result<(), cadence_rhi::RhiError> {
//! let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(600, 600)));
//! let target = SurfaceTarget::Headless { width: 600, height: 600 };
//! let registry = Arc::new(AllocationRegistry::new());
//!
//! let mut orchestrator =
//!     FrameOrchestrator::new(&context, &target, &Config::default(), registry.clone())?;
//! let outcome = orchestrator.tick(&mut NoopRenderer)?;
//! assert!(matches!(outcome, TickOutcome::Presented { slot: 0, .. }));
//!
//! orchestrator.shutdown();
//! assert_eq!(registry.live_count(), 0);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use cadence_core::Config;
use cadence_rhi::command::CommandLayer;
use cadence_rhi::device::{AcquireOutcome, GpuContext, GpuDevice, PresentOutcome, SurfaceTarget};
use cadence_rhi::memory::{ImageResource, MemoryAllocator};
use cadence_rhi::registry::{AllocationRegistry, ObserverSet, TracingObserver};
use cadence_rhi::swapchain::{SwapchainManager, SwapchainProperties};
use cadence_rhi::sync::SyncManager;
use cadence_rhi::{RhiError, RhiResult};

use crate::depth_target::{DepthTarget, depth_vk_format};
use crate::dispatch::{EventQueue, EventSender};
use crate::offscreen::{OffscreenTargets, TargetKind};

/// Everything a renderer callback needs to record one frame.
pub struct FrameContext<'a> {
    /// Device the command buffer belongs to.
    pub device: &'a dyn GpuDevice,
    /// Open primary command buffer of the current slot.
    pub command_buffer: vk::CommandBuffer,
    /// Frame slot being recorded.
    pub slot: usize,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The acquired presentable image.
    pub image: &'a ImageResource,
    /// Depth target, when enabled.
    pub depth: Option<&'a ImageResource>,
    /// Offscreen color target paired with `image_index`, when enabled.
    pub offscreen: Option<&'a ImageResource>,
    /// Host-readable viewport target paired with `image_index`, when enabled.
    pub viewport: Option<&'a ImageResource>,
    pub extent: vk::Extent2D,
}

/// Scene and overlay recording callbacks invoked inside an open frame.
pub trait FrameRenderer {
    /// Records scene drawing into `frame.command_buffer`.
    fn record(&mut self, frame: &FrameContext<'_>) -> RhiResult<()>;

    /// Records UI overlay drawing after the scene.
    fn record_overlay(&mut self, _frame: &FrameContext<'_>) -> RhiResult<()> {
        Ok(())
    }
}

/// Renderer that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRenderer;

impl FrameRenderer for NoopRenderer {
    fn record(&mut self, _frame: &FrameContext<'_>) -> RhiResult<()> {
        Ok(())
    }
}

/// Why a tick produced no frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The surface has zero area.
    Minimized,
    /// The swapchain stayed out of date after a rebuild.
    SwapchainStale,
    /// The frame was submitted but presentation failed; rebuild pending.
    PresentFailed,
    /// A fatal error stopped the pipeline, or it was shut down.
    Halted,
}

/// Result of one [`FrameOrchestrator::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Presented { slot: usize, image_index: u32 },
    Skipped(SkipReason),
    /// A close request arrived; the caller should shut down.
    CloseRequested,
}

/// Counters for telemetry callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub ticks: u64,
    pub presented: u64,
    pub skipped: u64,
    /// Swapchain rebuilds.
    pub recreated: u64,
    pub last_image_index: Option<u32>,
}

/// Drives acquire, fence gating, submission and present for every frame.
///
/// # Thread Safety
///
/// Owned by the render thread. Other threads talk to it only through the
/// [`EventSender`] returned by [`FrameOrchestrator::event_sender`].
pub struct FrameOrchestrator {
    context: GpuContext,
    registry: Arc<AllocationRegistry>,
    memory: MemoryAllocator,
    swapchain: SwapchainManager,
    sync: SyncManager,
    commands: CommandLayer,
    depth: DepthTarget,
    offscreen: OffscreenTargets,
    viewport: OffscreenTargets,
    events: EventQueue,
    sender: EventSender,
    frame_index: usize,
    window_extent: vk::Extent2D,
    /// Extent the live swapchain was built for. Differs from the swapchain
    /// extent when the surface clamps the request.
    requested_extent: vk::Extent2D,
    needs_recreate: bool,
    close_requested: bool,
    halted: bool,
    shut_down: bool,
    stats: FrameStats,
}

impl FrameOrchestrator {
    /// Binds the surface and builds every per-frame resource.
    ///
    /// # Arguments
    ///
    /// * `context` - Device seams to render with
    /// * `target` - Surface to present to
    /// * `config` - Frame count, timeouts, depth format and initial window size
    /// * `registry` - Receives every allocate/free of the memory facade
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for a configuration that fails
    /// [`Config::validate`], or an error if surface binding, swapchain
    /// creation, slot creation or a target allocation fails. Whatever was
    /// built before the failure is released.
    pub fn new(
        context: &GpuContext,
        target: &SurfaceTarget,
        config: &Config,
        registry: Arc<AllocationRegistry>,
    ) -> RhiResult<Self> {
        config
            .validate()
            .map_err(|e| RhiError::InvalidArgument(e.to_string()))?;
        let renderer = &config.renderer;
        let window_extent = vk::Extent2D {
            width: config.window.width,
            height: config.window.height,
        };

        let observers = ObserverSet::new()
            .with(registry.clone())
            .with(Arc::new(TracingObserver));
        let memory = MemoryAllocator::new(context, Arc::new(observers));

        let mut swapchain = SwapchainManager::new(context, renderer.acquire_timeout());
        swapchain.create_surface(target)?;
        let support = swapchain.query_support()?;
        let properties =
            SwapchainProperties::select(&support, window_extent.width, window_extent.height)?;
        swapchain.create(properties, &support)?;
        let requested_extent = swapchain.surface_extent()?.unwrap_or(window_extent);

        let sync = SyncManager::create_all(context, renderer.frames_in_flight, renderer.fence_timeout())?;
        let commands = CommandLayer::new(context, renderer.frames_in_flight)?;

        let mut depth = DepthTarget::new(depth_vk_format(renderer.depth_format));
        depth.resize(&memory, swapchain.extent())?;

        let mut offscreen =
            OffscreenTargets::new(TargetKind::Offscreen, renderer.offscreen_targets);
        let mut viewport =
            OffscreenTargets::new(TargetKind::Viewport, renderer.viewport_targets);
        if let Err(e) = resize_targets(&memory, &swapchain, &mut offscreen, &mut viewport) {
            offscreen.destroy(&memory);
            viewport.destroy(&memory);
            depth.destroy(&memory);
            return Err(e);
        }

        let (sender, events) = EventQueue::new();

        info!(
            "Frame orchestrator ready: {} frame(s) in flight, {}x{}",
            renderer.frames_in_flight,
            swapchain.extent().width,
            swapchain.extent().height
        );

        Ok(Self {
            context: context.clone(),
            registry,
            memory,
            swapchain,
            sync,
            commands,
            depth,
            offscreen,
            viewport,
            events,
            sender,
            frame_index: 0,
            window_extent,
            requested_extent,
            needs_recreate: false,
            close_requested: false,
            halted: false,
            shut_down: false,
            stats: FrameStats::default(),
        })
    }

    /// Runs one frame.
    ///
    /// Dropped frames (minimized, stale swapchain) are reported as
    /// [`TickOutcome::Skipped`], not as errors.
    ///
    /// # Errors
    ///
    /// Fatal errors ([`RhiError::is_fatal`]) halt the orchestrator; later
    /// ticks return [`SkipReason::Halted`] until [`FrameOrchestrator::shutdown`].
    /// Other errors leave it usable.
    pub fn tick(&mut self, renderer: &mut dyn FrameRenderer) -> RhiResult<TickOutcome> {
        if self.halted || self.shut_down {
            return Ok(TickOutcome::Skipped(SkipReason::Halted));
        }

        let drained = self.events.drain();
        if let Some((width, height)) = drained.resized {
            debug!("Window resized to {}x{}", width, height);
            self.window_extent = vk::Extent2D { width, height };
        }
        if drained.close_requested {
            info!("Close requested");
            self.close_requested = true;
        }
        if self.close_requested {
            return Ok(TickOutcome::CloseRequested);
        }

        self.stats.ticks += 1;
        match self.run_frame(renderer) {
            Ok(TickOutcome::Skipped(reason)) => {
                self.stats.skipped += 1;
                Ok(TickOutcome::Skipped(reason))
            }
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => {
                error!("Fatal frame error, halting: {}", e);
                self.halted = true;
                Err(e)
            }
            Err(e) if e.is_stale() => {
                debug!("Frame dropped on stale surface: {}", e);
                self.needs_recreate = true;
                self.stats.skipped += 1;
                Ok(TickOutcome::Skipped(SkipReason::SwapchainStale))
            }
            Err(e) => Err(e),
        }
    }

    fn run_frame(&mut self, renderer: &mut dyn FrameRenderer) -> RhiResult<TickOutcome> {
        let extent = self.poll_extent()?;
        if is_zero(extent) {
            return Ok(TickOutcome::Skipped(SkipReason::Minimized));
        }
        if self.needs_recreate || self.swapchain.is_stale() || extent != self.requested_extent {
            self.recreate(extent)?;
        }

        let slot = self.frame_index;
        self.sync.wait_and_reset(slot, &mut self.commands)?;

        let image_index = match self.acquire(slot)? {
            Some(index) => index,
            None => {
                let extent = self.poll_extent()?;
                if is_zero(extent) {
                    return Ok(TickOutcome::Skipped(SkipReason::Minimized));
                }
                self.recreate(extent)?;
                match self.acquire(slot)? {
                    Some(index) => index,
                    None => {
                        self.needs_recreate = true;
                        return Ok(TickOutcome::Skipped(SkipReason::SwapchainStale));
                    }
                }
            }
        };

        let queue = self.context.device().graphics_queue();
        let device = self.context.device().clone();
        let image = self
            .swapchain
            .image(image_index)
            .ok_or_else(|| RhiError::InvalidHandle(format!("swapchain image {image_index}")))?;
        let depth = self.depth.image();
        let offscreen = self.offscreen.image(image_index);
        let viewport = self.viewport.image(image_index);

        let recorded = self
            .commands
            .record_and_submit(slot, queue, &mut self.sync, |command_buffer| {
                let frame = FrameContext {
                    device: device.as_ref(),
                    command_buffer,
                    slot,
                    image_index,
                    image,
                    depth,
                    offscreen,
                    viewport,
                    extent: image.extent,
                };
                renderer.record(&frame)?;
                renderer.record_overlay(&frame)
            });
        if let Err(e) = recorded {
            // The acquired image-available semaphore stays signaled; a
            // rebuild replaces it.
            self.needs_recreate = true;
            return Err(e);
        }
        self.frame_index = (slot + 1) % self.sync.frame_count();

        let render_finished = self.slot_semaphores(slot)?.1;
        let present_queue = self.context.device().present_queue();
        match self
            .swapchain
            .present(present_queue, image_index, render_finished)
        {
            Ok(outcome) => {
                if outcome == PresentOutcome::Stale {
                    debug!("Present reported a stale swapchain");
                    self.needs_recreate = true;
                }
                self.stats.presented += 1;
                self.stats.last_image_index = Some(image_index);
                Ok(TickOutcome::Presented { slot, image_index })
            }
            Err(e) if e.is_stale() => {
                warn!("Present failed, rebuilding next tick: {}", e);
                self.needs_recreate = true;
                Ok(TickOutcome::Skipped(SkipReason::PresentFailed))
            }
            Err(e) => Err(e),
        }
    }

    /// Acquires an image for `slot`, or `None` when the swapchain is stale.
    fn acquire(&mut self, slot: usize) -> RhiResult<Option<u32>> {
        let image_available = self.slot_semaphores(slot)?.0;
        match self.swapchain.request_image(image_available)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                Ok(Some(index))
            }
            AcquireOutcome::Stale => Ok(None),
        }
    }

    fn slot_semaphores(&self, slot: usize) -> RhiResult<(vk::Semaphore, vk::Semaphore)> {
        self.sync
            .slot(slot)
            .map(|s| (s.image_available, s.render_finished))
            .ok_or_else(|| RhiError::InvalidHandle(format!("frame slot {slot}")))
    }

    /// Surface extent, falling back to the last window size when the
    /// surface leaves it to the swapchain.
    fn poll_extent(&self) -> RhiResult<vk::Extent2D> {
        Ok(self.swapchain.surface_extent()?.unwrap_or(self.window_extent))
    }

    /// Rebuilds the swapchain, image-available semaphores and image targets.
    ///
    /// The rebuild flag stays raised until every step succeeds, so a failed
    /// rebuild is retried on the next tick.
    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.needs_recreate = true;
        self.context.device().wait_idle()?;

        let support = self.swapchain.query_support()?;
        let properties = SwapchainProperties::select(&support, extent.width, extent.height)?;
        self.swapchain.recreate(properties, &support)?;
        self.sync.reset_semaphores_on_stale_swapchain()?;
        self.depth.resize(&self.memory, self.swapchain.extent())?;
        resize_targets(
            &self.memory,
            &self.swapchain,
            &mut self.offscreen,
            &mut self.viewport,
        )?;

        self.requested_extent = extent;
        self.needs_recreate = false;
        self.stats.recreated += 1;
        Ok(())
    }

    /// Ticks until a close request, a fatal error or `max_ticks`.
    ///
    /// Non-fatal errors are logged and the loop continues. The orchestrator
    /// is shut down before a fatal error is returned.
    pub fn run(
        &mut self,
        renderer: &mut dyn FrameRenderer,
        max_ticks: Option<u64>,
    ) -> RhiResult<FrameStats> {
        let mut ticks = 0u64;
        while max_ticks.is_none_or(|max| ticks < max) {
            ticks += 1;
            match self.tick(renderer) {
                Ok(TickOutcome::CloseRequested) => break,
                Ok(TickOutcome::Skipped(SkipReason::Halted)) => break,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.shutdown();
                    return Err(e);
                }
                Err(e) => warn!("Frame failed: {}", e),
            }
        }
        Ok(self.stats)
    }

    /// Releases everything in dependency order.
    ///
    /// Waits for the device, then destroys the command layer, the frame
    /// slots, the swapchain and finally allocator-owned resources. Each step
    /// tolerates partially built state; calling this twice is harmless.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("Shutting down frame pipeline");

        if let Err(e) = self.context.device().wait_idle() {
            error!("Failed to wait for device idle during shutdown: {}", e);
        }
        self.commands.destroy_all();
        self.sync.destroy_all();
        self.swapchain.destroy();
        self.depth.destroy(&self.memory);
        self.offscreen.destroy(&self.memory);
        self.viewport.destroy(&self.memory);

        if self.memory.outstanding() > 0 {
            warn!(
                "{} allocation(s) outlive the frame pipeline",
                self.memory.outstanding()
            );
        }
        if self.registry.live_count() > 0 {
            self.registry.report_leaks();
        }

        self.shut_down = true;
        info!(
            "Frame pipeline shut down after {} presented frame(s)",
            self.stats.presented
        );
    }

    /// Returns a handle for feeding window events from any thread.
    pub fn event_sender(&self) -> EventSender {
        self.sender.clone()
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Slot the next tick will use.
    #[inline]
    pub fn current_slot(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    #[inline]
    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    #[inline]
    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    #[inline]
    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    #[inline]
    pub fn memory(&self) -> &MemoryAllocator {
        &self.memory
    }

    #[inline]
    pub fn depth(&self) -> Option<&ImageResource> {
        self.depth.image()
    }

    #[inline]
    pub fn offscreen_targets(&self) -> &OffscreenTargets {
        &self.offscreen
    }

    #[inline]
    pub fn viewport_targets(&self) -> &OffscreenTargets {
        &self.viewport
    }

    #[inline]
    pub fn context(&self) -> &GpuContext {
        &self.context
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Rebuilds both color target sets for the current swapchain images.
fn resize_targets(
    memory: &MemoryAllocator,
    swapchain: &SwapchainManager,
    offscreen: &mut OffscreenTargets,
    viewport: &mut OffscreenTargets,
) -> RhiResult<()> {
    let format = swapchain.format();
    let extent = swapchain.extent();
    let count = swapchain.image_count() as usize;
    offscreen.resize(memory, format, extent, count)?;
    viewport.resize(memory, format, extent, count)
}

#[cfg(test)]
mod tests {
    use cadence_rhi::headless::HeadlessDevice;

    use super::*;

    fn orchestrator(width: u32, height: u32) -> (Arc<HeadlessDevice>, FrameOrchestrator) {
        let backend = Arc::new(HeadlessDevice::new(width, height));
        let context = GpuContext::from_backend(backend.clone());
        let target = SurfaceTarget::Headless { width, height };
        let orchestrator = FrameOrchestrator::new(
            &context,
            &target,
            &Config::default(),
            Arc::new(AllocationRegistry::new()),
        )
        .expect("orchestrator");
        (backend, orchestrator)
    }

    struct FailingRenderer;

    impl FrameRenderer for FailingRenderer {
        fn record(&mut self, _frame: &FrameContext<'_>) -> RhiResult<()> {
            Err(RhiError::InvalidHandle("scene buffer".to_string()))
        }
    }

    #[test]
    fn test_close_request_is_observed_between_frames() {
        let (backend, mut orchestrator) = orchestrator(64, 64);
        orchestrator
            .tick(&mut NoopRenderer)
            .expect("first frame");
        assert!(orchestrator.event_sender().request_close());

        assert_eq!(
            orchestrator.tick(&mut NoopRenderer).expect("tick"),
            TickOutcome::CloseRequested
        );
        assert_eq!(backend.counters().presents, 1);
    }

    #[test]
    fn test_overlay_follows_scene() {
        #[derive(Default)]
        struct Recorder(Vec<&'static str>);

        impl FrameRenderer for Recorder {
            fn record(&mut self, frame: &FrameContext<'_>) -> RhiResult<()> {
                assert!(frame.depth.is_some());
                assert_eq!(frame.extent, vk::Extent2D { width: 64, height: 64 });
                self.0.push("scene");
                Ok(())
            }

            fn record_overlay(&mut self, _frame: &FrameContext<'_>) -> RhiResult<()> {
                self.0.push("overlay");
                Ok(())
            }
        }

        let (_backend, mut orchestrator) = orchestrator(64, 64);
        let mut recorder = Recorder::default();
        orchestrator.tick(&mut recorder).expect("tick");
        assert_eq!(recorder.0, ["scene", "overlay"]);
    }

    #[test]
    fn test_recording_failure_flags_rebuild_and_recovers() {
        let (backend, mut orchestrator) = orchestrator(64, 64);
        let err = orchestrator.tick(&mut FailingRenderer).unwrap_err();
        assert!(!err.is_fatal());
        assert!(orchestrator.needs_recreate());
        assert_eq!(backend.counters().submissions, 0);

        let outcome = orchestrator.tick(&mut NoopRenderer).expect("tick");
        assert!(matches!(outcome, TickOutcome::Presented { slot: 0, .. }));
        assert_eq!(orchestrator.stats().recreated, 1);
    }

    #[test]
    fn test_present_failure_skips_and_rebuilds() {
        let (backend, mut orchestrator) = orchestrator(64, 64);
        backend.fail_next_present();

        assert_eq!(
            orchestrator.tick(&mut NoopRenderer).expect("tick"),
            TickOutcome::Skipped(SkipReason::PresentFailed)
        );
        assert!(orchestrator.needs_recreate());

        let outcome = orchestrator.tick(&mut NoopRenderer).expect("tick");
        assert!(matches!(outcome, TickOutcome::Presented { slot: 1, .. }));
        assert_eq!(orchestrator.stats().recreated, 1);
        assert_eq!(backend.counters().fence_order_violations, 0);
    }

    #[test]
    fn test_run_stops_at_tick_limit() {
        let (_backend, mut orchestrator) = orchestrator(32, 32);
        let stats = orchestrator.run(&mut NoopRenderer, Some(5)).expect("run");
        assert_eq!(stats.ticks, 5);
        assert_eq!(stats.presented, 5);
        assert!(stats.last_image_index.is_some());
    }
}
