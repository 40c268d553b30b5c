//! Cadence - frame pipeline demo binary
//!
//! Drives the frame orchestrator either from a winit window on the Vulkan
//! backend, or headlessly on the software backend for a fixed number of
//! frames.

mod clear;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use cadence_core::{Config, FrameTimer};
use cadence_platform::Window;
use cadence_renderer::{EventSender, FrameOrchestrator, SkipReason, TickOutcome};
use cadence_rhi::device::{GpuContext, SurfaceTarget};
use cadence_rhi::headless::HeadlessDevice;
use cadence_rhi::registry::AllocationRegistry;
use cadence_rhi::vulkan::VulkanBackend;

use crate::clear::ClearRenderer;

/// Frames rendered by `--headless` when `--frames` is not given.
const DEFAULT_HEADLESS_FRAMES: u64 = 120;

#[derive(Parser, Debug)]
#[command(name = "cadence", version, about = "Frame pipeline demo")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run on the software backend without a window
    #[arg(long)]
    headless: bool,

    /// Stop after this many ticks
    #[arg(short, long)]
    frames: Option<u64>,

    /// Override the window width
    #[arg(long)]
    width: Option<u32>,

    /// Override the window height
    #[arg(long)]
    height: Option<u32>,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        config.validate()?;
        Ok(config)
    }
}

fn run_headless(config: &Config, frames: u64) -> Result<()> {
    let (width, height) = (config.window.width, config.window.height);
    let backend = Arc::new(HeadlessDevice::new(width, height));
    let context = GpuContext::from_backend(backend.clone());
    let registry = Arc::new(AllocationRegistry::new());
    let target = SurfaceTarget::Headless { width, height };

    let mut orchestrator = FrameOrchestrator::new(&context, &target, config, registry.clone())?;
    let mut renderer = ClearRenderer::new();
    let timer = FrameTimer::new();

    let stats = orchestrator.run(&mut renderer, Some(frames))?;
    orchestrator.shutdown();

    let elapsed = timer.elapsed();
    info!(
        "Headless run finished: {} presented, {} skipped, {} recreated in {:.2?}",
        stats.presented, stats.skipped, stats.recreated, elapsed
    );
    let counters = backend.counters();
    info!(
        "Backend: {} submissions, peak {} in flight",
        counters.submissions, counters.max_outstanding
    );
    if registry.live_count() != 0 {
        warn!("{} allocations outlived shutdown", registry.live_count());
    }
    Ok(())
}

struct App {
    config: Config,
    max_frames: Option<u64>,
    renderer: ClearRenderer,
    timer: FrameTimer,
    events: Option<EventSender>,
    // Dropped before the window so the surface goes first.
    orchestrator: Option<FrameOrchestrator>,
    window: Option<Window>,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, max_frames: Option<u64>) -> Self {
        Self {
            config,
            max_frames,
            renderer: ClearRenderer::new(),
            timer: FrameTimer::new(),
            events: None,
            orchestrator: None,
            window: None,
            failure: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config.window)?;
        let backend = VulkanBackend::new(
            self.config.renderer.validation,
            Some(window.raw_display_handle()?),
        )?;
        let context = GpuContext::from_backend(backend);
        let registry = Arc::new(AllocationRegistry::new());
        let target = window.surface_target()?;

        let orchestrator = FrameOrchestrator::new(&context, &target, &self.config, registry)?;
        self.events = Some(orchestrator.event_sender());
        self.orchestrator = Some(orchestrator);
        self.window = Some(window);
        Ok(())
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let Some(orchestrator) = self.orchestrator.as_mut() else {
            return;
        };

        self.timer.begin_frame();
        self.renderer.set_elapsed(self.timer.elapsed());

        let stop = match orchestrator.tick(&mut self.renderer) {
            Ok(TickOutcome::CloseRequested) => {
                info!("Close requested, shutting down");
                true
            }
            Ok(TickOutcome::Skipped(SkipReason::Halted)) => true,
            Ok(_) => self
                .max_frames
                .is_some_and(|max| orchestrator.stats().ticks >= max),
            Err(e) if e.is_fatal() => {
                error!("Frame pipeline halted: {}", e);
                self.failure = Some(e.into());
                true
            }
            Err(e) => {
                warn!("Frame failed: {}", e);
                false
            }
        };

        if stop {
            self.shutdown(event_loop);
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut orchestrator) = self.orchestrator.take() {
            orchestrator.shutdown();
            let stats = orchestrator.stats();
            info!(
                "Rendered {} frames ({} skipped, {} recreated), last {:.1} fps",
                stats.presented,
                stats.skipped,
                stats.recreated,
                self.timer.fps()
            );
        }
        self.events = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.orchestrator.is_some() || self.failure.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(()) => info!("Initialization complete, entering main loop"),
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                if let Some(events) = &self.events {
                    events.request_close();
                }
                // Tick once so the request is observed between frames.
                self.render(event_loop);
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if let Some(events) = &self.events {
                    events.resized(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.render(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    cadence_core::init_logging();
    let args = Args::parse();
    let config = args.load_config()?;
    info!(
        "Starting cadence ({} frames in flight)",
        config.renderer.frames_in_flight
    );

    if args.headless {
        return run_headless(&config, args.frames.unwrap_or(DEFAULT_HEADLESS_FRAMES));
    }

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, args.frames);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_overrides_apply() {
        let args = Args::parse_from(["cadence", "--width", "640", "--height", "480"]);
        let config = args.load_config().expect("config");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 480);
    }

    #[test]
    fn test_zero_width_override_is_rejected() {
        let args = Args::parse_from(["cadence", "--width", "0"]);
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_headless_run_completes() {
        let mut config = Config::default();
        config.window.width = 64;
        config.window.height = 64;
        run_headless(&config, 5).expect("headless run");
    }
}
