//! Frame pipeline orchestration.
//!
//! This crate sequences the primitives of `cadence-rhi` into frames:
//! - [`FrameOrchestrator`] - per-tick acquire, fence gating, submission and present
//! - [`EventSender`] - window events fed to the render thread
//! - [`DepthTarget`] - depth attachment rebuilt with the swapchain
//! - [`OffscreenTargets`] - optional per-image color targets

pub mod depth_target;
pub mod dispatch;
pub mod offscreen;
pub mod orchestrator;

pub use depth_target::DepthTarget;
pub use dispatch::{EventSender, FrameEvent};
pub use offscreen::{OffscreenTargets, TargetKind};
pub use orchestrator::{
    FrameContext, FrameOrchestrator, FrameRenderer, FrameStats, NoopRenderer, SkipReason,
    TickOutcome,
};
