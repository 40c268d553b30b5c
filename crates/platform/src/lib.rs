//! Platform layer for the cadence frame pipeline.
//!
//! This crate wraps a winit window and exposes what the frame pipeline
//! consumes from it: a [`SurfaceTarget`](cadence_rhi::device::SurfaceTarget)
//! for surface creation and the current drawable size.

mod window;

pub use window::Window;

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
