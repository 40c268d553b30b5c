//! Frame-pipeline primitives on top of Vulkan (Render Hardware Interface).
//!
//! This crate provides the pieces the frame orchestrator sequences:
//! - Device seams ([`device`]) with a Vulkan backend ([`vulkan`]) and a
//!   software backend ([`headless`])
//! - Allocation tracking ([`registry`]) and the memory facade ([`memory`])
//! - Swapchain lifecycle ([`swapchain`])
//! - Per-frame synchronization ([`sync`]) and command recording ([`command`])

mod error;

pub mod command;
pub mod device;
pub mod headless;
pub mod memory;
pub mod registry;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
