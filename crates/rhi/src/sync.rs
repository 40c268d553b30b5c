//! Per-frame synchronization.
//!
//! [`SyncManager`] owns one [`FrameSlot`] per frame in flight. Each slot has:
//! - an image-available semaphore, signaled by swapchain acquisition
//! - a render-finished semaphore, signaled by the slot's submission and waited on by present
//! - an in-flight fence, signaled when the slot's submission retires
//!
//! # Usage Pattern
//!
//! ```text
//! 1. wait_and_reset(slot): wait for the slot's fence (only if a submission used it),
//!    reset the fence, clear the in-use flag, reset the slot's command pool
//! 2. Acquire swapchain image (signals image_available)
//! 3. Submit command buffer:
//!    - Wait on image_available
//!    - Signal render_finished and in_flight
//!    - mark_in_use(slot, true)
//! 4. Present (waits on render_finished)
//! ```
//!
//! The in-use flag is what keeps an aborted frame (acquire failed after the
//! fence was reset) from deadlocking the next wait on that slot.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info};

use crate::command::CommandLayer;
use crate::device::{GpuContext, GpuDevice};
use crate::error::{RhiError, RhiResult};

/// Maximum number of frames that can be processed concurrently.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Synchronization objects of one frame-in-flight index.
#[derive(Debug, Default)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    fence_in_use: bool,
}

impl FrameSlot {
    /// True while a submission that signals `in_flight` may be outstanding.
    #[inline]
    pub fn fence_in_use(&self) -> bool {
        self.fence_in_use
    }
}

/// Proof that a slot's fence has been waited on and reset.
///
/// Only [`SyncManager`] can produce one; [`CommandLayer::reset`] requires it.
#[derive(Debug)]
pub struct SlotReady {
    index: usize,
}

impl SlotReady {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-size ring of [`FrameSlot`]s.
pub struct SyncManager {
    device: Arc<dyn GpuDevice>,
    slots: Vec<FrameSlot>,
    fence_timeout: Duration,
}

impl SyncManager {
    /// Creates `frames_in_flight` slots: semaphores unsignaled, fences signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if `frames_in_flight` is outside
    /// `1..=MAX_FRAMES_IN_FLIGHT`, or the backend error if object creation
    /// fails. Objects created before the failure are destroyed.
    pub fn create_all(
        context: &GpuContext,
        frames_in_flight: usize,
        fence_timeout: Duration,
    ) -> RhiResult<Self> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frames_in_flight) {
            return Err(RhiError::InvalidArgument(format!(
                "frames in flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {frames_in_flight}"
            )));
        }

        let mut manager = Self {
            device: context.device().clone(),
            slots: Vec::with_capacity(frames_in_flight),
            fence_timeout,
        };

        for _ in 0..frames_in_flight {
            let mut slot = FrameSlot::default();
            let created = (|| {
                slot.image_available = manager.device.create_semaphore()?;
                slot.render_finished = manager.device.create_semaphore()?;
                slot.in_flight = manager.device.create_fence(true)?;
                Ok::<_, RhiError>(())
            })();
            // Push before checking so a partial slot is cleaned up by Drop.
            manager.slots.push(slot);
            created?;
        }

        info!(
            "Created synchronization objects for {} frame(s) in flight",
            frames_in_flight
        );
        Ok(manager)
    }

    fn slot_mut(&mut self, index: usize) -> RhiResult<&mut FrameSlot> {
        let count = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or_else(|| RhiError::InvalidHandle(format!("frame slot {index} of {count}")))
    }

    /// Waits for the slot's previous submission, resets its fence, then
    /// resets its command pool.
    ///
    /// The wait only happens when the in-use flag is set. A fence that does
    /// not signal within the configured timeout is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::FenceTimeout`] on timeout, or the backend error if
    /// the wait, the fence reset or the pool reset fails.
    pub fn wait_and_reset(&mut self, index: usize, commands: &mut CommandLayer) -> RhiResult<()> {
        let ready = self.wait_slot(index)?;
        commands.reset(&ready)
    }

    /// Fence half of [`SyncManager::wait_and_reset`].
    pub fn wait_slot(&mut self, index: usize) -> RhiResult<SlotReady> {
        let device = self.device.clone();
        let timeout = self.fence_timeout;
        let slot = self.slot_mut(index)?;

        if slot.fence_in_use {
            let signaled = device.wait_for_fence(slot.in_flight, timeout)?;
            if !signaled {
                error!(
                    "Fence for frame slot {} did not signal within {:?}",
                    index, timeout
                );
                return Err(RhiError::FenceTimeout { slot: index });
            }
        }

        device.reset_fence(slot.in_flight)?;
        slot.fence_in_use = false;
        Ok(SlotReady { index })
    }

    /// Records whether a submission signaling the slot's fence is outstanding.
    pub fn mark_in_use(&mut self, index: usize, in_use: bool) -> RhiResult<()> {
        self.slot_mut(index)?.fence_in_use = in_use;
        Ok(())
    }

    /// Replaces every image-available semaphore with a fresh one.
    ///
    /// A failed acquire can leave a semaphore with a pending signal
    /// operation; after a swapchain rebuild the slots start clean. The
    /// device must be idle.
    pub fn reset_semaphores_on_stale_swapchain(&mut self) -> RhiResult<()> {
        for slot in &mut self.slots {
            if slot.image_available != vk::Semaphore::null() {
                self.device.destroy_semaphore(slot.image_available);
                slot.image_available = vk::Semaphore::null();
            }
            slot.image_available = self.device.create_semaphore()?;
        }
        debug!("Recreated {} image-available semaphore(s)", self.slots.len());
        Ok(())
    }

    /// Waits for the device to idle, then destroys every semaphore and fence.
    ///
    /// Null handles are skipped; calling this twice is harmless.
    pub fn destroy_all(&mut self) {
        if self.slots.iter().all(is_empty_slot) {
            return;
        }

        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle before destroying sync objects: {}", e);
        }

        for slot in &mut self.slots {
            if slot.image_available != vk::Semaphore::null() {
                self.device.destroy_semaphore(slot.image_available);
                slot.image_available = vk::Semaphore::null();
            }
            if slot.render_finished != vk::Semaphore::null() {
                self.device.destroy_semaphore(slot.render_finished);
                slot.render_finished = vk::Semaphore::null();
            }
            if slot.in_flight != vk::Fence::null() {
                self.device.destroy_fence(slot.in_flight);
                slot.in_flight = vk::Fence::null();
            }
            slot.fence_in_use = false;
        }
        info!("Destroyed frame synchronization objects");
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    #[inline]
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }
}

fn is_empty_slot(slot: &FrameSlot) -> bool {
    slot.image_available == vk::Semaphore::null()
        && slot.render_finished == vk::Semaphore::null()
        && slot.in_flight == vk::Fence::null()
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
