//! Command pool and command buffer management.
//!
//! [`CommandLayer`] owns one command pool and one primary command buffer per
//! frame slot. Pools are reset as a whole, never individual buffers, and a
//! reset requires a [`SlotReady`] proof from the
//! [`SyncManager`](crate::sync::SyncManager) so it can never race the GPU.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cadence_rhi::command::CommandLayer;
//! use cadence_rhi::device::GpuContext;
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::sync::SyncManager;
//!
//! # fn main() -> Result<(), cadence_rhi::RhiError> {
//! let context = GpuContext::from_backend(Arc::new(HeadlessDevice::new(320, 240)));
//! let mut sync = SyncManager::create_all(&context, 2, Duration::from_secs(1))?;
//! let mut commands = CommandLayer::new(&context, 2)?;
//!
//! sync.wait_and_reset(0, &mut commands)?;
//! let queue = context.device().graphics_queue();
//! commands.record_and_submit(0, queue, &mut sync, |_cmd| {
//!     // record rendering commands here
//!     Ok(())
//! })?;
//! assert!(sync.slot(0).unwrap().fence_in_use());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::{GpuContext, GpuDevice, SubmitDesc};
use crate::error::{RhiError, RhiResult};
use crate::sync::{SlotReady, SyncManager};

/// Pool and primary buffer of one frame slot.
#[derive(Debug, Default, Clone, Copy)]
struct FrameCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

/// Per-slot command recording and submission.
///
/// # Thread Safety
///
/// Command pools are externally synchronized; the layer is driven from the
/// render thread only.
pub struct CommandLayer {
    device: Arc<dyn GpuDevice>,
    frames: Vec<FrameCommands>,
}

impl CommandLayer {
    /// Creates one pool and one primary command buffer per slot.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or buffer allocation fails. Pools
    /// created before the failure are destroyed.
    pub fn new(context: &GpuContext, frame_count: usize) -> RhiResult<Self> {
        let mut layer = Self {
            device: context.device().clone(),
            frames: Vec::with_capacity(frame_count),
        };

        for _ in 0..frame_count {
            let pool = layer.device.create_command_pool()?;
            layer.frames.push(FrameCommands {
                pool,
                buffer: vk::CommandBuffer::null(),
            });
            let buffer = layer.device.allocate_command_buffer(pool)?;
            if let Some(frame) = layer.frames.last_mut() {
                frame.buffer = buffer;
            }
        }

        info!("Command pools created for {} frame slot(s)", frame_count);
        Ok(layer)
    }

    fn frame(&self, index: usize) -> RhiResult<FrameCommands> {
        self.frames
            .get(index)
            .copied()
            .filter(|f| f.pool != vk::CommandPool::null())
            .ok_or_else(|| RhiError::InvalidHandle(format!("command pool for slot {index}")))
    }

    /// Resets the slot's command pool, returning its buffer to the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been destroyed or the reset fails.
    pub fn reset(&mut self, ready: &SlotReady) -> RhiResult<()> {
        let frame = self.frame(ready.index())?;
        self.device.reset_command_pool(frame.pool)
    }

    /// Opens the slot's buffer for recording.
    ///
    /// Buffers are begun with `SIMULTANEOUS_USE`.
    pub fn begin(&mut self, index: usize) -> RhiResult<vk::CommandBuffer> {
        let frame = self.frame(index)?;
        self.device
            .begin_command_buffer(frame.buffer, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)?;
        Ok(frame.buffer)
    }

    /// Closes the slot's buffer.
    pub fn end(&mut self, index: usize) -> RhiResult<()> {
        let frame = self.frame(index)?;
        self.device.end_command_buffer(frame.buffer)
    }

    /// Records the slot's buffer with `record` and submits it.
    ///
    /// The submission waits on the slot's image-available semaphore at the
    /// color output stage and signals its render-finished semaphore and
    /// in-flight fence. The slot is marked in use once the submit succeeds.
    ///
    /// # Errors
    ///
    /// Returns the recording error if `begin`, `record` or `end` fail, and
    /// [`RhiError::DeviceLost`] if the queue rejects the submission.
    pub fn record_and_submit<F>(
        &mut self,
        index: usize,
        queue: vk::Queue,
        sync: &mut SyncManager,
        record: F,
    ) -> RhiResult<()>
    where
        F: FnOnce(vk::CommandBuffer) -> RhiResult<()>,
    {
        let slot = sync
            .slot(index)
            .ok_or_else(|| RhiError::InvalidHandle(format!("frame slot {index}")))?;
        let (image_available, render_finished, in_flight) =
            (slot.image_available, slot.render_finished, slot.in_flight);

        let command_buffer = self.begin(index)?;
        record(command_buffer)?;
        self.end(index)?;

        let submit = SubmitDesc {
            command_buffer,
            wait_semaphore: image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: render_finished,
            fence: in_flight,
        };

        self.device
            .submit(queue, &submit)
            .map_err(|e| RhiError::DeviceLost(format!("submission for slot {index} failed: {e}")))?;
        sync.mark_in_use(index, true)?;

        debug!("Submitted frame slot {}", index);
        Ok(())
    }

    /// Returns the slot's primary command buffer.
    pub fn command_buffer(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.frame(index).ok().map(|f| f.buffer)
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Destroys every pool (freeing its buffers). Safe to call twice.
    pub fn destroy_all(&mut self) {
        let mut destroyed = 0;
        for frame in &mut self.frames {
            if frame.pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(frame.pool);
                destroyed += 1;
            }
            *frame = FrameCommands::default();
        }
        if destroyed > 0 {
            info!("Destroyed {} command pool(s)", destroyed);
        }
    }
}

impl Drop for CommandLayer {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::headless::HeadlessDevice;

    fn setup(frames: usize) -> (Arc<HeadlessDevice>, GpuContext, SyncManager, CommandLayer) {
        let backend = Arc::new(HeadlessDevice::new(64, 64));
        let context = GpuContext::from_backend(backend.clone());
        let sync = SyncManager::create_all(&context, frames, Duration::from_millis(50))
            .expect("sync objects");
        let commands = CommandLayer::new(&context, frames).expect("command layer");
        (backend, context, sync, commands)
    }

    #[test]
    fn test_one_pool_per_slot() {
        let (backend, _context, _sync, commands) = setup(3);
        assert_eq!(commands.frame_count(), 3);
        assert_eq!(backend.live_command_pools(), 3);
        for i in 0..3 {
            assert!(commands.command_buffer(i).is_some());
        }
        assert!(commands.command_buffer(3).is_none());
    }

    #[test]
    fn test_record_and_submit_marks_slot_in_use() {
        let (backend, context, mut sync, mut commands) = setup(2);
        sync.wait_and_reset(0, &mut commands).expect("reset");

        let mut recorded = None;
        commands
            .record_and_submit(0, context.device().graphics_queue(), &mut sync, |cmd| {
                recorded = Some(cmd);
                Ok(())
            })
            .expect("submit");

        assert_eq!(recorded, commands.command_buffer(0));
        assert!(sync.slot(0).expect("slot").fence_in_use());
        assert!(!sync.slot(1).expect("slot").fence_in_use());
        assert_eq!(backend.counters().submissions, 1);
    }

    #[test]
    fn test_recording_error_does_not_mark_in_use() {
        let (backend, context, mut sync, mut commands) = setup(2);
        sync.wait_and_reset(1, &mut commands).expect("reset");

        let err = commands
            .record_and_submit(1, context.device().graphics_queue(), &mut sync, |_| {
                Err(RhiError::InvalidHandle("recording failed".into()))
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidHandle(_)));
        assert!(!sync.slot(1).expect("slot").fence_in_use());
        assert_eq!(backend.counters().submissions, 0);

        // The next wait on the slot must not block on the unsubmitted fence.
        sync.wait_and_reset(1, &mut commands).expect("reset again");
    }

    #[test]
    fn test_submit_failure_is_device_lost() {
        let (backend, context, mut sync, mut commands) = setup(2);
        sync.wait_and_reset(0, &mut commands).expect("reset");
        backend.lose_device();

        let err = commands
            .record_and_submit(0, context.device().graphics_queue(), &mut sync, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, RhiError::DeviceLost(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_destroy_all_twice() {
        let (backend, _context, _sync, mut commands) = setup(2);
        commands.destroy_all();
        commands.destroy_all();
        assert_eq!(backend.live_command_pools(), 0);
        assert!(commands.command_buffer(0).is_none());
    }
}
