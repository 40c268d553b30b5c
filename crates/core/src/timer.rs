//! Frame timing for callers wrapping the orchestrator tick.

use std::time::{Duration, Instant};

/// Measures per-frame deltas and a rolling frame rate.
///
/// The pipeline does not emit timing itself; the application wraps each
/// tick with [`FrameTimer::begin_frame`] and reads the numbers back.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_frame: Instant,
    window_start: Instant,
    frames_in_window: u32,
    last_fps: f32,
}

impl FrameTimer {
    /// Length of the window used to compute [`FrameTimer::fps`].
    pub const FPS_WINDOW: Duration = Duration::from_secs(1);

    /// Create a timer starting now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            window_start: now,
            frames_in_window: 0,
            last_fps: 0.0,
        }
    }

    /// Marks the start of a frame and returns the time since the previous one.
    pub fn begin_frame(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_frame;
        self.last_frame = now;

        self.frames_in_window += 1;
        let window = now - self.window_start;
        if window >= Self::FPS_WINDOW {
            self.last_fps = self.frames_in_window as f32 / window.as_secs_f32();
            self.frames_in_window = 0;
            self.window_start = now;
        }

        delta
    }

    /// Frames per second measured over the last completed window.
    pub fn fps(&self) -> f32 {
        self.last_fps
    }

    /// Total time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_frame_is_monotonic() {
        let mut timer = FrameTimer::new();
        let first = timer.begin_frame();
        std::thread::sleep(Duration::from_millis(2));
        let second = timer.begin_frame();
        assert!(second >= Duration::from_millis(2));
        assert!(first < Duration::from_secs(1));
    }

    #[test]
    fn test_fps_starts_at_zero() {
        let timer = FrameTimer::default();
        assert_eq!(timer.fps(), 0.0);
    }
}
