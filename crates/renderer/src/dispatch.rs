//! Window events handed to the render thread.
//!
//! The window side holds an [`EventSender`]; the orchestrator drains the
//! queue once at the start of every tick, so events never interrupt a frame.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::debug;

/// An event from the window collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// The window's drawable size changed; zero means minimized.
    Resized { width: u32, height: u32 },
    /// The user asked to close the window.
    CloseRequested,
}

/// Producer half of the dispatch queue.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: Sender<FrameEvent>,
}

impl EventSender {
    /// Queues a resize. Returns false once the render side is gone.
    pub fn resized(&self, width: u32, height: u32) -> bool {
        self.send(FrameEvent::Resized { width, height })
    }

    /// Queues a close request. Returns false once the render side is gone.
    pub fn request_close(&self) -> bool {
        self.send(FrameEvent::CloseRequested)
    }

    pub fn send(&self, event: FrameEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Consumer half, owned by the orchestrator.
#[derive(Debug)]
pub(crate) struct EventQueue {
    receiver: Receiver<FrameEvent>,
}

/// What a drain of the queue amounted to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DrainedEvents {
    /// Last reported size, if any resize arrived.
    pub resized: Option<(u32, u32)>,
    pub close_requested: bool,
}

impl EventQueue {
    pub(crate) fn new() -> (EventSender, Self) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (EventSender { sender }, Self { receiver })
    }

    /// Takes every queued event without blocking. Resizes coalesce to the last one.
    pub(crate) fn drain(&self) -> DrainedEvents {
        let mut drained = DrainedEvents::default();
        loop {
            match self.receiver.try_recv() {
                Ok(FrameEvent::Resized { width, height }) => {
                    drained.resized = Some((width, height));
                }
                Ok(FrameEvent::CloseRequested) => drained.close_requested = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Every event sender is gone; queue holds no more events");
                    break;
                }
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resizes_coalesce() {
        let (sender, queue) = EventQueue::new();
        assert!(sender.resized(100, 100));
        assert!(sender.resized(0, 0));
        assert!(sender.resized(300, 200));

        let drained = queue.drain();
        assert_eq!(drained.resized, Some((300, 200)));
        assert!(!drained.close_requested);
        assert_eq!(queue.drain(), DrainedEvents::default());
    }

    #[test]
    fn test_close_survives_later_resize() {
        let (sender, queue) = EventQueue::new();
        sender.request_close();
        sender.resized(10, 10);
        let drained = queue.drain();
        assert!(drained.close_requested);
        assert_eq!(drained.resized, Some((10, 10)));
    }

    #[test]
    fn test_sender_reports_disconnect() {
        let (sender, queue) = EventQueue::new();
        drop(queue);
        assert!(!sender.request_close());
    }

    #[test]
    fn test_drain_after_senders_drop_keeps_queued_events() {
        let (sender, queue) = EventQueue::new();
        sender.resized(64, 32);
        drop(sender);

        assert_eq!(queue.drain().resized, Some((64, 32)));
        assert_eq!(queue.drain(), DrainedEvents::default());
    }

    #[test]
    fn test_sender_works_across_threads() {
        let (sender, queue) = EventQueue::new();
        std::thread::spawn(move || sender.resized(640, 480))
            .join()
            .expect("join");
        assert_eq!(queue.drain().resized, Some((640, 480)));
    }
}
