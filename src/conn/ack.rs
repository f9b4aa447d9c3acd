//! Acknowledgement tracker: outbound publishes awaiting ACK/NACK.
//!
//! Entries are kept in ascending `msg_serial` order. The tracker is driven
//! only by the state machine (via actor effects), never by the transport, so
//! resume/fail decisions stay single transitions.

use std::collections::VecDeque;

use aw_protocol::{ErrorInfo, ProtocolMessage};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::Error;

/// One in-flight publish: the frame (kept for re-send on resume), the serial
/// range it occupies, and the completion handle.
pub struct PendingPublish {
    pub frame: ProtocolMessage,
    pub serial: i64,
    pub count: u32,
    pub done: oneshot::Sender<Result<(), Error>>,
}

/// Bounded FIFO of publishes awaiting a terminal frame.
pub struct AckTracker {
    entries: VecDeque<PendingPublish>,
    capacity: usize,
}

impl AckTracker {
    pub fn new(capacity: usize) -> Self {
        AckTracker {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a sent publish. On overflow the oldest entry is failed with
    /// `QueueOverflow` to make room.
    pub fn push(&mut self, entry: PendingPublish) {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                warn!(serial = oldest.serial, "ack tracker overflow, failing oldest");
                let _ = oldest.done.send(Err(Error::QueueOverflow));
            }
        }
        self.entries.push_back(entry);
    }

    /// Complete every entry whose range intersects `[serial, serial+count)`.
    pub fn ack(&mut self, serial: i64, count: u32) {
        for entry in self.take_range(serial, count) {
            let _ = entry.done.send(Ok(()));
        }
    }

    /// Fail every entry whose range intersects `[serial, serial+count)`.
    pub fn nack(&mut self, serial: i64, count: u32, error: ErrorInfo) {
        for entry in self.take_range(serial, count) {
            let _ = entry.done.send(Err(Error::from_error_info(error.clone())));
        }
    }

    /// Fail everything (close, suspend, or non-resumable reconnect).
    pub fn fail_all(&mut self) {
        for entry in self.entries.drain(..) {
            let _ = entry.done.send(Err(Error::Disconnected));
        }
    }

    /// Frames to re-send after an accepted resume, original serials intact,
    /// in ascending serial order.
    pub fn frames_for_resend(&self) -> Vec<ProtocolMessage> {
        self.entries.iter().map(|e| e.frame.clone()).collect()
    }

    fn take_range(&mut self, serial: i64, count: u32) -> Vec<PendingPublish> {
        let end = serial + i64::from(count);
        let mut matched = Vec::new();
        let mut keep = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let entry_end = entry.serial + i64::from(entry.count);
            if entry.serial < end && entry_end > serial {
                matched.push(entry);
            } else {
                keep.push_back(entry);
            }
        }
        self.entries = keep;
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aw_protocol::Action;

    fn entry(serial: i64) -> (PendingPublish, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        let mut frame = ProtocolMessage::with_channel(Action::Message, "ch");
        frame.msg_serial = Some(serial);
        (
            PendingPublish {
                frame,
                serial,
                count: 1,
                done: tx,
            },
            rx,
        )
    }

    #[test]
    fn ack_completes_the_covered_range() {
        let mut tracker = AckTracker::new(8);
        let (e0, mut rx0) = entry(0);
        let (e1, mut rx1) = entry(1);
        let (e2, mut rx2) = entry(2);
        tracker.push(e0);
        tracker.push(e1);
        tracker.push(e2);

        tracker.ack(0, 2);
        assert!(matches!(rx0.try_recv(), Ok(Ok(()))));
        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert!(rx2.try_recv().is_err(), "serial 2 must stay pending");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn nack_fails_with_the_broker_error() {
        let mut tracker = AckTracker::new(8);
        let (e0, mut rx0) = entry(0);
        tracker.push(e0);
        tracker.nack(0, 1, ErrorInfo::new(40160, Some(401), "denied"));
        match rx0.try_recv() {
            Ok(Err(Error::AuthFailure(info))) => assert_eq!(info.code, 40160),
            other => panic!("expected auth failure, got {other:?}"),
        }
    }

    #[test]
    fn overflow_fails_the_oldest_entry() {
        let mut tracker = AckTracker::new(2);
        let (e0, mut rx0) = entry(0);
        let (e1, _rx1) = entry(1);
        let (e2, _rx2) = entry(2);
        tracker.push(e0);
        tracker.push(e1);
        tracker.push(e2);
        assert!(matches!(rx0.try_recv(), Ok(Err(Error::QueueOverflow))));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn fail_all_resolves_everything_with_disconnected() {
        let mut tracker = AckTracker::new(8);
        let (e0, mut rx0) = entry(0);
        let (e1, mut rx1) = entry(1);
        tracker.push(e0);
        tracker.push(e1);
        tracker.fail_all();
        assert!(matches!(rx0.try_recv(), Ok(Err(Error::Disconnected))));
        assert!(matches!(rx1.try_recv(), Ok(Err(Error::Disconnected))));
        assert!(tracker.is_empty());
    }

    #[test]
    fn resend_frames_keep_original_serials_in_order() {
        let mut tracker = AckTracker::new(8);
        let (e3, _r3) = entry(3);
        let (e4, _r4) = entry(4);
        tracker.push(e3);
        tracker.push(e4);
        let frames = tracker.frames_for_resend();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_serial, Some(3));
        assert_eq!(frames[1].msg_serial, Some(4));
    }
}
