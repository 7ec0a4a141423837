//! Device events
//!
//! An [`Event`] is recorded on one stream and completes when that stream
//! reaches the record point. Other streams wait on it to order themselves
//! after the recording stream.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Never recorded on any stream.
    Unrecorded,
    /// Recorded; the stream has not reached the record point yet.
    Pending,
    Complete,
    /// The recording stream was in an error state when it reached the event.
    Error,
}

struct EventInner {
    id: u64,
    status: Mutex<EventStatus>,
    signalled: Condvar,
}

#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                status: Mutex::new(EventStatus::Unrecorded),
                signalled: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> EventStatus {
        *self.inner.status.lock()
    }

    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    /// Block until the event leaves the pending state; returns the final status.
    ///
    /// Returns immediately for an unrecorded event.
    pub fn synchronize(&self) -> EventStatus {
        let mut status = self.inner.status.lock();
        while *status == EventStatus::Pending {
            self.inner.signalled.wait(&mut status);
        }
        *status
    }

    pub(crate) fn mark_pending(&self) {
        *self.inner.status.lock() = EventStatus::Pending;
    }

    pub(crate) fn signal(&self, success: bool) {
        let mut status = self.inner.status.lock();
        *status = if success {
            EventStatus::Complete
        } else {
            EventStatus::Error
        };
        self.inner.signalled.notify_all();
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_unrecorded_event_does_not_block() {
        let event = Event::new();
        assert_eq!(event.synchronize(), EventStatus::Unrecorded);
    }

    #[test]
    fn test_pending_event_blocks_until_signalled() {
        let event = Event::new();
        event.mark_pending();
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal(true);
        });
        assert_eq!(event.synchronize(), EventStatus::Complete);
        assert!(event.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_signal() {
        let event = Event::default();
        event.mark_pending();
        event.signal(false);
        assert_eq!(event.synchronize(), EventStatus::Error);
        assert_ne!(event.id(), Event::new().id());
    }
}
