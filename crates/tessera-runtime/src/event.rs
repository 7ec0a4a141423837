//! Buffer definition events
//!
//! A [`BufferDefinitionEvent`] marks the point on one stream at which a
//! buffer's contents became valid. Consumers on other streams wait on it
//! before reading; each stream waits at most once.

use parking_lot::Mutex;
use tessera_device::{Event, EventStatus, Stream, StreamId};

pub struct BufferDefinitionEvent {
    event: Event,
    /// Streams already ordered after the event. Guarded together with the
    /// enqueue so two callers cannot both decide to wait.
    streams_defined_on: Mutex<Vec<StreamId>>,
}

impl BufferDefinitionEvent {
    pub fn new() -> Self {
        Self {
            event: Event::new(),
            streams_defined_on: Mutex::new(Vec::new()),
        }
    }

    /// Record the event on `stream`.
    ///
    /// # Panics
    ///
    /// Panics if the event has already been recorded.
    pub fn record_on_stream(&self, stream: &Stream) {
        let mut defined_on = self.streams_defined_on.lock();
        assert!(
            defined_on.is_empty(),
            "definition event {} recorded twice",
            self.event.id()
        );
        stream.then_record_event(&self.event);
        defined_on.push(stream.id());
    }

    /// Order `stream` after the event; a stream that already observed it is skipped.
    pub fn wait_for_event_on_stream(&self, stream: &Stream) {
        let mut defined_on = self.streams_defined_on.lock();
        if defined_on.contains(&stream.id()) {
            return;
        }
        stream.then_wait_for_event(&self.event);
        defined_on.push(stream.id());
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn status(&self) -> EventStatus {
        self.event.status()
    }

    pub fn streams_defined_on(&self) -> Vec<StreamId> {
        self.streams_defined_on.lock().clone()
    }

    pub fn is_defined_on(&self, stream: &Stream) -> bool {
        self.streams_defined_on.lock().contains(&stream.id())
    }
}

impl Default for BufferDefinitionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferDefinitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDefinitionEvent")
            .field("event", &self.event)
            .field("streams_defined_on", &*self.streams_defined_on.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_device::StreamExecutor;

    fn streams() -> (Arc<Stream>, Arc<Stream>) {
        let executor = Arc::new(StreamExecutor::new(0, "host", 1 << 16));
        (Stream::new(&executor).unwrap(), Stream::new(&executor).unwrap())
    }

    #[test]
    fn test_record_marks_stream_observed() {
        let (producer, consumer) = streams();
        let event = BufferDefinitionEvent::new();
        event.record_on_stream(&producer);
        assert!(event.is_defined_on(&producer));
        assert!(!event.is_defined_on(&consumer));

        // The recording stream never waits on its own event.
        event.wait_for_event_on_stream(&producer);
        assert_eq!(producer.waits_enqueued(), 0);

        producer.block_host_until_done().unwrap();
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_wait_is_idempotent() {
        let (producer, consumer) = streams();
        let event = BufferDefinitionEvent::new();
        event.record_on_stream(&producer);

        event.wait_for_event_on_stream(&consumer);
        event.wait_for_event_on_stream(&consumer);
        assert_eq!(consumer.waits_enqueued(), 1);
        assert_eq!(event.streams_defined_on(), vec![producer.id(), consumer.id()]);
        consumer.block_host_until_done().unwrap();
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn test_double_record_panics() {
        let (producer, consumer) = streams();
        let event = BufferDefinitionEvent::new();
        event.record_on_stream(&producer);
        event.record_on_stream(&consumer);
    }
}
