//! In-order device streams
//!
//! Each [`Stream`] is a FIFO of operations drained by one dedicated thread,
//! which plays the part of the device's command processor. Operations on the
//! same stream run in enqueue order; ordering across streams exists only
//! through [`Event`] record/wait pairs.
//!
//! Once an operation fails the stream's status becomes sticky: later copies
//! and executions are skipped, events recorded afterwards signal an error and
//! host callbacks still run so that deferred releases are never lost.

use crate::error::{DeviceError, Result};
use crate::event::{Event, EventStatus};
use crate::executor::StreamExecutor;
use crate::memory::DeviceMemory;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

type StreamOp = Box<dyn FnOnce(&StreamState) + Send>;

struct StreamState {
    id: StreamId,
    status: Mutex<Option<DeviceError>>,
    pending: Mutex<u64>,
    idle: Condvar,
}

impl StreamState {
    fn is_ok(&self) -> bool {
        self.status.lock().is_none()
    }

    fn status(&self) -> Result<()> {
        match &*self.status.lock() {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    fn fail(&self, error: DeviceError) {
        let mut status = self.status.lock();
        if status.is_none() {
            tracing::warn!(stream = %self.id, error = %error, "stream entered error state");
            *status = Some(error);
        }
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct Stream {
    id: StreamId,
    executor: Arc<StreamExecutor>,
    state: Arc<StreamState>,
    sender: Mutex<Option<mpsc::Sender<StreamOp>>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    operations_enqueued: AtomicU64,
    waits_enqueued: AtomicU64,
}

impl Stream {
    /// Create a stream on `executor` and start its processing thread.
    pub fn new(executor: &Arc<StreamExecutor>) -> Result<Arc<Self>> {
        let id = StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(StreamState {
            id,
            status: Mutex::new(None),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let (sender, receiver) = mpsc::channel::<StreamOp>();
        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("tessera-stream-{}-{}", executor.ordinal(), id.0))
            .spawn(move || {
                for op in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(|| op(&thread_state))).is_err() {
                        thread_state.fail(DeviceError::Internal("stream operation panicked".to_string()));
                    }
                    thread_state.finish_one();
                }
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn stream thread: {e}")))?;

        let stream = Arc::new(Self {
            id,
            executor: Arc::clone(executor),
            state,
            sender: Mutex::new(Some(sender)),
            thread_id: handle.thread().id(),
            thread: Some(handle),
            operations_enqueued: AtomicU64::new(0),
            waits_enqueued: AtomicU64::new(0),
        });
        executor.register_stream(&stream);
        tracing::debug!(stream = %id, device_ordinal = executor.ordinal(), "stream_created");
        Ok(stream)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn device_ordinal(&self) -> usize {
        self.executor.ordinal()
    }

    pub fn executor(&self) -> &Arc<StreamExecutor> {
        &self.executor
    }

    /// False once any operation on this stream has failed.
    pub fn ok(&self) -> bool {
        self.state.is_ok()
    }

    /// The first failure recorded on this stream, if any.
    pub fn status(&self) -> Result<()> {
        self.state.status()
    }

    /// Operations enqueued since creation.
    pub fn operations_enqueued(&self) -> u64 {
        self.operations_enqueued.load(Ordering::SeqCst)
    }

    /// Event waits enqueued since creation.
    pub fn waits_enqueued(&self) -> u64 {
        self.waits_enqueued.load(Ordering::SeqCst)
    }

    fn enqueue(&self, op: StreamOp) {
        self.operations_enqueued.fetch_add(1, Ordering::SeqCst);
        *self.state.pending.lock() += 1;
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(op).is_ok(),
            None => false,
        };
        if !sent {
            self.state.fail(DeviceError::Stream(format!("{} is closed", self.id)));
            self.state.finish_one();
        }
    }

    /// Copy host bytes into `destination` once the stream reaches this point.
    ///
    /// `source` is kept alive by the stream until the copy has run.
    pub fn then_memcpy_to_device<B>(&self, destination: DeviceMemory, source: B) -> Result<&Self>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let len = source.as_ref().len();
        if len != destination.size() {
            return Err(DeviceError::InvalidArgument(format!(
                "copy of {len} bytes into {destination}"
            )));
        }
        let region = self.executor.resolve(destination)?;
        self.enqueue(Box::new(move |state| {
            if state.is_ok() {
                region.write().copy_from_slice(source.as_ref());
            }
        }));
        Ok(self)
    }

    /// Hand the contents of `source` to `sink` once the stream reaches this point.
    ///
    /// The sink is not called if the stream has failed by then.
    pub fn then_memcpy_from_device<F>(&self, source: DeviceMemory, sink: F) -> Result<&Self>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        let region = self.executor.resolve(source)?;
        self.enqueue(Box::new(move |state| {
            if state.is_ok() {
                sink(&region.read());
            }
        }));
        Ok(self)
    }

    /// Run device-side work; an error makes the stream's status sticky.
    pub fn then_execute<F>(&self, name: impl Into<String>, work: F) -> &Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        self.enqueue(Box::new(move |state| {
            if !state.is_ok() {
                tracing::debug!(stream = %state.id, work = %name, "skipping work on failed stream");
                return;
            }
            if let Err(e) = work() {
                tracing::error!(stream = %state.id, work = %name, error = %e, "device work failed");
                state.fail(e);
            }
        }));
        self
    }

    pub fn then_record_event(&self, event: &Event) -> &Self {
        event.mark_pending();
        let event = event.clone();
        self.enqueue(Box::new(move |state| event.signal(state.is_ok())));
        self
    }

    /// Stall this stream until `event` completes. Unrecorded events are ignored.
    pub fn then_wait_for_event(&self, event: &Event) -> &Self {
        self.waits_enqueued.fetch_add(1, Ordering::SeqCst);
        let event = event.clone();
        self.enqueue(Box::new(move |state| {
            if event.synchronize() == EventStatus::Error {
                state.fail(DeviceError::Stream(format!(
                    "waited on event {} recorded by a failed stream",
                    event.id()
                )));
            }
        }));
        self
    }

    /// Order everything enqueued after this call behind `other`'s current tail.
    pub fn then_wait_for_stream(&self, other: &Stream) -> &Self {
        if other.id == self.id {
            return self;
        }
        let event = Event::new();
        other.then_record_event(&event);
        self.then_wait_for_event(&event)
    }

    pub fn then_do_host_callback<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(move |_| callback()));
        self
    }

    /// Host callback that also receives the stream's status at that point.
    pub fn then_do_host_callback_with_status<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Box::new(move |state| callback(state.status())));
        self
    }

    /// Block the calling thread until every enqueued operation has run.
    ///
    /// Called from the stream's own thread this returns the current status
    /// without waiting.
    pub fn block_host_until_done(&self) -> Result<()> {
        if thread::current().id() != self.thread_id {
            let mut pending = self.state.pending.lock();
            while *pending > 0 {
                self.state.idle.wait(&mut pending);
            }
        }
        self.state.status()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device_ordinal", &self.device_ordinal())
            .field("ok", &self.ok())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.sender.get_mut().take();
        if let Some(handle) = self.thread.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(stream = %self.id, "stream thread panicked");
            }
        }
    }
}
