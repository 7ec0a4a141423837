//! Single-threaded job queue
//!
//! Each device owns one [`WorkerThread`] that runs deferred host work
//! (buffer releases, replica launches) off the caller's and the streams'
//! threads.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send>;

type JobQueue = Arc<Mutex<Option<mpsc::Sender<Job>>>>;

/// Cloneable submission handle for a [`WorkerThread`].
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    queue: JobQueue,
}

impl WorkerHandle {
    /// Queue `job`; once the worker has shut down the job runs on the calling thread.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let rejected = match self.queue.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).err().map(|mpsc::SendError(job)| job),
            None => Some(Box::new(job) as Job),
        };
        if let Some(job) = rejected {
            tracing::debug!(worker = %self.name, "worker stopped, running job inline");
            job();
        }
    }
}

pub struct WorkerThread {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name: String = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(worker = %thread_name, "worker job panicked");
                }
            }
        })?;
        Ok(Self {
            handle: WorkerHandle {
                name: name.into(),
                queue: Arc::new(Mutex::new(Some(sender))),
            },
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.schedule(job);
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread").field("name", &self.name()).finish()
    }
}

impl Drop for WorkerThread {
    /// Drains queued jobs, then joins.
    fn drop(&mut self) {
        self.handle.queue.lock().take();
        if let Some(thread) = self.thread.take() {
            if self.is_current() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(worker = %self.handle.name, "worker thread panicked");
            }
        }
    }
}
