//! One accelerator as seen by the runtime
//!
//! A [`Device`] owns its stream roles (compute, host-to-device,
//! device-to-host, callback) and a private worker thread. In single-stream
//! mode every role is the same stream.

use crate::error::{Error, Result};
use crate::worker::{WorkerHandle, WorkerThread};
use std::sync::Arc;
use tessera_device::{Stream, StreamExecutor};

pub struct Device {
    ordinal: usize,
    executor: Arc<StreamExecutor>,
    compute_stream: Arc<Stream>,
    host_to_device_stream: Arc<Stream>,
    device_to_host_stream: Arc<Stream>,
    callback_stream: Arc<Stream>,
    multi_stream: bool,
    synchronous_deallocation: bool,
    asynchronous: bool,
    worker: WorkerThread,
}

impl Device {
    /// Create the device's streams and worker thread.
    ///
    /// Single-stream devices must deallocate synchronously.
    pub fn new(
        executor: Arc<StreamExecutor>,
        multi_stream: bool,
        synchronous_deallocation: bool,
        asynchronous: bool,
    ) -> Result<Self> {
        if !multi_stream && !synchronous_deallocation {
            return Err(Error::InvalidArgument(
                "single-stream devices require synchronous deallocation".to_string(),
            ));
        }

        let ordinal = executor.ordinal();
        let compute_stream = Stream::new(&executor)?;
        let (host_to_device_stream, device_to_host_stream, callback_stream) = if multi_stream {
            (Stream::new(&executor)?, Stream::new(&executor)?, Stream::new(&executor)?)
        } else {
            (
                Arc::clone(&compute_stream),
                Arc::clone(&compute_stream),
                Arc::clone(&compute_stream),
            )
        };
        let worker = WorkerThread::new(format!("tessera-device-{ordinal}"))
            .map_err(|e| Error::Internal(format!("failed to start worker for device {ordinal}: {e}")))?;

        tracing::debug!(
            device_ordinal = ordinal,
            multi_stream,
            synchronous_deallocation,
            asynchronous,
            "device_created"
        );
        Ok(Self {
            ordinal,
            executor,
            compute_stream,
            host_to_device_stream,
            device_to_host_stream,
            callback_stream,
            multi_stream,
            synchronous_deallocation,
            asynchronous,
            worker,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn executor(&self) -> &Arc<StreamExecutor> {
        &self.executor
    }

    pub fn compute_stream(&self) -> &Arc<Stream> {
        &self.compute_stream
    }

    pub fn host_to_device_stream(&self) -> &Arc<Stream> {
        &self.host_to_device_stream
    }

    pub fn device_to_host_stream(&self) -> &Arc<Stream> {
        &self.device_to_host_stream
    }

    pub fn callback_stream(&self) -> &Arc<Stream> {
        &self.callback_stream
    }

    pub fn multi_stream(&self) -> bool {
        self.multi_stream
    }

    pub fn synchronous_deallocation(&self) -> bool {
        self.synchronous_deallocation
    }

    pub fn asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn worker(&self) -> WorkerHandle {
        self.worker.handle()
    }

    /// Run `callback` on the worker thread once `stream` reaches this point.
    pub fn then_execute_on_worker_thread<F>(&self, stream: &Stream, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = self.worker.handle();
        stream.then_do_host_callback(move || worker.schedule(callback));
    }

    /// Keep `resource` alive until `stream` reaches this point, then drop it on the worker thread.
    pub fn then_release_on_worker_thread<T>(&self, stream: &Stream, resource: T)
    where
        T: Send + 'static,
    {
        self.then_execute_on_worker_thread(stream, move || drop(resource));
    }

    /// Keep `resource` alive until `stream` reaches this point, then drop it on the stream.
    pub fn then_release<T>(&self, stream: &Stream, resource: T)
    where
        T: Send + 'static,
    {
        stream.then_do_host_callback(move || drop(resource));
    }

    /// Run `job` on the worker thread now, without waiting for any stream.
    pub fn execute_on_worker_thread<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.schedule(job);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.ordinal)
            .field("multi_stream", &self.multi_stream)
            .field("synchronous_deallocation", &self.synchronous_deallocation)
            .field("asynchronous", &self.asynchronous)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.executor.synchronize_all_activity() {
            tracing::error!(
                device_ordinal = self.ordinal,
                "error when closing device: stream activity did not complete cleanly"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;
    use tessera_device::DeviceError;

    fn executor() -> Arc<StreamExecutor> {
        Arc::new(StreamExecutor::new(0, "host", 1 << 16))
    }

    #[test]
    fn test_single_stream_aliases_roles() {
        let device = Device::new(executor(), false, true, true).unwrap();
        let compute = device.compute_stream().id();
        assert_eq!(device.host_to_device_stream().id(), compute);
        assert_eq!(device.device_to_host_stream().id(), compute);
        assert_eq!(device.callback_stream().id(), compute);
    }

    #[test]
    fn test_multi_stream_has_distinct_roles() {
        let device = Device::new(executor(), true, false, true).unwrap();
        let mut ids = vec![
            device.compute_stream().id(),
            device.host_to_device_stream().id(),
            device.device_to_host_stream().id(),
            device.callback_stream().id(),
        ];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(device.executor().stream_count(), 4);
    }

    #[test]
    fn test_single_stream_requires_synchronous_deallocation() {
        let err = Device::new(executor(), false, false, true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_release_waits_for_stream_checkpoint() {
        let device = Device::new(executor(), false, true, true).unwrap();
        let stream = Arc::clone(device.compute_stream());
        let resource = Arc::new(());
        let observer = Arc::downgrade(&resource);

        stream.then_do_host_callback(|| thread::sleep(Duration::from_millis(30)));
        device.then_release_on_worker_thread(&stream, resource);
        assert!(observer.upgrade().is_some());

        stream.block_host_until_done().unwrap();
        let (tx, rx) = channel();
        device.execute_on_worker_thread(move || tx.send(()).unwrap());
        rx.recv().unwrap();
        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn test_worker_callback_runs_off_stream_thread() {
        let device = Device::new(executor(), false, true, true).unwrap();
        let (tx, rx) = channel();
        device.then_execute_on_worker_thread(device.compute_stream(), move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });
        assert_eq!(rx.recv().unwrap().as_deref(), Some("tessera-device-0"));
    }

    #[test]
    fn test_release_on_stream() {
        let device = Device::new(executor(), true, false, true).unwrap();
        let resource = Arc::new(());
        let observer = Arc::downgrade(&resource);
        device.then_release(device.callback_stream(), resource);
        device.callback_stream().block_host_until_done().unwrap();
        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn test_drop_with_failed_stream_does_not_panic() {
        let device = Device::new(executor(), false, true, true).unwrap();
        device
            .compute_stream()
            .then_execute("fails", || Err(DeviceError::Execution("fault".to_string())));
        drop(device);
    }
}
