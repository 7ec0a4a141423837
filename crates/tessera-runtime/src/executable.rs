//! Replicated executables
//!
//! A [`LocalExecutable`] is a compiled program plus the device assignment of
//! its replicas. Single-replica launches run on the calling thread;
//! replicated launches are handed to each assigned device's worker thread
//! and joined.
//!
//! # Failure handling
//!
//! When one replica of a replicated launch fails, the others may be stuck in
//! a cross-replica collective waiting for it. The caller waits up to
//! [`ClientConfig::replica_timeout`](crate::ClientConfig) for them; if any are
//! still running after that, the process aborts. No in-band cancellation
//! exists for work stuck on a device.

use crate::buffer::LocalBuffer;
use crate::client::LocalClient;
use crate::device_buffer::{DefinitionEventSet, SharedDeviceBuffer};
use crate::error::{Error, Result};
use crate::event::BufferDefinitionEvent;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_device::{
    BuildOptions, Computation, ComputationPlacer, DeviceAssignment, DeviceError, Executable, RunOptions, Shape,
    ShapedBuffer,
};
use tessera_tracing::perf_span;
use tessera_tracing::performance::record_replicated_execution;

#[derive(Clone)]
pub struct LocalExecutable {
    client: Arc<LocalClient>,
    executable: Arc<dyn Executable>,
    device_assignment: DeviceAssignment,
}

impl LocalExecutable {
    /// Compile `computation` for the given argument layouts.
    ///
    /// Array shapes without a layout get the default compact layout. The
    /// result layout comes from `build_options` or, failing that, from the
    /// computation's program shape.
    #[tracing::instrument(skip_all, fields(computation = computation.name(), num_replicas = build_options.num_replicas))]
    pub fn compile(
        computation: &Computation,
        argument_layouts: Vec<Shape>,
        build_options: BuildOptions,
        client: Arc<LocalClient>,
    ) -> Result<Self> {
        let _span = perf_span!("compile", computation = computation.name());
        let argument_layouts: Vec<Shape> = argument_layouts.iter().map(Shape::with_default_layouts).collect();
        let result_layout = build_options
            .result_layout
            .clone()
            .unwrap_or_else(|| computation.program_shape().result.clone())
            .with_default_layouts();
        let options = build_options.with_result_layout(result_layout);

        let executable = client.compiler().compile(computation, &argument_layouts, &options)?;
        let device_assignment = ComputationPlacer::assign_devices(options.num_replicas, 1, client.device_count())?;
        tracing::debug!(
            computation = computation.name(),
            device_assignment = %device_assignment,
            "executable_compiled"
        );
        Ok(Self {
            client,
            executable,
            device_assignment,
        })
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn executable(&self) -> &Arc<dyn Executable> {
        &self.executable
    }

    pub fn name(&self) -> &str {
        self.executable.name()
    }

    pub fn device_assignment(&self) -> &DeviceAssignment {
        &self.device_assignment
    }

    pub fn num_replicas(&self) -> usize {
        self.device_assignment.replica_count()
    }

    /// Device ordinal of every replica, by replica index.
    pub fn device_ordinals(&self) -> Vec<usize> {
        (0..self.num_replicas())
            .map(|replica| self.device_assignment.get(replica, 0))
            .collect()
    }

    /// Launch `replica` on its assigned device.
    pub fn execute_helper(&self, arguments: &[&LocalBuffer], replica: usize) -> Result<LocalBuffer> {
        if replica >= self.num_replicas() {
            return Err(Error::InvalidArgument(format!(
                "replica {replica} out of range for {} replica(s)",
                self.num_replicas()
            )));
        }
        let device_ordinal = self.device_assignment.get(replica, 0);
        tracing::debug!(executable = self.name(), replica, device_ordinal, "execute_helper");
        let device = self.client.device(device_ordinal)?;

        let mut argument_buffers: Vec<Arc<SharedDeviceBuffer>> = Vec::with_capacity(arguments.len());
        let mut argument_views: Vec<ShapedBuffer> = Vec::with_capacity(arguments.len());
        for (i, argument) in arguments.iter().enumerate() {
            let device_buffer = argument.device_buffer().map_err(|_| {
                Error::InvalidArgument(format!(
                    "deleted buffer passed to execute() as argument {i} to replica {replica}"
                ))
            })?;
            if argument.device_ordinal() != device_ordinal {
                return Err(Error::InvalidArgument(format!(
                    "buffer passed to execute() as argument {i} to replica {replica} is on device {}, \
                     but replica is assigned to device {device_ordinal}",
                    argument.device_ordinal()
                )));
            }
            argument_views.push(device_buffer.as_shaped_buffer(argument.on_host_shape()));
            argument_buffers.push(Arc::clone(device_buffer));
        }

        let compute_stream = device.compute_stream();
        if !device.asynchronous() {
            // Pacing: keep at most one launch in flight per device.
            compute_stream.block_host_until_done()?;
        }

        let mut events = DefinitionEventSet::new();
        for buffer in &argument_buffers {
            buffer.collect_definition_events(&mut events);
        }
        for event in &events {
            event.wait_for_event_on_stream(compute_stream);
        }

        let options = RunOptions {
            stream: Arc::clone(compute_stream),
            host_to_device_stream: Some(Arc::clone(device.host_to_device_stream())),
            allocator: Arc::clone(self.client.allocator()),
            device_assignment: Some(self.device_assignment.clone()),
            replica,
        };
        let views: Vec<&ShapedBuffer> = argument_views.iter().collect();
        let result = self.executable.run_async(&views, &options).map_err(|e| {
            if matches!(e, DeviceError::Execution(_)) {
                tracing::error!(executable = self.name(), replica, device_ordinal, error = %e, "execution failed");
            } else {
                tracing::debug!(executable = self.name(), replica, device_ordinal, error = %e, "launch rejected");
            }
            Error::from(e)
        })?;

        let on_host_shape = result.on_host_shape().without_layouts();
        let definition_event = device.multi_stream().then(|| {
            let event = Arc::new(BufferDefinitionEvent::new());
            event.record_on_stream(compute_stream);
            event
        });
        let output = SharedDeviceBuffer::from_scoped_shaped_buffer(result, definition_event)?;

        if device.synchronous_deallocation() {
            device.then_release_on_worker_thread(
                compute_stream,
                (argument_buffers, Arc::clone(&output), Arc::clone(&self.executable)),
            );
        }
        Ok(LocalBuffer::new(on_host_shape, output, Arc::clone(&self.client)))
    }

    /// Launch a single-replica executable.
    pub fn execute(&self, arguments: &[&LocalBuffer]) -> Result<LocalBuffer> {
        let _span = perf_span!("execute", arguments = arguments.len());
        if self.num_replicas() != 1 {
            return Err(Error::InvalidArgument(format!(
                "attempted to execute computation with {} replicas using execute()",
                self.num_replicas()
            )));
        }
        self.execute_helper(arguments, 0)
    }

    /// Launch every replica with its own argument list.
    ///
    /// # Aborts
    ///
    /// Aborts the process if a replica fails and the remaining replicas do not
    /// finish within the client's replica timeout.
    #[tracing::instrument(skip_all, fields(executable = self.name(), replicas = argument_handles.len()))]
    pub fn execute_per_replica(&self, argument_handles: &[Vec<&LocalBuffer>]) -> Result<Vec<LocalBuffer>> {
        let _span = perf_span!("execute_per_replica", replicas = argument_handles.len());
        let num_replicas = self.num_replicas();
        if argument_handles.len() != num_replicas {
            return Err(Error::InvalidArgument(format!(
                "attempted to execute with {} argument lists when replica count is {num_replicas}",
                argument_handles.len()
            )));
        }
        if argument_handles.len() > self.client.device_count() {
            return Err(Error::InvalidArgument(format!(
                "attempted to execute with {} replicas when device count is {}",
                argument_handles.len(),
                self.client.device_count()
            )));
        }

        for (replica, ordinal) in self.device_ordinals().into_iter().enumerate() {
            tracing::debug!(replica, device_ordinal = ordinal, "replica_placement");
        }

        let start = Instant::now();
        let results = if num_replicas == 1 {
            vec![Some(self.execute_helper(&argument_handles[0], 0))]
        } else {
            self.launch_replicas(argument_handles)?
        };

        let failed = results.iter().filter(|r| !matches!(r, Some(Ok(_)))).count();
        record_replicated_execution(num_replicas, failed, start.elapsed().as_micros() as u64);

        results
            .into_iter()
            .enumerate()
            .map(|(replica, result)| {
                let result = result
                    .unwrap_or_else(|| Err(Error::Internal(format!("replica {replica} reported no result"))));
                result.map_err(|source| Error::ReplicaFailed {
                    replica,
                    source: Box::new(source),
                })
            })
            .collect()
    }

    fn launch_replicas(&self, argument_handles: &[Vec<&LocalBuffer>]) -> Result<Vec<Option<Result<LocalBuffer>>>> {
        let devices = self
            .device_ordinals()
            .into_iter()
            .map(|ordinal| self.client.device(ordinal))
            .collect::<Result<Vec<_>>>()?;

        let tracker = Arc::new(ReplicaTracker::new(argument_handles.len()));
        for (replica, (device, arguments)) in devices.into_iter().zip(argument_handles).enumerate() {
            let arguments: Vec<LocalBuffer> = arguments.iter().map(|&buffer| buffer.clone()).collect();
            let executable = self.clone();
            let tracker = Arc::clone(&tracker);
            device.execute_on_worker_thread(move || {
                let arguments: Vec<&LocalBuffer> = arguments.iter().collect();
                let result = panic::catch_unwind(AssertUnwindSafe(|| executable.execute_helper(&arguments, replica)))
                    .unwrap_or_else(|_| Err(Error::Internal(format!("replica {replica} panicked"))));
                if let Err(e) = &result {
                    tracing::error!(replica, error = %e, "replica launch failed");
                }
                tracker.finish(replica, result);
            });
        }

        let timeout = self.client.config().replica_timeout;
        match tracker.wait(timeout) {
            Some(results) => Ok(results),
            None => {
                tracing::error!(
                    executable = self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "replicated computation failed and the remaining replicas did not complete; \
                     they may be stuck at a cross-replica barrier. Aborting."
                );
                std::process::abort();
            }
        }
    }
}

impl std::fmt::Debug for LocalExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutable")
            .field("name", &self.name())
            .field("device_assignment", &self.device_assignment.to_string())
            .finish()
    }
}

struct TrackerState {
    running: usize,
    failed: usize,
    results: Vec<Option<Result<LocalBuffer>>>,
}

/// Counts outstanding and failed replicas of one launch.
struct ReplicaTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl ReplicaTracker {
    fn new(replicas: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                running: replicas,
                failed: 0,
                results: (0..replicas).map(|_| None).collect(),
            }),
            changed: Condvar::new(),
        }
    }

    fn finish(&self, replica: usize, result: Result<LocalBuffer>) {
        let mut state = self.state.lock();
        if result.is_err() {
            state.failed += 1;
        }
        state.results[replica] = Some(result);
        state.running -= 1;
        self.changed.notify_all();
    }

    /// Wait for every replica, or for a failure and then at most `timeout`
    /// for the rest. `None` if replicas are still running after the timeout.
    fn wait(&self, timeout: Duration) -> Option<Vec<Option<Result<LocalBuffer>>>> {
        let mut state = self.state.lock();
        while state.running > 0 && state.failed == 0 {
            self.changed.wait(&mut state);
        }
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while state.running > 0 {
                    if self.changed.wait_until(&mut state, deadline).timed_out() && state.running > 0 {
                        return None;
                    }
                }
            }
            None => {
                while state.running > 0 {
                    self.changed.wait(&mut state);
                }
            }
        }
        Some(std::mem::take(&mut state.results))
    }
}
