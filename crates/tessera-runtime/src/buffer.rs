//! Client-visible device buffers
//!
//! A [`LocalBuffer`] pairs a host shape with a shared [`SharedDeviceBuffer`]
//! tree. Cloning a buffer, destructuring a tuple or building one with
//! [`LocalBuffer::make_tuple`] shares device allocations instead of copying
//! them; memory is released when the last reference to a tree node goes away.
//!
//! # Transfers
//!
//! Host-to-device copies are issued on the device's host-to-device stream and
//! return without waiting for the copy in asynchronous mode. Device-to-host
//! copies always block until the value is on the host.
//!
//! ```text
//!   from_host:  flatten ─► allocate ─► [h2d waits compute]* ─► index tables
//!               ─► leaf copies ─► [record definition event]*
//!   to_host:    wait definition events on d2h ─► copy leaves ─► unflatten
//!
//!   * multi-stream devices only
//! ```

use crate::client::LocalClient;
use crate::device::Device;
use crate::device_buffer::SharedDeviceBuffer;
use crate::error::{Error, Result};
use crate::event::BufferDefinitionEvent;
use crate::marshal::{HostBufferTree, Marshal};
use serde::Serialize;
use std::sync::{mpsc, Arc};
use std::time::Instant;
use tessera_device::{Literal, Shape, ShapedBuffer, Stream, TransferManager};
use tessera_tracing::{perf_event, perf_span};
use tessera_tracing::performance::{record_allocation, record_transfer, TransferDirection};

/// Introspection snapshot of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub shape: Shape,
    pub device_ordinal: usize,
    pub is_deleted: bool,
}

#[derive(Clone)]
pub struct LocalBuffer {
    client: Arc<LocalClient>,
    on_host_shape: Shape,
    device_ordinal: usize,
    device_buffer: Option<Arc<SharedDeviceBuffer>>,
}

impl LocalBuffer {
    pub fn new(on_host_shape: Shape, device_buffer: Arc<SharedDeviceBuffer>, client: Arc<LocalClient>) -> Self {
        Self {
            client,
            on_host_shape,
            device_ordinal: device_buffer.device_ordinal(),
            device_buffer: Some(device_buffer),
        }
    }

    /// Copy a host value to device `device_ordinal`.
    ///
    /// In asynchronous mode this returns once the copies are enqueued.
    #[tracing::instrument(skip(value, client), fields(value_type = std::any::type_name::<T>()))]
    pub fn from_host<T: Marshal>(value: &T, client: &Arc<LocalClient>, device_ordinal: usize) -> Result<Self> {
        let _span = perf_span!("from_host", device_ordinal = device_ordinal);
        client.host_ref_manager().collect_garbage();
        let tree = value.flatten()?;
        Self::transfer_host_to_device(tree, client, device_ordinal)
    }

    /// Copy several host values, each to its own device ordinal.
    ///
    /// Values are flattened on the calling thread; with more than one value
    /// the copies are issued from the client's transfer pool. Every transfer
    /// runs to completion; the first error in input order is returned.
    #[tracing::instrument(skip(values, client), fields(count = values.len(), value_type = std::any::type_name::<T>()))]
    pub fn from_host_values<T: Marshal>(values: &[(T, usize)], client: &Arc<LocalClient>) -> Result<Vec<Self>> {
        let _span = perf_span!("from_host_values", values = values.len());
        client.host_ref_manager().collect_garbage();

        let trees = values
            .iter()
            .map(|(value, ordinal)| Ok((value.flatten()?, *ordinal)))
            .collect::<Result<Vec<_>>>()?;

        perf_event!(
            "h2d_batch",
            values = trees.len(),
            bytes = trees.iter().map(|(tree, _)| tree.size_bytes()).sum::<usize>(),
            threads = client.h2d_transfer_pool().current_num_threads()
        );

        if let [(tree, ordinal)] = trees.as_slice() {
            return Ok(vec![Self::transfer_host_to_device(tree.clone(), client, *ordinal)?]);
        }

        let mut results: Vec<Option<Result<Self>>> = (0..trees.len()).map(|_| None).collect();
        client.h2d_transfer_pool().scope(|scope| {
            for ((tree, ordinal), slot) in trees.into_iter().zip(results.iter_mut()) {
                scope.spawn(move |_| *slot = Some(Self::transfer_host_to_device(tree, client, ordinal)));
            }
        });

        results
            .into_iter()
            .enumerate()
            .map(|(i, result)| result.unwrap_or_else(|| Err(Error::Internal(format!("transfer of value {i} never ran")))))
            .collect()
    }

    fn transfer_host_to_device(tree: HostBufferTree, client: &Arc<LocalClient>, device_ordinal: usize) -> Result<Self> {
        let device = client.device(device_ordinal)?;
        if tree.leaves.len() != tree.shape.leaf_count() {
            return Err(Error::Transfer(format!(
                "host value of shape {} flattened into {} leaves",
                tree.shape,
                tree.leaves.len()
            )));
        }

        let transfer_manager = client.transfer_manager();
        let stream = device.host_to_device_stream();
        let start = Instant::now();

        let scoped = transfer_manager.allocate_scoped_shaped_buffer(&tree.shape, client.allocator(), device_ordinal)?;
        let allocated: usize = scoped.as_shaped_buffer().buffers().iter().map(|(_, m)| m.size()).sum();
        record_allocation(device_ordinal, allocated, start.elapsed().as_micros() as u64);

        if device.multi_stream() {
            // New allocations may still be read by work queued on the compute stream.
            stream.then_wait_for_stream(device.compute_stream());
        }
        if let Err(e) = enqueue_leaf_copies(transfer_manager, stream, &tree, scoped.as_shaped_buffer()) {
            device.then_release(stream, scoped);
            return Err(Error::transfer(e));
        }

        let definition_event = device.multi_stream().then(|| {
            let event = Arc::new(BufferDefinitionEvent::new());
            event.record_on_stream(stream);
            event
        });
        let device_buffer = SharedDeviceBuffer::from_scoped_shaped_buffer(scoped, definition_event)?;
        if device.synchronous_deallocation() {
            device.then_release_on_worker_thread(stream, Arc::clone(&device_buffer));
        }

        let bytes = tree.size_bytes();
        let on_host_shape = tree.shape.clone();
        let host_refs = client.host_ref_manager().manage_references(vec![Box::new(tree)]);
        device.then_release(stream, host_refs);

        if !device.asynchronous() {
            stream.block_host_until_done().map_err(Error::transfer)?;
        }
        record_transfer(TransferDirection::HostToDevice, bytes, start.elapsed().as_micros() as u64);
        Ok(Self::new(on_host_shape, device_buffer, Arc::clone(client)))
    }

    /// Build a tuple over existing buffers on `device_ordinal` without copying their payloads.
    #[tracing::instrument(skip(buffers, client), fields(elements = buffers.len()))]
    pub fn make_tuple(buffers: &[LocalBuffer], client: &Arc<LocalClient>, device_ordinal: usize) -> Result<Self> {
        let device = client.device(device_ordinal)?;
        let mut host_shapes = Vec::with_capacity(buffers.len());
        let mut children = Vec::with_capacity(buffers.len());
        for (i, buffer) in buffers.iter().enumerate() {
            if buffer.device_ordinal != device_ordinal {
                return Err(Error::InvalidArgument(format!(
                    "make_tuple element {i} is on device {}, tuple requested on device {device_ordinal}",
                    buffer.device_ordinal
                )));
            }
            let child = buffer
                .device_buffer
                .as_ref()
                .ok_or_else(|| Error::InvalidArgument(format!("make_tuple element {i} has been deleted")))?;
            children.push(Arc::clone(child));
            host_shapes.push(buffer.on_host_shape.clone());
        }

        let transfer_manager = client.transfer_manager();
        let definition_event = Arc::new(BufferDefinitionEvent::new());
        let tuple = SharedDeviceBuffer::make_tuple(
            children,
            transfer_manager,
            client.allocator(),
            device_ordinal,
            Some(Arc::clone(&definition_event)),
        )?;
        let on_host_shape = Shape::tuple(host_shapes);
        let shaped = tuple.as_shaped_buffer(&on_host_shape);

        let stream = device.host_to_device_stream();
        if device.multi_stream() {
            stream.then_wait_for_stream(device.compute_stream());
        }
        if let Err(e) = transfer_manager.write_root_tuple_index_table(stream, &shaped) {
            device.then_release(stream, tuple);
            return Err(Error::transfer(e));
        }
        definition_event.record_on_stream(stream);
        if device.synchronous_deallocation() {
            device.then_release_on_worker_thread(stream, Arc::clone(&tuple));
        }
        Ok(Self::new(on_host_shape, tuple, Arc::clone(client)))
    }

    /// Copy the buffer back to the host. Blocks until the copy completes.
    #[tracing::instrument(skip(self), fields(
        device_ordinal = self.device_ordinal,
        shape = %self.on_host_shape,
        value_type = std::any::type_name::<T>()
    ))]
    pub fn to_host<T: Marshal>(&self) -> Result<T> {
        let _span = perf_span!("to_host", device_ordinal = self.device_ordinal);
        self.client.host_ref_manager().collect_garbage();
        let device_buffer = self.device_buffer()?;
        let device = self.client.device(self.device_ordinal)?;
        let stream = device.device_to_host_stream();
        device_buffer.wait_for_definition_events_on_stream(stream);

        let shaped = device_buffer.as_shaped_buffer(&self.on_host_shape);
        let (sender, receiver) = mpsc::sync_channel(1);
        let start = Instant::now();
        self.client
            .transfer_manager()
            .transfer_literal_from_device(stream, &shaped, move |result| {
                let _ = sender.send(result);
            })
            .map_err(Error::transfer)?;
        let literal = receiver
            .recv()
            .map_err(|_| Error::Internal("device-to-host transfer was dropped before completing".to_string()))?
            .map_err(Error::transfer)?;
        record_transfer(
            TransferDirection::DeviceToHost,
            literal.size_bytes(),
            start.elapsed().as_micros() as u64,
        );

        T::unflatten(&self.on_host_shape, literal.into_leaves())
    }

    pub fn to_literal(&self) -> Result<Literal> {
        self.to_host()
    }

    /// One buffer per tuple element, sharing this buffer's device allocations.
    pub fn destructure_tuple(&self) -> Result<Vec<LocalBuffer>> {
        let _span = perf_span!("destructure_tuple", device_ordinal = self.device_ordinal);
        let device_buffer = self.device_buffer()?;
        if !self.on_host_shape.is_tuple() {
            return Err(Error::InvalidArgument(format!(
                "destructure_tuple expects a tuple shape, got {}",
                self.on_host_shape
            )));
        }
        Ok(self
            .on_host_shape
            .tuple_shapes()
            .iter()
            .zip(device_buffer.children())
            .map(|(shape, child)| LocalBuffer::new(shape.clone(), Arc::clone(child), Arc::clone(&self.client)))
            .collect())
    }

    /// Drop this handle's reference to its device allocations.
    pub fn delete(&mut self) {
        self.device_buffer = None;
    }

    pub fn is_deleted(&self) -> bool {
        self.device_buffer.is_none()
    }

    pub fn device_buffer(&self) -> Result<&Arc<SharedDeviceBuffer>> {
        self.device_buffer
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("buffer has been deleted".to_string()))
    }

    pub fn as_shaped_buffer(&self) -> Result<ShapedBuffer> {
        Ok(self.device_buffer()?.as_shaped_buffer(&self.on_host_shape))
    }

    /// Block until the buffer's contents are defined on the device.
    pub fn block_host_until_ready(&self) -> Result<()> {
        let device_buffer = self.device_buffer()?;
        let device: &Device = self.client.device(self.device_ordinal)?;
        let stream = device.device_to_host_stream();
        device_buffer.wait_for_definition_events_on_stream(stream);
        Ok(stream.block_host_until_done()?)
    }

    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            shape: self.on_host_shape.clone(),
            device_ordinal: self.device_ordinal,
            is_deleted: self.is_deleted(),
        }
    }
}

fn enqueue_leaf_copies(
    transfer_manager: &TransferManager,
    stream: &Stream,
    tree: &HostBufferTree,
    destination: &ShapedBuffer,
) -> tessera_device::Result<()> {
    transfer_manager.write_tuple_index_tables_async(stream, destination)?;
    for (leaf, memory) in tree.leaves.iter().zip(destination.leaf_buffers()) {
        transfer_manager.transfer_array_to_device_async(stream, Arc::clone(leaf), memory)?;
    }
    Ok(())
}

impl std::fmt::Debug for LocalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("on_host_shape", &self.on_host_shape.to_string())
            .field("device_ordinal", &self.device_ordinal)
            .field("is_deleted", &self.is_deleted())
            .finish()
    }
}
