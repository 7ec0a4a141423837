//! Host↔device transfer manager
//!
//! Picks on-device layouts, sizes and allocates shaped buffers, and issues
//! the stream operations that move literals to and from device memory.
//!
//! Tuple nodes on the device hold an index table: one 8-byte little-endian
//! entry per element naming the element's allocation.
//!
//! ```text
//! (f32[2], s32[])   root table: [id(f32[2]) | id(s32[])]
//!                   leaf {0}:   8 bytes of f32 payload
//!                   leaf {1}:   4 bytes of s32 payload
//! ```

use crate::error::{DeviceError, Result};
use crate::literal::Literal;
use crate::memory::{DeviceMemory, SharedAllocator};
use crate::shape::{Shape, ShapeIndex};
use crate::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};

/// Size of one tuple index table entry.
pub const POINTER_SIZE: usize = 8;

/// Bytes of one literal leaf, kept alive until its copy has run.
struct LeafBytes(Arc<Literal>);

impl AsRef<[u8]> for LeafBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.data().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferManager;

impl TransferManager {
    pub fn new() -> Self {
        Self
    }

    /// On-device shape for a host shape: dense, row-major layouts everywhere.
    pub fn choose_compact_layout_for_shape(&self, host_shape: &Shape) -> Shape {
        host_shape.without_layouts().with_default_layouts()
    }

    /// Bytes of the allocation backing one node of `shape`.
    pub fn byte_size_requirement(&self, shape: &Shape) -> usize {
        match shape {
            Shape::Array(array) => array.byte_size(),
            Shape::Tuple(elements) => elements.len() * POINTER_SIZE,
        }
    }

    /// Allocate one region per node of the compact device shape of `on_host_shape`.
    ///
    /// Allocations made before a failure are released.
    pub fn allocate_scoped_shaped_buffer(
        &self,
        on_host_shape: &Shape,
        allocator: &SharedAllocator,
        device_ordinal: usize,
    ) -> Result<ScopedShapedBuffer> {
        let on_device_shape = self.choose_compact_layout_for_shape(on_host_shape);
        let sizes: Vec<(ShapeIndex, usize)> = on_device_shape
            .subshapes()
            .into_iter()
            .map(|(index, subshape)| (index, self.byte_size_requirement(subshape)))
            .collect();
        let mut scoped = ScopedShapedBuffer::new(
            ShapedBuffer::new(on_host_shape.clone(), on_device_shape, device_ordinal),
            Arc::clone(allocator),
        );
        for (index, size) in sizes {
            let memory = allocator.allocate(device_ordinal, size)?;
            scoped.set_buffer(&index, memory);
        }
        Ok(scoped)
    }

    fn index_table(&self, buffer: &ShapedBuffer, index: &ShapeIndex, element_count: usize) -> Result<Vec<u8>> {
        let mut table = Vec::with_capacity(element_count * POINTER_SIZE);
        for i in 0..element_count {
            let child = buffer
                .buffer(&index.child(i))
                .ok_or_else(|| DeviceError::Internal(format!("no allocation for tuple element {}", index.child(i))))?;
            table.extend_from_slice(&child.id().to_le_bytes());
        }
        Ok(table)
    }

    fn write_index_table(&self, stream: &Stream, buffer: &ShapedBuffer, index: &ShapeIndex, count: usize) -> Result<()> {
        let table = self.index_table(buffer, index, count)?;
        let memory = buffer
            .buffer(index)
            .ok_or_else(|| DeviceError::Internal(format!("no allocation for tuple {index}")))?;
        stream.then_memcpy_to_device(memory, table)?;
        Ok(())
    }

    /// Write the index table of every tuple node in `buffer`.
    pub fn write_tuple_index_tables_async(&self, stream: &Stream, buffer: &ShapedBuffer) -> Result<()> {
        for (index, subshape) in buffer.on_device_shape().subshapes() {
            if let Shape::Tuple(elements) = subshape {
                self.write_index_table(stream, buffer, &index, elements.len())?;
            }
        }
        Ok(())
    }

    /// Write only the root's index table; a no-op for arrays.
    pub fn write_root_tuple_index_table(&self, stream: &Stream, buffer: &ShapedBuffer) -> Result<()> {
        match buffer.on_device_shape() {
            Shape::Tuple(elements) => self.write_index_table(stream, buffer, &ShapeIndex::root(), elements.len()),
            Shape::Array(_) => Ok(()),
        }
    }

    /// Copy one array literal into `destination`.
    pub fn transfer_array_to_device_async(
        &self,
        stream: &Stream,
        literal: Arc<Literal>,
        destination: DeviceMemory,
    ) -> Result<()> {
        if literal.is_tuple() {
            return Err(DeviceError::InvalidArgument(format!(
                "expected an array literal, got {}",
                literal.shape()
            )));
        }
        stream.then_memcpy_to_device(destination, LeafBytes(literal))?;
        Ok(())
    }

    /// Copy a whole literal, index tables included, into `destination`.
    pub fn transfer_literal_to_device_async(
        &self,
        stream: &Stream,
        literal: &Literal,
        destination: &ShapedBuffer,
    ) -> Result<()> {
        let shape = literal.shape();
        if !shape.compatible(destination.on_host_shape()) {
            return Err(DeviceError::shape_mismatch(destination.on_host_shape(), shape));
        }
        self.write_tuple_index_tables_async(stream, destination)?;
        let leaves = literal.leaves();
        for (leaf, memory) in leaves.into_iter().zip(destination.leaf_buffers()) {
            self.transfer_array_to_device_async(stream, Arc::new(leaf.clone()), memory)?;
        }
        Ok(())
    }

    /// Read `source` back into a literal of its host shape.
    ///
    /// `callback` runs on the stream's thread once the copy completes, or with
    /// the stream's error if it has failed by then.
    pub fn transfer_literal_from_device<F>(&self, stream: &Stream, source: &ShapedBuffer, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Literal>) + Send + 'static,
    {
        let host_shape = source.on_host_shape().clone();
        let leaf_shapes: Vec<_> = host_shape.leaf_shapes().into_iter().cloned().collect();
        let leaf_buffers = source.leaf_buffers();
        if leaf_shapes.len() != leaf_buffers.len() {
            return Err(DeviceError::Internal(format!(
                "host shape {host_shape} has {} leaves but the device buffer has {}",
                leaf_shapes.len(),
                leaf_buffers.len()
            )));
        }

        let staging: Arc<Mutex<Vec<Option<Vec<u8>>>>> = Arc::new(Mutex::new(vec![None; leaf_buffers.len()]));
        for (slot, memory) in leaf_buffers.into_iter().enumerate() {
            let staging = Arc::clone(&staging);
            stream.then_memcpy_from_device(memory, move |bytes| {
                staging.lock()[slot] = Some(bytes.to_vec());
            })?;
        }

        stream.then_do_host_callback_with_status(move |status| {
            let result = status.and_then(|()| {
                let bytes = std::mem::take(&mut *staging.lock());
                let leaves = leaf_shapes
                    .into_iter()
                    .zip(bytes)
                    .map(|(shape, data)| {
                        let data = data.ok_or_else(|| DeviceError::Internal("device-to-host copy did not run".to_string()))?;
                        Literal::from_bytes(shape, data)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Literal::from_leaves(&host_shape, leaves)
            });
            callback(result);
        });
        Ok(())
    }

    /// Blocking read of one allocation's raw bytes.
    pub fn read_device_memory(&self, stream: &Stream, memory: DeviceMemory) -> Result<Vec<u8>> {
        let (sender, receiver) = mpsc::sync_channel(1);
        stream.then_memcpy_from_device(memory, move |bytes| {
            let _ = sender.send(bytes.to_vec());
        })?;
        stream.block_host_until_done()?;
        receiver
            .recv()
            .map_err(|_| DeviceError::Internal(format!("read of {memory} did not complete")))
    }
}
