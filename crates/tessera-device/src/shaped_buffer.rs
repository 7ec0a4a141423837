//! Trees of device allocations laid out as a shape
//!
//! A [`ShapedBuffer`] is a non-owning, pre-order view: one [`DeviceMemory`]
//! per subshape, where tuple nodes hold their index table and array nodes
//! their payload. [`ScopedShapedBuffer`] owns the same allocations and
//! returns them to the allocator when dropped.

use crate::memory::{DeviceMemory, OwningDeviceMemory, SharedAllocator};
use crate::shape::{Shape, ShapeIndex};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedBuffer {
    on_host_shape: Shape,
    on_device_shape: Shape,
    device_ordinal: usize,
    buffers: Vec<(ShapeIndex, DeviceMemory)>,
}

impl ShapedBuffer {
    /// A view with every node set to the null allocation.
    pub fn new(on_host_shape: Shape, on_device_shape: Shape, device_ordinal: usize) -> Self {
        let buffers = on_device_shape
            .subshapes()
            .into_iter()
            .map(|(index, _)| (index, DeviceMemory::null(device_ordinal)))
            .collect();
        Self {
            on_host_shape,
            on_device_shape,
            device_ordinal,
            buffers,
        }
    }

    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    /// Set the allocation at `index`; false if the shape has no such node.
    pub fn set_buffer(&mut self, index: &ShapeIndex, memory: DeviceMemory) -> bool {
        match self.buffers.iter_mut().find(|(i, _)| i == index) {
            Some((_, slot)) => {
                *slot = memory;
                true
            }
            None => false,
        }
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<DeviceMemory> {
        self.buffers.iter().find(|(i, _)| i == index).map(|(_, m)| *m)
    }

    pub fn root_buffer(&self) -> DeviceMemory {
        self.buffers
            .first()
            .map_or(DeviceMemory::null(self.device_ordinal), |(_, m)| *m)
    }

    /// Every node's allocation in pre-order.
    pub fn buffers(&self) -> &[(ShapeIndex, DeviceMemory)] {
        &self.buffers
    }

    /// Allocations of the array nodes in depth-first order.
    pub fn leaf_buffers(&self) -> Vec<DeviceMemory> {
        self.buffers
            .iter()
            .filter(|(index, _)| self.on_device_shape.subshape(index).is_some_and(Shape::is_array))
            .map(|(_, memory)| *memory)
            .collect()
    }
}

impl fmt::Display for ShapedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ShapedBuffer({}), on-device shape={}:",
            self.device_ordinal, self.on_device_shape
        )?;
        for (index, memory) in &self.buffers {
            writeln!(f, "  {index}: {memory}")?;
        }
        Ok(())
    }
}

/// A [`ShapedBuffer`] that owns its allocations.
pub struct ScopedShapedBuffer {
    buffer: ShapedBuffer,
    allocator: SharedAllocator,
}

impl ScopedShapedBuffer {
    pub fn new(buffer: ShapedBuffer, allocator: SharedAllocator) -> Self {
        Self { buffer, allocator }
    }

    pub fn as_shaped_buffer(&self) -> &ShapedBuffer {
        &self.buffer
    }

    pub fn on_host_shape(&self) -> &Shape {
        self.buffer.on_host_shape()
    }

    pub fn on_device_shape(&self) -> &Shape {
        self.buffer.on_device_shape()
    }

    pub fn device_ordinal(&self) -> usize {
        self.buffer.device_ordinal()
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    pub(crate) fn set_buffer(&mut self, index: &ShapeIndex, memory: DeviceMemory) -> bool {
        self.buffer.set_buffer(index, memory)
    }

    /// Hand ownership of every allocation to the caller as a plain view.
    pub fn release(mut self) -> ShapedBuffer {
        let buffers = std::mem::take(&mut self.buffer.buffers);
        ShapedBuffer {
            buffers,
            ..self.buffer.clone()
        }
    }

    /// Every allocation in pre-order, each owning its memory.
    pub fn into_owned_buffers(self) -> Vec<OwningDeviceMemory> {
        let allocator = self.allocator.clone();
        self.release()
            .buffers
            .into_iter()
            .map(|(_, memory)| OwningDeviceMemory::new(memory, allocator.clone()))
            .collect()
    }
}

impl fmt::Debug for ScopedShapedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedShapedBuffer").field("buffer", &self.buffer).finish()
    }
}

impl Drop for ScopedShapedBuffer {
    fn drop(&mut self) {
        let ordinal = self.buffer.device_ordinal;
        for (index, memory) in self.buffer.buffers.drain(..) {
            if memory.is_null() {
                continue;
            }
            if let Err(e) = self.allocator.deallocate(ordinal, memory) {
                tracing::error!(index = %index, memory = %memory, error = %e, "failed to release shaped buffer");
            }
        }
    }
}
