//! Reference-counted trees of device allocations
//!
//! A [`SharedDeviceBuffer`] mirrors the on-device shape of a value. Array
//! nodes own their payload allocation; tuple nodes own the index table that
//! points at their children. The tree is shared through `Arc`, so several
//! [`LocalBuffer`](crate::LocalBuffer) handles can reference the same
//! allocations without copying them.
//!
//! ```text
//!            (f32[4], s32[])            <- tuple node: 16-byte index table
//!             /            \
//!        f32[4]            s32[]        <- array nodes: payload
//! ```

use crate::error::{Error, Result};
use crate::event::BufferDefinitionEvent;
use std::sync::Arc;
use tessera_device::{
    OwningDeviceMemory, ScopedShapedBuffer, Shape, ShapeIndex, ShapedBuffer, SharedAllocator, Stream,
    TransferManager,
};

pub struct SharedDeviceBuffer {
    on_device_shape: Shape,
    device_ordinal: usize,
    device_memory: OwningDeviceMemory,
    children: Vec<Arc<SharedDeviceBuffer>>,
    definition_event: Option<Arc<BufferDefinitionEvent>>,
}

impl SharedDeviceBuffer {
    /// Allocate an array node of `on_device_shape`.
    pub fn make_array(
        on_device_shape: Shape,
        transfer_manager: &TransferManager,
        allocator: &SharedAllocator,
        device_ordinal: usize,
        definition_event: Option<Arc<BufferDefinitionEvent>>,
    ) -> Result<Arc<Self>> {
        if on_device_shape.is_tuple() {
            return Err(Error::InvalidArgument(format!(
                "make_array called with tuple shape {on_device_shape}"
            )));
        }
        let size = transfer_manager.byte_size_requirement(&on_device_shape);
        let device_memory = OwningDeviceMemory::allocate(allocator, device_ordinal, size)?;
        Ok(Arc::new(Self {
            on_device_shape,
            device_ordinal,
            device_memory,
            children: Vec::new(),
            definition_event,
        }))
    }

    /// Allocate a tuple node over existing `children`.
    ///
    /// Only the index table is allocated; the children's payloads are shared.
    pub fn make_tuple(
        children: Vec<Arc<SharedDeviceBuffer>>,
        transfer_manager: &TransferManager,
        allocator: &SharedAllocator,
        device_ordinal: usize,
        definition_event: Option<Arc<BufferDefinitionEvent>>,
    ) -> Result<Arc<Self>> {
        if let Some(child) = children.iter().find(|c| c.device_ordinal != device_ordinal) {
            return Err(Error::InvalidArgument(format!(
                "tuple on device {device_ordinal} cannot hold a child on device {}",
                child.device_ordinal
            )));
        }
        let on_device_shape = Shape::tuple(children.iter().map(|c| c.on_device_shape.clone()).collect());
        let size = transfer_manager.byte_size_requirement(&on_device_shape);
        let device_memory = OwningDeviceMemory::allocate(allocator, device_ordinal, size)?;
        Ok(Arc::new(Self {
            on_device_shape,
            device_ordinal,
            device_memory,
            children,
            definition_event,
        }))
    }

    /// Adopt the allocations of an executable's output.
    ///
    /// Allocations are consumed in pre-order, one per node of the on-device
    /// shape. Every node shares `definition_event`.
    pub fn from_scoped_shaped_buffer(
        shaped_buffer: ScopedShapedBuffer,
        definition_event: Option<Arc<BufferDefinitionEvent>>,
    ) -> Result<Arc<Self>> {
        let on_device_shape = shaped_buffer.on_device_shape().clone();
        let device_ordinal = shaped_buffer.device_ordinal();
        let mut allocations = shaped_buffer.into_owned_buffers().into_iter();
        let tree = Self::adopt(&on_device_shape, device_ordinal, &mut allocations, &definition_event)?;
        if allocations.next().is_some() {
            return Err(Error::Internal(format!(
                "shaped buffer has more allocations than {on_device_shape} has nodes"
            )));
        }
        Ok(tree)
    }

    fn adopt(
        shape: &Shape,
        device_ordinal: usize,
        allocations: &mut impl Iterator<Item = OwningDeviceMemory>,
        definition_event: &Option<Arc<BufferDefinitionEvent>>,
    ) -> Result<Arc<Self>> {
        let device_memory = allocations
            .next()
            .ok_or_else(|| Error::Internal(format!("shaped buffer ran out of allocations at {shape}")))?;
        let children = shape
            .tuple_shapes()
            .iter()
            .map(|element| Self::adopt(element, device_ordinal, allocations, definition_event))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Self {
            on_device_shape: shape.clone(),
            device_ordinal,
            device_memory,
            children,
            definition_event: definition_event.clone(),
        }))
    }

    /// Non-owning view of the tree, paired with `on_host_shape`.
    pub fn as_shaped_buffer(&self, on_host_shape: &Shape) -> ShapedBuffer {
        let mut shaped = ShapedBuffer::new(on_host_shape.clone(), self.on_device_shape.clone(), self.device_ordinal);
        self.populate(ShapeIndex::root(), &mut shaped);
        shaped
    }

    fn populate(&self, index: ShapeIndex, shaped: &mut ShapedBuffer) {
        for (i, child) in self.children.iter().enumerate() {
            child.populate(index.child(i), shaped);
        }
        shaped.set_buffer(&index, self.device_memory.memory());
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn device_memory(&self) -> &OwningDeviceMemory {
        &self.device_memory
    }

    pub fn children(&self) -> &[Arc<SharedDeviceBuffer>] {
        &self.children
    }

    pub fn definition_event(&self) -> Option<&Arc<BufferDefinitionEvent>> {
        self.definition_event.as_ref()
    }

    /// Add every definition event in this subtree to `events`.
    pub fn collect_definition_events(&self, events: &mut DefinitionEventSet) {
        if let Some(event) = &self.definition_event {
            events.insert(Arc::clone(event));
        }
        for child in &self.children {
            child.collect_definition_events(events);
        }
    }

    /// Order `stream` after every definition event in this subtree.
    pub fn wait_for_definition_events_on_stream(&self, stream: &Stream) {
        let mut events = DefinitionEventSet::new();
        self.collect_definition_events(&mut events);
        for event in &events {
            event.wait_for_event_on_stream(stream);
        }
    }
}

impl std::fmt::Debug for SharedDeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDeviceBuffer")
            .field("on_device_shape", &self.on_device_shape.to_string())
            .field("device_memory", &self.device_memory.memory())
            .field("children", &self.children.len())
            .field("has_definition_event", &self.definition_event.is_some())
            .finish()
    }
}

/// Definition events deduplicated by identity, in insertion order.
#[derive(Debug, Default)]
pub struct DefinitionEventSet {
    events: Vec<Arc<BufferDefinitionEvent>>,
}

impl DefinitionEventSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// False if the event was already present.
    pub fn insert(&mut self, event: Arc<BufferDefinitionEvent>) -> bool {
        if self.events.iter().any(|e| Arc::ptr_eq(e, &event)) {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<BufferDefinitionEvent>> {
        self.events.iter()
    }
}

impl<'a> IntoIterator for &'a DefinitionEventSet {
    type Item = &'a Arc<BufferDefinitionEvent>;
    type IntoIter = std::slice::Iter<'a, Arc<BufferDefinitionEvent>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
