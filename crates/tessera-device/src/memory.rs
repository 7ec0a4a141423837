//! Device memory handles and the allocator interface
//!
//! [`DeviceMemory`] is a plain, copyable handle. Ownership lives in
//! [`OwningDeviceMemory`], which hands its region back to the allocator when
//! dropped. The executor keeps the backing bytes of a region alive for every
//! stream operation already enqueued against it, so releasing a handle while
//! device work is in flight never invalidates that work.

use crate::error::Result;
use crate::platform::Platform;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Backing bytes of one allocation.
pub(crate) type MemoryRegion = Arc<RwLock<Vec<u8>>>;

/// Opaque handle to a region of device memory.
///
/// Id 0 is the null allocation used for zero-byte regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMemory {
    ordinal: usize,
    id: u64,
    size: usize,
}

impl DeviceMemory {
    pub const fn new(ordinal: usize, id: u64, size: usize) -> Self {
        Self { ordinal, id, size }
    }

    pub const fn null(ordinal: usize) -> Self {
        Self { ordinal, id: 0, size: 0 }
    }

    pub const fn is_null(&self) -> bool {
        self.id == 0
    }

    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}:mem{}({}B)", self.ordinal, self.id, self.size)
    }
}

/// Source of device memory for every ordinal of a platform.
pub trait DeviceMemoryAllocator: Send + Sync {
    /// Allocate `size` bytes on `ordinal`. Zero-byte requests return the null handle.
    fn allocate(&self, ordinal: usize, size: usize) -> Result<DeviceMemory>;

    fn deallocate(&self, ordinal: usize, memory: DeviceMemory) -> Result<()>;

    fn platform_name(&self) -> &str;
}

pub type SharedAllocator = Arc<dyn DeviceMemoryAllocator>;

/// Allocator backed directly by the platform's stream executors.
#[derive(Clone)]
pub struct StreamExecutorAllocator {
    platform: Arc<Platform>,
}

impl StreamExecutorAllocator {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self { platform }
    }
}

impl DeviceMemoryAllocator for StreamExecutorAllocator {
    fn allocate(&self, ordinal: usize, size: usize) -> Result<DeviceMemory> {
        self.platform.executor(ordinal)?.allocate(size)
    }

    fn deallocate(&self, ordinal: usize, memory: DeviceMemory) -> Result<()> {
        self.platform.executor(ordinal)?.deallocate(memory)
    }

    fn platform_name(&self) -> &str {
        self.platform.name()
    }
}

/// Device memory released through its allocator on drop.
pub struct OwningDeviceMemory {
    memory: DeviceMemory,
    allocator: Option<SharedAllocator>,
}

impl OwningDeviceMemory {
    pub fn new(memory: DeviceMemory, allocator: SharedAllocator) -> Self {
        Self {
            memory,
            allocator: Some(allocator),
        }
    }

    /// Allocate and take ownership in one step.
    pub fn allocate(allocator: &SharedAllocator, ordinal: usize, size: usize) -> Result<Self> {
        let memory = allocator.allocate(ordinal, size)?;
        Ok(Self::new(memory, Arc::clone(allocator)))
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    pub fn is_null(&self) -> bool {
        self.memory.is_null()
    }

    pub fn ordinal(&self) -> usize {
        self.memory.ordinal()
    }

    /// Give up ownership without deallocating.
    pub fn release(mut self) -> DeviceMemory {
        self.allocator = None;
        self.memory
    }
}

impl fmt::Debug for OwningDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningDeviceMemory")
            .field("memory", &self.memory)
            .field("owned", &self.allocator.is_some())
            .finish()
    }
}

impl Drop for OwningDeviceMemory {
    fn drop(&mut self) {
        let Some(allocator) = self.allocator.take() else {
            return;
        };
        if self.memory.is_null() {
            return;
        }
        if let Err(e) = allocator.deallocate(self.memory.ordinal(), self.memory) {
            tracing::error!(memory = %self.memory, error = %e, "failed to release device memory");
        }
    }
}
