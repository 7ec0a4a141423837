//! Per-device stream executor
//!
//! A [`StreamExecutor`] owns one device's memory and knows every stream
//! created on it. Memory regions are reference-counted: deallocation drops
//! the executor's reference, while operations already enqueued on a stream
//! hold their own until they have run.

use crate::error::{DeviceError, Result};
use crate::memory::{DeviceMemory, MemoryRegion};
use crate::stream::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Snapshot of one executor's memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub capacity: usize,
    pub in_use: usize,
    pub peak: usize,
    pub live_allocations: usize,
    pub total_allocations: u64,
    pub total_deallocations: u64,
}

struct MemoryState {
    regions: HashMap<u64, MemoryRegion>,
    next_id: u64,
    in_use: usize,
    peak: usize,
    total_allocations: u64,
    total_deallocations: u64,
}

pub struct StreamExecutor {
    ordinal: usize,
    platform_name: String,
    capacity: usize,
    memory: Mutex<MemoryState>,
    streams: Mutex<Vec<Weak<Stream>>>,
}

impl StreamExecutor {
    pub fn new(ordinal: usize, platform_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            ordinal,
            platform_name: platform_name.into(),
            capacity,
            memory: Mutex::new(MemoryState {
                regions: HashMap::new(),
                next_id: 1,
                in_use: 0,
                peak: 0,
                total_allocations: 0,
                total_deallocations: 0,
            }),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocate(&self, size: usize) -> Result<DeviceMemory> {
        if size == 0 {
            return Ok(DeviceMemory::null(self.ordinal));
        }
        let mut state = self.memory.lock();
        let available = self.capacity - state.in_use;
        if size > available {
            return Err(DeviceError::OutOfMemory {
                ordinal: self.ordinal,
                requested: size,
                available,
            });
        }
        let id = state.next_id;
        state.next_id += 1;
        state.regions.insert(id, Arc::new(RwLock::new(vec![0; size])));
        state.in_use += size;
        state.peak = state.peak.max(state.in_use);
        state.total_allocations += 1;
        tracing::trace!(device_ordinal = self.ordinal, id, size, "device_allocation");
        Ok(DeviceMemory::new(self.ordinal, id, size))
    }

    pub fn deallocate(&self, memory: DeviceMemory) -> Result<()> {
        if memory.is_null() {
            return Ok(());
        }
        if memory.ordinal() != self.ordinal {
            return Err(DeviceError::InvalidMemory(format!(
                "{memory} deallocated on device {}",
                self.ordinal
            )));
        }
        let mut state = self.memory.lock();
        if state.regions.remove(&memory.id()).is_none() {
            return Err(DeviceError::InvalidMemory(format!("{memory} is not allocated")));
        }
        state.in_use -= memory.size();
        state.total_deallocations += 1;
        tracing::trace!(device_ordinal = self.ordinal, id = memory.id(), "device_deallocation");
        Ok(())
    }

    /// True while `memory` has not been deallocated.
    pub fn is_allocated(&self, memory: DeviceMemory) -> bool {
        memory.is_null() || self.memory.lock().regions.contains_key(&memory.id())
    }

    pub(crate) fn resolve(&self, memory: DeviceMemory) -> Result<MemoryRegion> {
        if memory.ordinal() != self.ordinal {
            return Err(DeviceError::InvalidMemory(format!(
                "{memory} used on device {}",
                self.ordinal
            )));
        }
        if memory.is_null() {
            return Ok(Arc::new(RwLock::new(Vec::new())));
        }
        let state = self.memory.lock();
        match state.regions.get(&memory.id()) {
            Some(region) if region.read().len() == memory.size() => Ok(Arc::clone(region)),
            Some(_) => Err(DeviceError::InvalidMemory(format!("{memory} has the wrong size"))),
            None => Err(DeviceError::InvalidMemory(format!("{memory} is not allocated"))),
        }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let state = self.memory.lock();
        MemoryUsage {
            capacity: self.capacity,
            in_use: state.in_use,
            peak: state.peak,
            live_allocations: state.regions.len(),
            total_allocations: state.total_allocations,
            total_deallocations: state.total_deallocations,
        }
    }

    pub(crate) fn register_stream(&self, stream: &Arc<Stream>) {
        let mut streams = self.streams.lock();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(Arc::downgrade(stream));
    }

    /// Number of live streams on this device.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().iter().filter(|s| s.strong_count() > 0).count()
    }

    /// Block until every live stream has drained; false if any stream has failed.
    pub fn synchronize_all_activity(&self) -> bool {
        let streams: Vec<Arc<Stream>> = self.streams.lock().iter().filter_map(Weak::upgrade).collect();
        let mut ok = true;
        for stream in &streams {
            if let Err(e) = stream.block_host_until_done() {
                tracing::debug!(stream = %stream.id(), error = %e, "stream failed during synchronization");
                ok = false;
            }
        }
        ok
    }
}

impl std::fmt::Debug for StreamExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamExecutor")
            .field("ordinal", &self.ordinal)
            .field("platform_name", &self.platform_name)
            .field("usage", &self.memory_usage())
            .finish()
    }
}
