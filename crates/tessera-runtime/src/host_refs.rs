//! Deferred release of host objects
//!
//! Host values handed to a transfer must stay alive until the device has
//! consumed them, but the stream or worker thread that notices completion
//! should not be the one to free them. [`ManagedHostRefs`] parks its objects
//! in a garbage list when dropped; the client empties that list on the
//! caller's thread at the start of the next transfer.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

pub type HostObject = Box<dyn Any + Send>;

type Garbage = Arc<Mutex<Vec<HostObject>>>;

#[derive(Clone, Default)]
pub struct HostRefManager {
    garbage: Garbage,
}

impl HostRefManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `objects` until the returned guard is dropped.
    pub fn manage_references(&self, objects: Vec<HostObject>) -> ManagedHostRefs {
        ManagedHostRefs {
            objects,
            garbage: Arc::clone(&self.garbage),
        }
    }

    /// Free every parked object on the calling thread; returns how many were freed.
    pub fn collect_garbage(&self) -> usize {
        let garbage = std::mem::take(&mut *self.garbage.lock());
        let count = garbage.len();
        drop(garbage);
        if count > 0 {
            tracing::trace!(count, "host_garbage_collected");
        }
        count
    }

    pub fn pending_garbage(&self) -> usize {
        self.garbage.lock().len()
    }
}

impl std::fmt::Debug for HostRefManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRefManager")
            .field("pending_garbage", &self.pending_garbage())
            .finish()
    }
}

/// Host objects kept alive on behalf of in-flight device work.
pub struct ManagedHostRefs {
    objects: Vec<HostObject>,
    garbage: Garbage,
}

impl ManagedHostRefs {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Drop for ManagedHostRefs {
    fn drop(&mut self) {
        if self.objects.is_empty() {
            return;
        }
        self.garbage.lock().append(&mut self.objects);
    }
}
