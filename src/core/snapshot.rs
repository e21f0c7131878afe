//! Copy-on-write cell for lists that may be swapped at runtime.

use std::sync::{Arc, RwLock};

/// Holds the current version of a read-mostly value.
///
/// Readers clone the inner `Arc` under a short read lock and then work on
/// their own snapshot, so a concurrent [`ListSnapshot::store`] never changes a
/// set while a lookup is using it.
#[derive(Debug)]
pub struct ListSnapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> ListSnapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<T> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the value; readers holding an older snapshot keep it
    pub fn store(&self, value: T) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(value);
    }
}
