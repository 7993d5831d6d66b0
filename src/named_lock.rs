//! Locks looked up by name.
//!
//! The table hands out handles to one mutex per name.
//! Handles for the same name share the mutex, different names never contend.
//! An entry lives as long as someone holds a handle to it.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::trace;

#[derive(Debug)]
struct Entry {
    mutex: Arc<AsyncMutex<()>>,

    /// Live handles for this name.
    holders: usize,
}

type Table = HashMap<String, Entry>;

/// A registry of named locks.
///
/// Cloning gives another view of the same registry.
#[derive(Debug, Clone, Default)]
pub struct NamedLocks {
    table: Arc<Mutex<Table>>,
}

impl NamedLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        // The table is consistent after every statement,
        // so a panic elsewhere does not make it unusable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a handle to the lock for the given name.
    /// The lock is created if nobody holds one for this name.
    pub fn acquire(&self, name: &str) -> NamedLock {
        let mut table = self.table();

        let entry = table.entry(name.to_owned()).or_insert_with(|| {
            trace!(%name, "Creating named lock");
            Entry {
                mutex: Arc::default(),
                holders: 0,
            }
        });
        entry.holders += 1;

        NamedLock {
            name: name.to_owned(),
            mutex: entry.mutex.clone(),
            registry: self.clone(),
        }
    }

    fn release(&self, name: &str) {
        let mut table = self.table();

        let Some(entry) = table.get_mut(name) else {
            return;
        };

        entry.holders -= 1;
        if entry.holders == 0 {
            trace!(%name, "Removing named lock");
            table.remove(name);
        }
    }

    /// How many names currently have a lock.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// True if no lock is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A handle to one named lock.
/// Dropping the last handle for a name removes the lock from its registry.
pub struct NamedLock {
    name: String,
    mutex: Arc<AsyncMutex<()>>,
    registry: NamedLocks,
}

impl NamedLock {
    /// The name this lock was acquired for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive access.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// True if both handles refer to the same underlying lock.
    pub fn same_lock(&self, other: &NamedLock) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }
}

impl Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock").field("name", &self.name).finish()
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}
