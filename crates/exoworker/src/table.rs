//! # Local Object Table
//!
//! The worker's store of live values. Callers on the other side of the boundary only ever see
//! [`Handle`]s; the values stay here until removed, released, or the worker dies.
//!
//! ## Invariants
//! - **Unique ids**: ids come from an atomic counter, never from the table size, so an id is
//!   never reissued even after removals.
//! - **Owner-scoped**: a handle minted by another table is rejected even if its id collides
//!   with one of ours.
//! - **Single lock**: every access goes through one mutex; the endpoint may touch the table from
//!   many tasks at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use exowire::Handle;
use exowire::OwnerId;
use exowire::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Absent from the table, or minted by a different table.
    UnknownHandle(Handle),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHandle(h) => write!(f, "unknown handle {}", h),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub struct ObjectTable {
    owner: OwnerId,
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Value>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::with_owner(OwnerId::random())
    }

    pub fn with_owner(owner: OwnerId) -> Self {
        Self {
            owner,
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Stores `value` under a fresh handle.
    pub fn wrap(&self, value: Value) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, value);
        Handle { owner: self.owner, id }
    }

    pub fn get(&self, handle: Handle) -> Result<Value> {
        self.check_owner(handle)?;
        self.lock().get(&handle.id).cloned().ok_or(Error::UnknownHandle(handle))
    }

    /// Resolves every handle, in order. Fails on the first unknown one.
    pub fn get_all(&self, handles: &[Handle]) -> Result<Vec<Value>> {
        for handle in handles {
            self.check_owner(*handle)?;
        }
        let entries = self.lock();
        handles
            .iter()
            .map(|h| entries.get(&h.id).cloned().ok_or(Error::UnknownHandle(*h)))
            .collect()
    }

    /// Re-wraps the value behind `handle` under a new handle. Both stay valid.
    pub fn copy(&self, handle: Handle) -> Result<Handle> {
        let value = self.get(handle)?;
        Ok(self.wrap(value))
    }

    pub fn remove(&self, handle: Handle) -> Result<Value> {
        self.check_owner(handle)?;
        self.lock().remove(&handle.id).ok_or(Error::UnknownHandle(handle))
    }

    /// Drops every entry. Returns how many were live.
    ///
    /// The counter is not reset, so handles issued before the release stay unknown forever.
    pub fn release_all(&self) -> usize {
        let mut entries = self.lock();
        let released = entries.len();
        entries.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_owner(&self, handle: Handle) -> Result<()> {
        if handle.owner != self.owner {
            return Err(Error::UnknownHandle(handle));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Value>> {
        // Values are plain data, so a panic mid-update cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
