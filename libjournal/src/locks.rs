//! In-process concurrency control.
//!
//! [`VolumeLocks`] serialises requests that carry the same request name or
//! volume id.  Acquisition never blocks; a caller that loses returns
//! "operation already exists" and lets the orchestrator retry.
//!
//! [`OperationLock`] is a coarser per-volume lock that lets compatible
//! operations (several clones, several restores) overlap while rejecting
//! conflicting ones:
//!
//! | Acquire | Rejected while running |
//! |---|---|
//! | snapshot create | none |
//! | clone | expand |
//! | delete | expand, restore |
//! | restore | delete |
//! | expand | delete, clone, snapshot create |

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{JournalError, Result};

/// Message returned when a volume id is already locked.
pub fn volume_operation_already_exists(id: &str) -> String {
    format!("an operation with the given Volume ID {id} already exists")
}

/// Message returned when a snapshot id is already locked.
pub fn snapshot_operation_already_exists(id: &str) -> String {
    format!("an operation with the given Snapshot ID {id} already exists")
}

// ---------------------------------------------------------------------------
// VolumeLocks
// ---------------------------------------------------------------------------

/// Set of ids with an operation in flight.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly when `id` was not locked.
    pub fn try_acquire(&self, id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.insert(id.to_owned())
    }

    pub fn release(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(id);
    }

    /// Acquire `id` for the lifetime of the returned guard.
    pub fn try_lock<'a>(&'a self, id: &str) -> Option<VolumeLockGuard<'a>> {
        self.try_acquire(id).then(|| VolumeLockGuard {
            locks: self,
            id: id.to_owned(),
        })
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Releases its id on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct VolumeLockGuard<'a> {
    locks: &'a VolumeLocks,
    id: String,
}

impl VolumeLockGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.id);
    }
}

// ---------------------------------------------------------------------------
// OperationLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Snapshot create with the volume as source.
    SnapshotCreate,
    Clone,
    Delete,
    Restore,
    Expand,
}

impl Operation {
    /// Operations that must not be running when `self` is acquired.
    fn blocked_by(self) -> &'static [Operation] {
        use Operation::*;
        match self {
            SnapshotCreate => &[],
            Clone => &[Expand],
            Delete => &[Expand, Restore],
            Restore => &[Delete],
            Expand => &[Delete, Clone, SnapshotCreate],
        }
    }

    /// Exclusive operations hold a counter of exactly one.
    fn is_exclusive(self) -> bool {
        matches!(self, Operation::Delete | Operation::Expand)
    }

    fn article_name(self) -> &'static str {
        match self {
            Operation::SnapshotCreate => "a Create",
            Operation::Clone => "a Clone",
            Operation::Delete => "a Delete",
            Operation::Restore => "a Restore",
            Operation::Expand => "an Expand",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::SnapshotCreate => "create",
            Operation::Clone => "clone",
            Operation::Delete => "delete",
            Operation::Restore => "restore",
            Operation::Expand => "expand",
        };
        f.write_str(s)
    }
}

/// Per-volume, per-operation reference counts.
#[derive(Debug, Default)]
pub struct OperationLock {
    locks: Mutex<HashMap<Operation, HashMap<String, usize>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, op: Operation, volume_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        for blocker in op.blocked_by() {
            if locks
                .get(blocker)
                .is_some_and(|ids| ids.contains_key(volume_id))
            {
                return Err(JournalError::OperationConflict(format!(
                    "{} operation with given id {volume_id} already exists",
                    blocker.article_name()
                )));
            }
        }

        let count = locks
            .entry(op)
            .or_default()
            .entry(volume_id.to_owned())
            .or_insert(0);
        if op.is_exclusive() {
            *count = 1;
        } else {
            *count += 1;
        }
        debug!(%op, %volume_id, count = *count, "operation lock acquired");
        Ok(())
    }

    fn release(&self, op: Operation, volume_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(ids) = locks.get_mut(&op) else {
            return;
        };
        if let Some(count) = ids.get_mut(volume_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ids.remove(volume_id);
            }
        }
    }

    pub fn get_snapshot_create_lock(&self, volume_id: &str) -> Result<()> {
        self.try_acquire(Operation::SnapshotCreate, volume_id)
    }

    pub fn get_clone_lock(&self, volume_id: &str) -> Result<()> {
        self.try_acquire(Operation::Clone, volume_id)
    }

    /// Fails while an expand or restore runs on `volume_id`.
    pub fn get_delete_lock(&self, volume_id: &str) -> Result<()> {
        self.try_acquire(Operation::Delete, volume_id)
    }

    /// Fails while a delete runs on `volume_id`.
    pub fn get_restore_lock(&self, volume_id: &str) -> Result<()> {
        self.try_acquire(Operation::Restore, volume_id)
    }

    /// Fails while a delete, clone or snapshot create runs on `volume_id`.
    pub fn get_expand_lock(&self, volume_id: &str) -> Result<()> {
        self.try_acquire(Operation::Expand, volume_id)
    }

    pub fn release_snapshot_create_lock(&self, volume_id: &str) {
        self.release(Operation::SnapshotCreate, volume_id);
    }

    pub fn release_clone_lock(&self, volume_id: &str) {
        self.release(Operation::Clone, volume_id);
    }

    pub fn release_delete_lock(&self, volume_id: &str) {
        self.release(Operation::Delete, volume_id);
    }

    pub fn release_restore_lock(&self, volume_id: &str) {
        self.release(Operation::Restore, volume_id);
    }

    pub fn release_expand_lock(&self, volume_id: &str) {
        self.release(Operation::Expand, volume_id);
    }

    /// Acquire `op` on `volume_id` for the lifetime of the returned guard.
    pub fn lock<'a>(&'a self, op: Operation, volume_id: &str) -> Result<OperationLockGuard<'a>> {
        self.try_acquire(op, volume_id)?;
        Ok(OperationLockGuard {
            locks: self,
            op,
            volume_id: volume_id.to_owned(),
        })
    }
}

/// Releases one reference of its operation on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct OperationLockGuard<'a> {
    locks: &'a OperationLock,
    op: Operation,
    volume_id: String,
}

impl Drop for OperationLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.op, &self.volume_id);
    }
}
