//! The advisory lock table: which connection is editing which record.
//!
//! This is a pure data structure. It is not synchronized on its own — the
//! coordinator in `state.rs` wraps it in a mutex, because the race that
//! matters is the compound scan-then-insert in `try_acquire`, not individual
//! map accesses.

use std::collections::HashMap;

/// Maps connection id -> locked record id. A connection holds zero or one
/// lock; a record is held by zero or one connection. Lives in memory only,
/// so a daemon restart clears every lock.
#[derive(Debug, Default)]
pub struct LockTable {
    held: HashMap<String, i64>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to lock `record_id` for `conn_id`. Fails if any connection
    /// (the caller included) already holds that record. On success any lock
    /// the caller previously held is silently superseded.
    pub fn try_acquire(&mut self, conn_id: &str, record_id: i64) -> bool {
        if self.held.values().any(|held| *held == record_id) {
            return false;
        }
        self.held.insert(conn_id.to_string(), record_id);
        true
    }

    /// Drops the caller's lock, returning the record id it covered.
    pub fn release(&mut self, conn_id: &str) -> Option<i64> {
        self.held.remove(conn_id)
    }

    /// All currently locked record ids, sorted so clients render a stable
    /// list.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.held.values().copied().collect();
        ids.sort_unstable();
        ids
    }
}
