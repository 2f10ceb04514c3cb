//! The coordinator: shared state and every operation the daemon performs on
//! behalf of a connection.
//!
//! One `SharedState` is constructed at startup and lives until shutdown. A
//! single mutex around the lock table serializes every lock acquisition,
//! every lock release, and every store mutation together with the
//! notifications they emit. The race that matters is the compound
//! scan-then-insert in `take_lock`: two connections asking for the same free
//! record must never both observe it unheld. Serializing store mutations
//! behind the same guard also keeps broadcasts consistent — an `update`
//! frame is never interleaved with a stale `all_locks` frame.

use roster_daemon_protocol::{ErrorInfo, HealthInfo, Record, ServerMessage, PROTOCOL_VERSION};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::hub::ClientHub;
use crate::locks::LockTable;
use crate::store::{Store, StoreError};

pub struct SharedState {
    store: Store,
    hub: ClientHub,
    locks: Mutex<LockTable>,
}

impl SharedState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            hub: ClientHub::new(),
            locks: Mutex::new(LockTable::new()),
        }
    }

    pub fn hub(&self) -> &ClientHub {
        &self.hub
    }

    /// Full resync for a connection that just became active. Reconnects take
    /// this same path under a fresh connection id; there is no incremental
    /// diffing, clients that were offline catch up from the snapshot.
    pub fn on_connected(&self, conn_id: &str) {
        let Ok(locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Lock table unavailable during connect");
            return;
        };

        match self.store.list() {
            Ok(records) => {
                info!(conn_id = %conn_id, records = records.len(), "Connection active");
                self.hub.send_to(conn_id, ServerMessage::All(records));
                self.hub
                    .send_to(conn_id, ServerMessage::AllLocks(locks.snapshot()));
            }
            Err(err) => {
                warn!(conn_id = %conn_id, error = %err, "Failed to load records for connect");
                self.report_store_error(conn_id, None, &err);
            }
        }
    }

    /// Cleanup when a connection goes away. The connection is unregistered
    /// first so the lock-release broadcast only reaches the survivors.
    pub fn on_disconnected(&self, conn_id: &str) {
        self.hub.unregister(conn_id);

        let Ok(mut locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Lock table unavailable during disconnect");
            return;
        };

        if let Some(record_id) = locks.release(conn_id) {
            info!(conn_id = %conn_id, record_id, "Released lock on disconnect");
            self.hub
                .broadcast(&ServerMessage::AllLocks(locks.snapshot()));
        } else {
            debug!(conn_id = %conn_id, "Disconnected holding no lock");
        }
    }

    /// Attempts to acquire the advisory edit lock on `record.id`.
    ///
    /// A blocked request is a silent no-op: the caller infers denial from
    /// the absence of `take_lock_success` plus the next `all_locks` frame.
    pub fn take_lock(&self, conn_id: &str, record: Record) {
        let Ok(mut locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Lock table unavailable for take_lock");
            return;
        };

        // The connection may have dropped while this request was in flight;
        // never record a lock for a connection the hub no longer knows.
        if !self.hub.is_active(conn_id) {
            debug!(conn_id = %conn_id, record_id = record.id, "Ignoring take_lock from inactive connection");
            return;
        }

        if !locks.try_acquire(conn_id, record.id) {
            debug!(conn_id = %conn_id, record_id = record.id, "Lock request blocked");
            return;
        }

        info!(conn_id = %conn_id, record_id = record.id, "Lock acquired");
        self.hub
            .send_to(conn_id, ServerMessage::TakeLockSuccess(record));
        self.hub
            .broadcast(&ServerMessage::AllLocks(locks.snapshot()));
    }

    /// Inserts a new record and announces it. Lock state is untouched.
    pub fn add(&self, conn_id: &str, request_id: Option<String>, record: Record) {
        let Ok(_locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Coordinator unavailable for add");
            return;
        };

        match self.store.insert(&record) {
            Ok(added) => {
                info!(conn_id = %conn_id, record_id = added.id, "Record added");
                self.hub.broadcast(&ServerMessage::Add(added));
            }
            Err(err) => {
                warn!(conn_id = %conn_id, error = %err, "Failed to add record");
                self.report_store_error(conn_id, request_id, &err);
            }
        }
    }

    /// Removes a record and announces it. Deleting does not release any
    /// lock, even one covering the deleted record.
    pub fn delete(&self, conn_id: &str, request_id: Option<String>, record: Record) {
        let Ok(_locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Coordinator unavailable for delete");
            return;
        };

        match self.store.delete(record.id) {
            Ok(removed) => {
                info!(conn_id = %conn_id, record_id = removed.id, "Record deleted");
                self.hub.broadcast(&ServerMessage::Delete(removed));
            }
            Err(err) => {
                warn!(conn_id = %conn_id, record_id = record.id, error = %err, "Failed to delete record");
                self.report_store_error(conn_id, request_id, &err);
            }
        }
    }

    /// Persists an edit and announces it, then releases whatever lock the
    /// requesting connection held — whether or not it covered the updated
    /// record — and broadcasts the lock set. A failed update leaves the lock
    /// table exactly as it was.
    pub fn update(&self, conn_id: &str, request_id: Option<String>, record: Record) {
        let Ok(mut locks) = self.locks.lock() else {
            warn!(conn_id = %conn_id, "Coordinator unavailable for update");
            return;
        };

        match self.store.update(&record) {
            Ok(updated) => {
                info!(conn_id = %conn_id, record_id = updated.id, "Record updated");
                self.hub.broadcast(&ServerMessage::Update(updated));

                if let Some(released) = locks.release(conn_id) {
                    debug!(conn_id = %conn_id, record_id = released, "Released lock after update");
                }
                self.hub
                    .broadcast(&ServerMessage::AllLocks(locks.snapshot()));
            }
            Err(err) => {
                warn!(conn_id = %conn_id, record_id = record.id, error = %err, "Failed to update record");
                self.report_store_error(conn_id, request_id, &err);
            }
        }
    }

    pub fn health_snapshot(&self) -> HealthInfo {
        HealthInfo {
            status: "ok".to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            connections: self.hub.connection_count(),
        }
    }

    fn report_store_error(&self, conn_id: &str, request_id: Option<String>, err: &StoreError) {
        let info = ErrorInfo::new(err.code(), err.to_string());
        self.hub
            .send_to(conn_id, ServerMessage::Error(info.into_frame(request_id)));
    }
}
