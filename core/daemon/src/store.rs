//! SQLite persistence for the shared record list.
//!
//! The store owns record identity: ids are assigned on insert and never
//! reused within a database file. The schema is a single `records` table;
//! lock state deliberately never touches disk.

use roster_daemon_protocol::Record;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(i64),
    #[error("failed to open record store: {0}")]
    Open(String),
    #[error("record store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Stable error code for the protocol boundary.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Open(_) => "store_unavailable",
            StoreError::Sqlite(_) => "store_error",
        }
    }
}

pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    /// All records ordered by name, ties broken by id so the order is
    /// deterministic.
    pub fn list(&self) -> Result<Vec<Record>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM records ORDER BY name ASC, id ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(Record {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }

    /// Inserts a new record, ignoring any client-supplied id, and returns
    /// the stored row with its assigned id.
    pub fn insert(&self, record: &Record) -> Result<Record, StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO records (name) VALUES (?1)",
                params![record.name],
            )?;
            Ok(Record {
                id: conn.last_insert_rowid(),
                name: record.name.clone(),
            })
        })
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<Record>, StoreError> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    "SELECT id, name FROM records WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Record {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Applies the mutable fields of `record` onto the stored row with the
    /// same id and returns the updated row.
    pub fn update(&self, record: &Record) -> Result<Record, StoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE records SET name = ?1 WHERE id = ?2",
                params![record.name, record.id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(record.id));
            }
            Ok(record.clone())
        })
    }

    /// Removes the record with the given id and returns the removed row.
    pub fn delete(&self, id: i64) -> Result<Record, StoreError> {
        let removed = self.find_by_id(id)?.ok_or(StoreError::NotFound(id))?;
        self.with_connection(|conn| {
            conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
            Ok(removed)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| StoreError::Open(format!("create data dir: {}", err)))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::Open(format!("open sqlite db: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = Store::new(temp_dir.path().join("roster.db")).expect("store init");
        (temp_dir, store)
    }

    fn named(name: &str) -> Record {
        Record {
            id: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let (_dir, store) = temp_store();
        let first = store.insert(&named("Alice")).expect("insert Alice");
        let second = store.insert(&named("Bob")).expect("insert Bob");
        assert!(first.id > 0);
        assert!(second.id > first.id);
    }

    #[test]
    fn insert_ignores_client_supplied_id() {
        let (_dir, store) = temp_store();
        let stored = store
            .insert(&Record {
                id: 999,
                name: "Alice".to_string(),
            })
            .expect("insert");
        assert_ne!(stored.id, 999);
        assert!(store.find_by_id(999).expect("lookup").is_none());
    }

    #[test]
    fn list_orders_by_name() {
        let (_dir, store) = temp_store();
        store.insert(&named("Carol")).expect("insert Carol");
        store.insert(&named("Alice")).expect("insert Alice");
        store.insert(&named("Bob")).expect("insert Bob");

        let names: Vec<String> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn update_rewrites_name() {
        let (_dir, store) = temp_store();
        let stored = store.insert(&named("Alice")).expect("insert");
        let updated = store
            .update(&Record {
                id: stored.id,
                name: "Alicia".to_string(),
            })
            .expect("update");
        assert_eq!(updated.name, "Alicia");
        assert_eq!(
            store.find_by_id(stored.id).expect("lookup"),
            Some(updated)
        );
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store
            .update(&Record {
                id: 42,
                name: "Ghost".to_string(),
            })
            .expect_err("missing record");
        assert!(matches!(err, StoreError::NotFound(42)));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn delete_returns_removed_record() {
        let (_dir, store) = temp_store();
        let stored = store.insert(&named("Alice")).expect("insert");
        let removed = store.delete(stored.id).expect("delete");
        assert_eq!(removed, stored);
        assert!(store.find_by_id(stored.id).expect("lookup").is_none());
        assert!(matches!(
            store.delete(stored.id),
            Err(StoreError::NotFound(_))
        ));
    }
}
