//! SQLite-based key/value store for the image cache.
//!
//! Keys are image references with the transport prefix stripped, values are
//! transport-qualified archive locations (`docker-archive:<path>`).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// File name of the database inside the store directory.
pub const DB_FILE_NAME: &str = "images.db";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is closed")]
    Closed,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// A persisted image record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Cache key: the image reference without its transport prefix.
    pub reference: String,
    /// Transport-qualified location of the local archive.
    pub location: String,
    /// Pull completion timestamp (Unix seconds).
    pub pulled_at: i64,
}

/// Durable image record store.
///
/// A single connection is shared behind a mutex, so one store handle can be
/// used from many tasks concurrently.
pub struct ImageStore {
    conn: Mutex<Option<Connection>>,
}

impl ImageStore {
    /// Open or create a store inside `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE_NAME))?;

        // A put must be durable once it returns
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                reference TEXT PRIMARY KEY,
                location TEXT NOT NULL,
                pulled_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Image store schema initialized");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or overwrite the location for a reference.
    pub fn put(&self, reference: &str, location: &str) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            r#"
            INSERT INTO images (reference, location, pulled_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(reference) DO UPDATE SET
                location = excluded.location,
                pulled_at = excluded.pulled_at
            "#,
            params![reference, location, now],
        )?;
        Ok(())
    }

    /// Get the location stored for a reference.
    pub fn get(&self, reference: &str) -> Result<Option<String>, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.query_row(
            "SELECT location FROM images WHERE reference = ?1",
            params![reference],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Check whether a reference has a record.
    pub fn has(&self, reference: &str) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images WHERE reference = ?1",
            params![reference],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Reference whose record points at `location`, if any.
    pub fn owner_of(&self, location: &str) -> Result<Option<String>, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.query_row(
            "SELECT reference FROM images WHERE location = ?1 LIMIT 1",
            params![location],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// List all records, oldest pull first.
    pub fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = conn.prepare(
            "SELECT reference, location, pulled_at FROM images ORDER BY pulled_at, reference",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(ImageRecord {
                    reference: row.get(0)?,
                    location: row.get(1)?,
                    pulled_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Close the underlying connection. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!("Image store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_has() {
        let store = ImageStore::open_in_memory().unwrap();

        assert!(!store.has("docker://alpine:3").unwrap());
        assert!(store.get("docker://alpine:3").unwrap().is_none());

        store
            .put("docker://alpine:3", "docker-archive:/tmp/alpine-3.tar.gz")
            .unwrap();

        assert!(store.has("docker://alpine:3").unwrap());
        assert_eq!(
            store.get("docker://alpine:3").unwrap().as_deref(),
            Some("docker-archive:/tmp/alpine-3.tar.gz")
        );
    }

    #[test]
    fn test_put_overwrites() {
        let store = ImageStore::open_in_memory().unwrap();
        store.put("ref", "docker-archive:/a").unwrap();
        store.put("ref", "docker-archive:/b").unwrap();

        assert_eq!(store.get("ref").unwrap().as_deref(), Some("docker-archive:/b"));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_owner_of() {
        let store = ImageStore::open_in_memory().unwrap();
        store.put("registry/example:v1", "docker-archive:/i/a.tar.gz").unwrap();

        assert_eq!(
            store.owner_of("docker-archive:/i/a.tar.gz").unwrap().as_deref(),
            Some("registry/example:v1")
        );
        assert!(store.owner_of("docker-archive:/i/b.tar.gz").unwrap().is_none());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = ImageStore::open(dir.path()).unwrap();
            store.put("docker://nginx:1", "docker-archive:/x.tar.gz").unwrap();
            store.close().unwrap();
        }

        let store = ImageStore::open(dir.path()).unwrap();
        assert!(store.has("docker://nginx:1").unwrap());
        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reference, "docker://nginx:1");
        assert!(records[0].pulled_at > 0);
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = ImageStore::open_in_memory().unwrap();
        store.close().unwrap();
        // Closing twice is harmless
        store.close().unwrap();

        assert!(matches!(store.has("ref"), Err(StoreError::Closed)));
        assert!(matches!(store.put("ref", "loc"), Err(StoreError::Closed)));
    }
}
