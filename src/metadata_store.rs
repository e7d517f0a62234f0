//! Pointer Store Module
//!
//! This module provides the segment pointer storage capability consumed by the
//! repair pipeline: `get`, `put` with an expected previous version, and `list`.
//! A conflicting `put` means another actor mutated the segment concurrently and
//! must never be overwritten blindly.
//!
//! Two backends are provided: an in-memory store for tests and local setups,
//! and a SQLite store that keeps the segment body as JSON next to a version
//! column.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::segment::{Segment, SegmentKey};

/// Current database schema version
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during pointer store operations
#[derive(Error, Debug)]
pub enum PointerStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: SegmentKey,
        expected: u64,
        actual: u64,
    },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("Invalid pointer: {reason}")]
    InvalidPointer { reason: String },
}

/// Result type for pointer store operations
pub type PointerStoreResult<T> = Result<T, PointerStoreError>;

/// Segment pointer storage capability
#[async_trait]
pub trait PointerStore: Send + Sync {
    /// Load a segment pointer. The returned segment carries its current version.
    async fn get(&self, key: &SegmentKey) -> PointerStoreResult<Option<Segment>>;

    /// Write a segment pointer if the stored version equals `expected_version`
    /// (0 = must not exist yet). Returns the new version.
    async fn put(
        &self,
        key: &SegmentKey,
        segment: Segment,
        expected_version: u64,
    ) -> PointerStoreResult<u64>;

    /// List up to `limit` segment keys in key order
    async fn list(&self, limit: usize) -> PointerStoreResult<Vec<SegmentKey>>;
}

fn check_key(key: &SegmentKey, segment: &Segment) -> PointerStoreResult<()> {
    if *key != segment.key {
        return Err(PointerStoreError::InvalidPointer {
            reason: format!("key {} does not match segment key {}", key, segment.key),
        });
    }
    Ok(())
}

/// In-memory pointer store
#[derive(Debug, Default)]
pub struct MemoryPointerStore {
    segments: RwLock<BTreeMap<SegmentKey, Segment>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored segments
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Remove a segment, as the owning metadata service would on deletion
    pub fn delete(&self, key: &SegmentKey) -> Option<Segment> {
        self.segments.write().remove(key)
    }
}

#[async_trait]
impl PointerStore for MemoryPointerStore {
    async fn get(&self, key: &SegmentKey) -> PointerStoreResult<Option<Segment>> {
        Ok(self.segments.read().get(key).cloned())
    }

    async fn put(
        &self,
        key: &SegmentKey,
        mut segment: Segment,
        expected_version: u64,
    ) -> PointerStoreResult<u64> {
        check_key(key, &segment)?;

        let mut segments = self.segments.write();
        let actual = segments.get(key).map(|s| s.version).unwrap_or(0);
        if actual != expected_version {
            return Err(PointerStoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }

        let version = actual + 1;
        segment.version = version;
        segments.insert(key.clone(), segment);
        Ok(version)
    }

    async fn list(&self, limit: usize) -> PointerStoreResult<Vec<SegmentKey>> {
        Ok(self.segments.read().keys().take(limit).cloned().collect())
    }
}

/// Pointer store backed by SQLite
pub struct SqlitePointerStore {
    conn: Mutex<Connection>,
}

impl SqlitePointerStore {
    /// Create or open a pointer store at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> PointerStoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> PointerStoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PointerStoreResult<Self> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Remove a segment pointer. Returns whether a row was deleted.
    pub fn delete(&self, key: &SegmentKey) -> PointerStoreResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM segments WHERE key = ?1", [key.as_str()])?;
        Ok(rows > 0)
    }
}

/// Initialize database schema and check version
fn initialize_schema(conn: &Connection) -> PointerStoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            key TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schema_info (
            version INTEGER PRIMARY KEY
        );
        "#,
    )?;

    let existing_version: Option<u32> = conn
        .query_row("SELECT version FROM schema_info LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match existing_version {
        Some(version) if version != CURRENT_SCHEMA_VERSION => {
            Err(PointerStoreError::SchemaVersionMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: version,
            })
        }
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO schema_info (version) VALUES (?1)",
                [CURRENT_SCHEMA_VERSION],
            )?;
            Ok(())
        }
    }
}

#[async_trait]
impl PointerStore for SqlitePointerStore {
    async fn get(&self, key: &SegmentKey) -> PointerStoreResult<Option<Segment>> {
        let row: Option<(i64, String)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT version, body FROM segments WHERE key = ?1",
                [key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match row {
            Some((version, body)) => {
                let mut segment: Segment = serde_json::from_str(&body)?;
                segment.version = version as u64;
                Ok(Some(segment))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &SegmentKey,
        mut segment: Segment,
        expected_version: u64,
    ) -> PointerStoreResult<u64> {
        check_key(key, &segment)?;

        let version = expected_version + 1;
        segment.version = version;
        let body = serde_json::to_string(&segment)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let actual: u64 = tx
            .query_row(
                "SELECT version FROM segments WHERE key = ?1",
                [key.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64)
            .unwrap_or(0);

        if actual != expected_version {
            return Err(PointerStoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }

        if actual == 0 {
            tx.execute(
                "INSERT INTO segments (key, version, body) VALUES (?1, ?2, ?3)",
                (key.as_str(), version as i64, &body),
            )?;
        } else {
            tx.execute(
                "UPDATE segments SET version = ?2, body = ?3 WHERE key = ?1",
                (key.as_str(), version as i64, &body),
            )?;
        }
        tx.commit()?;

        debug!("Stored pointer {} at version {}", key, version);
        Ok(version)
    }

    async fn list(&self, limit: usize) -> PointerStoreResult<Vec<SegmentKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM segments ORDER BY key LIMIT ?1")?;
        let key_iter = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for key in key_iter {
            keys.push(SegmentKey(key?));
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{NodeId, Piece, PieceHash, RedundancyScheme};
    use tempfile::TempDir;

    fn create_test_segment(key: &str) -> Segment {
        let scheme = RedundancyScheme::new(2, 3, 4, 5).unwrap();
        let pieces = (0..4)
            .map(|i| Piece::new(i, NodeId::new(), Some(PieceHash::of(&[i as u8]))))
            .collect();
        Segment::new(key.into(), scheme, 1000).with_pieces(pieces)
    }

    async fn exercise_versioning(store: &dyn PointerStore) {
        let key = SegmentKey::from("bucket/obj/s0");
        let segment = create_test_segment("bucket/obj/s0");

        assert!(store.get(&key).await.unwrap().is_none());

        let v1 = store.put(&key, segment.clone(), 0).await.unwrap();
        assert_eq!(v1, 1);

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.pieces, segment.pieces);

        // Creating again must fail
        assert!(matches!(
            store.put(&key, segment.clone(), 0).await,
            Err(PointerStoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));

        let mut updated = stored.clone();
        updated.pieces.truncate(2);
        let v2 = store.put(&key, updated, 1).await.unwrap();
        assert_eq!(v2, 2);

        // Stale writer loses
        assert!(matches!(
            store.put(&key, stored, 1).await,
            Err(PointerStoreError::VersionConflict { actual: 2, .. })
        ));
        assert_eq!(store.get(&key).await.unwrap().unwrap().pieces.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_versioning() {
        let store = MemoryPointerStore::new();
        exercise_versioning(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_versioning() {
        let store = SqlitePointerStore::in_memory().unwrap();
        exercise_versioning(&store).await;
    }

    #[tokio::test]
    async fn test_key_mismatch_rejected() {
        let store = MemoryPointerStore::new();
        let segment = create_test_segment("a");
        assert!(matches!(
            store.put(&SegmentKey::from("b"), segment, 0).await,
            Err(PointerStoreError::InvalidPointer { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_limited() {
        let store = SqlitePointerStore::in_memory().unwrap();
        for key in ["c", "a", "b"] {
            store
                .put(&SegmentKey::from(key), create_test_segment(key), 0)
                .await
                .unwrap();
        }

        let keys = store.list(2).await.unwrap();
        assert_eq!(keys, vec![SegmentKey::from("a"), SegmentKey::from("b")]);

        assert!(store.delete(&SegmentKey::from("a")).unwrap());
        assert_eq!(store.list(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_database_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pointers.db");
        let key = SegmentKey::from("persist");

        {
            let store = SqlitePointerStore::new(&db_path).unwrap();
            store.put(&key, create_test_segment("persist"), 0).await.unwrap();
        }

        {
            let store = SqlitePointerStore::new(&db_path).unwrap();
            let segment = store.get(&key).await.unwrap().unwrap();
            assert_eq!(segment.version, 1);
            assert_eq!(segment.pieces.len(), 4);
        }
    }
}
