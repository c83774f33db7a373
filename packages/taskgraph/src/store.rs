//! SQLite-backed memoization store.
//!
//! Maps a task fingerprint to its completion record: which targets the task
//! declared, and what those targets looked like on disk when it succeeded.
//! The store is the only state shared between runs; it lives in a single
//! database file inside the workspace and is owned by one graph at a time.

use std::path::{Path, PathBuf};

use derive_more::Debug;
use rusqlite::{Connection, OptionalExtension as _, params};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::Result, fingerprint::Fingerprint, stat::FileRecord};

/// Database file name inside the workspace directory.
pub const TASKGRAPH_DATABASE_FILENAME: &str = "taskgraph_data.db";

/// A memoized completion, keyed by fingerprint.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub fingerprint: Fingerprint,
    /// Declared targets, sorted, as of the recorded success.
    pub target_path_list: Vec<PathBuf>,
    /// One stat per target, taken after the recorded success.
    pub target_path_stats: Vec<FileRecord>,
    /// Seconds since the epoch at insertion.
    pub timestamp: f64,
}

#[derive(Debug)]
pub struct MemoStore {
    #[debug("<connection>")]
    conn: Connection,
}

impl MemoStore {
    /// Open (or create) the store inside a workspace directory.
    #[instrument(name = "MemoStore::open_in", skip(workspace))]
    pub fn open_in(workspace: impl AsRef<Path>) -> Result<Self> {
        Self::open(workspace.as_ref().join(TASKGRAPH_DATABASE_FILENAME))
    }

    /// Open (or create) the store at an explicit database path.
    #[instrument(name = "MemoStore::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS taskgraph_data (
                fingerprint TEXT PRIMARY KEY,
                target_path_stats BLOB NOT NULL,
                target_path_list BLOB NOT NULL,
                timestamp REAL NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Look up the completion record for a fingerprint.
    #[instrument(name = "MemoStore::lookup", skip(self))]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CompletionRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT target_path_stats, target_path_list, timestamp
                FROM taskgraph_data WHERE fingerprint = ?1
                "#,
                params![fingerprint.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((stats, paths, timestamp)) = row else {
            return Ok(None);
        };
        Ok(Some(CompletionRecord {
            fingerprint: fingerprint.clone(),
            target_path_list: serde_json::from_slice(&paths)?,
            target_path_stats: serde_json::from_slice(&stats)?,
            timestamp,
        }))
    }

    /// Insert a completion record. Upserts: re-recording a fingerprint is
    /// idempotent and replaces the prior row.
    #[instrument(name = "MemoStore::insert", skip(self, record), fields(fingerprint = %record.fingerprint))]
    pub fn insert(&self, record: &CompletionRecord) -> Result<()> {
        let stats = serde_json::to_vec(&record.target_path_stats)?;
        let paths = serde_json::to_vec(&record.target_path_list)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO taskgraph_data
            (fingerprint, target_path_stats, target_path_list, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![record.fingerprint.as_str(), stats, paths, record.timestamp],
        )?;
        Ok(())
    }

    /// Drop the record for a fingerprint, if any. Used when a record's
    /// targets no longer match their recorded stats.
    #[instrument(name = "MemoStore::delete", skip(self))]
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.conn.execute(
            "DELETE FROM taskgraph_data WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
        )?;
        Ok(())
    }

    /// Find any record that lists a target with the given content hash.
    ///
    /// Supports cross-fingerprint artifact reuse: when a record's own
    /// targets have drifted, an equivalent artifact may survive under a
    /// different fingerprint. Linear scan; the table holds one row per
    /// distinct task, not per file.
    #[instrument(name = "MemoStore::find_by_content", skip(self))]
    pub fn find_by_content(&self, content_hash: &str) -> Result<Option<CompletionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT fingerprint, target_path_stats, target_path_list, timestamp
            FROM taskgraph_data ORDER BY timestamp
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        for row in rows {
            let (fingerprint, stats, paths, timestamp) = row?;
            let target_path_stats: Vec<FileRecord> = serde_json::from_slice(&stats)?;
            if target_path_stats
                .iter()
                .any(|stat| stat.content_hash.as_deref() == Some(content_hash))
            {
                return Ok(Some(CompletionRecord {
                    fingerprint: Fingerprint::from_raw(fingerprint),
                    target_path_list: serde_json::from_slice(&paths)?,
                    target_path_stats,
                    timestamp,
                }));
            }
        }
        Ok(None)
    }

    /// Number of memoized completions.
    #[instrument(name = "MemoStore::count", skip(self))]
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM taskgraph_data", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
