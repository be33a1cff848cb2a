//! `SQLite`-backed artifacts database.
//!
//! Tracks which index artifacts have been built for which images. The
//! builder records every index it writes; the orchestrator re-queries the
//! most recent row for an image + platform to learn what to push. The
//! database lives inside a single invocation's workspace.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use soci_core::descriptor::{Descriptor, Digest};
use soci_core::error::{Error, Result};

/// Idempotent DDL for the artifacts table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS index_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_digest TEXT NOT NULL,
    platform TEXT NOT NULL,
    index_digest TEXT NOT NULL,
    media_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    built_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_index_artifacts_image
    ON index_artifacts (image_digest, platform);
";

/// Local metadata store for built index artifacts.
pub struct ArtifactsDb {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for ArtifactsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactsDb").finish_non_exhaustive()
    }
}

impl ArtifactsDb {
    /// Opens (creating if needed) the artifacts database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the database cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            Error::storage_with_source(
                format!("failed to open artifacts db at {}", path.display()),
                e,
            )
        })?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory artifacts database (tests).
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` when the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage_with_source("failed to open in-memory artifacts db", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| Error::storage_with_source("failed to apply artifacts db schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::storage("artifacts db lock poisoned"))
    }

    /// Records an index artifact built for `image_digest` on `platform`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on database failure.
    pub fn record(
        &self,
        image_digest: &Digest,
        platform: &str,
        index: &Descriptor,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO index_artifacts (image_digest, platform, index_digest, media_type, size)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                image_digest.as_str(),
                platform,
                index.digest.as_str(),
                index.media_type,
                i64::try_from(index.size).unwrap_or(i64::MAX),
            ],
        )
        .map_err(|e| Error::storage_with_source("failed to record index artifact", e))?;
        Ok(())
    }

    /// Returns the most-recently-recorded index descriptor for
    /// `image_digest` on `platform`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on database failure or when a stored row
    /// does not parse back into a descriptor.
    pub fn latest_for_image(
        &self,
        image_digest: &Digest,
        platform: &str,
    ) -> Result<Option<Descriptor>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT index_digest, media_type, size FROM index_artifacts
                 WHERE image_digest = ?1 AND platform = ?2
                 ORDER BY id DESC LIMIT 1",
                params![image_digest.as_str(), platform],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::storage_with_source("failed to query index artifacts", e))?;

        row.map(|(digest, media_type, size)| {
            Ok(Descriptor {
                media_type,
                digest: Digest::parse(digest)?,
                size: u64::try_from(size).unwrap_or(0),
            })
        })
        .transpose()
    }

    /// Returns the number of recorded artifacts, across all images.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on database failure.
    pub fn len(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM index_artifacts", [], |row| row.get(0))
            .map_err(|e| Error::storage_with_source("failed to count index artifacts", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Returns whether no artifacts have been recorded.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on database failure.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
