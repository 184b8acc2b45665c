use crate::{ChangeSet, SnapshotRecord, SpanRecord, StoreBackend, StoreError, StoreResult};
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kvStore (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transcriptItems (
    vatID TEXT NOT NULL,
    position INTEGER NOT NULL,
    item TEXT NOT NULL,
    PRIMARY KEY (vatID, position)
);
CREATE TABLE IF NOT EXISTS transcriptSpans (
    vatID TEXT NOT NULL,
    startPos INTEGER NOT NULL,
    endPos INTEGER NOT NULL,
    hash TEXT NOT NULL,
    isCurrent INTEGER NOT NULL,
    incarnation INTEGER NOT NULL,
    PRIMARY KEY (vatID, startPos)
);
CREATE TABLE IF NOT EXISTS snapshots (
    vatID TEXT NOT NULL,
    snapPos INTEGER NOT NULL,
    hash TEXT NOT NULL,
    compressedSize INTEGER NOT NULL,
    uncompressedSize INTEGER NOT NULL,
    inUse INTEGER NOT NULL,
    compressedSnapshot BLOB,
    PRIMARY KEY (vatID, snapPos)
);
";

/// SQLite-backed durable store (one database file).
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish()
    }
}

fn pos(value: i64) -> u64 {
    value.max(0) as u64
}

fn sql_pos(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

fn kv_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn span_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpanRecord> {
    Ok(SpanRecord {
        vat_id: row.get(0)?,
        start_pos: pos(row.get(1)?),
        end_pos: pos(row.get(2)?),
        hash: row.get(3)?,
        is_current: row.get::<_, i64>(4)? != 0,
        incarnation: pos(row.get(5)?),
    })
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        vat_id: row.get(0)?,
        snap_pos: pos(row.get(1)?),
        hash: row.get(2)?,
        compressed_size: pos(row.get(3)?),
        uncompressed_size: pos(row.get(4)?),
        in_use: row.get::<_, i64>(5)? != 0,
    })
}

impl SqliteBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("opened swing store at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn query_spans(&self, vat: Option<&str>) -> rusqlite::Result<Vec<SpanRecord>> {
        let cols = "vatID, startPos, endPos, hash, isCurrent, incarnation";
        match vat {
            Some(vat) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {cols} FROM transcriptSpans WHERE vatID = ?1 ORDER BY startPos"
                ))?;
                let rows = stmt.query_map(params![vat], span_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {cols} FROM transcriptSpans ORDER BY vatID, startPos"
                ))?;
                let rows = stmt.query_map([], span_from_row)?;
                rows.collect()
            }
        }
    }

    fn query_snapshots(&self, vat: Option<&str>) -> rusqlite::Result<Vec<SnapshotRecord>> {
        let cols = "vatID, snapPos, hash, compressedSize, uncompressedSize, inUse";
        match vat {
            Some(vat) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {cols} FROM snapshots WHERE vatID = ?1 ORDER BY snapPos"
                ))?;
                let rows = stmt.query_map(params![vat], snapshot_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {cols} FROM snapshots ORDER BY vatID, snapPos"
                ))?;
                let rows = stmt.query_map([], snapshot_from_row)?;
                rows.collect()
            }
        }
    }
}

impl StoreBackend for SqliteBackend {
    fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM kvStore WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn kv_range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, String)>> {
        let rows: rusqlite::Result<Vec<(String, String)>> = match end {
            Some(end) => {
                let mut stmt = self.conn.prepare(
                    "SELECT key, value FROM kvStore WHERE key >= ?1 AND key < ?2 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![start, end], kv_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT key, value FROM kvStore WHERE key >= ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![start], kv_from_row)?;
                rows.collect()
            }
        };
        Ok(rows?)
    }

    fn kv_next_key(&self, after: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT key FROM kvStore WHERE key > ?1 ORDER BY key LIMIT 1",
                params![after],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn transcript_items(&self, vat: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT position, item FROM transcriptItems \
             WHERE vatID = ?1 AND position >= ?2 AND position < ?3 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![vat, sql_pos(start), sql_pos(end)], |row| {
            Ok((pos(row.get(0)?), row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn spans(&self, vat: Option<&str>) -> StoreResult<Vec<SpanRecord>> {
        Ok(self.query_spans(vat)?)
    }

    fn snapshots(&self, vat: Option<&str>) -> StoreResult<Vec<SnapshotRecord>> {
        Ok(self.query_snapshots(vat)?)
    }

    fn snapshot_bytes(&self, vat: &str, snap_pos: u64) -> StoreResult<Option<Vec<u8>>> {
        let bytes: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT compressedSnapshot FROM snapshots WHERE vatID = ?1 AND snapPos = ?2",
                params![vat, sql_pos(snap_pos)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.flatten())
    }

    fn commit(&mut self, changes: &ChangeSet) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in &changes.kv {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO kvStore (key, value) VALUES (?1, ?2) \
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kvStore WHERE key = ?1", params![key])?;
                }
            }
        }
        for ((vat, position), item) in &changes.items {
            match item {
                Some(item) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO transcriptItems (vatID, position, item) \
                         VALUES (?1, ?2, ?3)",
                        params![vat, sql_pos(*position), item],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM transcriptItems WHERE vatID = ?1 AND position = ?2",
                        params![vat, sql_pos(*position)],
                    )?;
                }
            }
        }
        for ((vat, start), span) in &changes.spans {
            match span {
                Some(span) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO transcriptSpans \
                         (vatID, startPos, endPos, hash, isCurrent, incarnation) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            span.vat_id,
                            sql_pos(span.start_pos),
                            sql_pos(span.end_pos),
                            span.hash,
                            span.is_current as i64,
                            sql_pos(span.incarnation)
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM transcriptSpans WHERE vatID = ?1 AND startPos = ?2",
                        params![vat, sql_pos(*start)],
                    )?;
                }
            }
        }
        for ((vat, snap_pos), record) in &changes.snapshots {
            match record {
                Some(record) => {
                    // Upsert metadata without touching the stored bytes.
                    tx.execute(
                        "INSERT INTO snapshots \
                         (vatID, snapPos, hash, compressedSize, uncompressedSize, inUse) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(vatID, snapPos) DO UPDATE SET \
                         hash = excluded.hash, compressedSize = excluded.compressedSize, \
                         uncompressedSize = excluded.uncompressedSize, inUse = excluded.inUse",
                        params![
                            record.vat_id,
                            sql_pos(record.snap_pos),
                            record.hash,
                            sql_pos(record.compressed_size),
                            sql_pos(record.uncompressed_size),
                            record.in_use as i64
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM snapshots WHERE vatID = ?1 AND snapPos = ?2",
                        params![vat, sql_pos(*snap_pos)],
                    )?;
                }
            }
        }
        for ((vat, snap_pos), bytes) in &changes.snapshot_bytes {
            tx.execute(
                "UPDATE snapshots SET compressedSnapshot = ?3 WHERE vatID = ?1 AND snapPos = ?2",
                params![vat, sql_pos(*snap_pos), bytes],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
