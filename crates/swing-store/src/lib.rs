//! Kernel store: a buffered key-value namespace plus transcript and snapshot tables,
//! with crank savepoints and host-controlled commit over pluggable durable backends.

mod mem_backend;
mod overlay;
mod sqlite_backend;
mod swing_store;

pub use mem_backend::MemBackend;
pub use sqlite_backend::SqliteBackend;
pub use swing_store::{CrankHashes, SwingStore};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynBackend = Box<dyn StoreBackend>;

/// Key of a transcript item, span or snapshot row: `(vat id, position)`.
pub type VatPos = (String, u64);

/// One transcript span. Positions are half-open: `[start_pos, end_pos)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub vat_id: String,
    pub start_pos: u64,
    pub end_pos: u64,
    /// Running `sha256:` chain hash over the span's items.
    pub hash: String,
    pub is_current: bool,
    pub incarnation: u64,
}

impl SpanRecord {
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.end_pos == self.start_pos
    }
}

/// Metadata row of a stored vat snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub vat_id: String,
    pub snap_pos: u64,
    pub hash: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub in_use: bool,
}

/// Everything a commit writes. `None` values are deletions.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub kv: BTreeMap<String, Option<String>>,
    pub items: BTreeMap<VatPos, Option<String>>,
    pub spans: BTreeMap<VatPos, Option<SpanRecord>>,
    pub snapshots: BTreeMap<VatPos, Option<SnapshotRecord>>,
    pub snapshot_bytes: BTreeMap<VatPos, Option<Vec<u8>>>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.kv.len()
            + self.items.len()
            + self.spans.len()
            + self.snapshots.len()
            + self.snapshot_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable storage underneath a [`SwingStore`]. Reads see only committed data.
pub trait StoreBackend: Send {
    fn kv_get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Committed entries with `start <= key < end` (unbounded when `end` is `None`), in key order.
    fn kv_range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, String)>>;

    /// Smallest committed key strictly greater than `after`.
    fn kv_next_key(&self, after: &str) -> StoreResult<Option<String>>;

    /// Committed transcript items of `vat` with `start <= position < end`.
    fn transcript_items(&self, vat: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, String)>>;

    fn spans(&self, vat: Option<&str>) -> StoreResult<Vec<SpanRecord>>;

    fn snapshots(&self, vat: Option<&str>) -> StoreResult<Vec<SnapshotRecord>>;

    fn snapshot_bytes(&self, vat: &str, pos: u64) -> StoreResult<Option<Vec<u8>>>;

    /// Apply a change set atomically.
    fn commit(&mut self, changes: &ChangeSet) -> StoreResult<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("commit is only allowed between cranks")]
    CommitInCrank,
    #[error("crank already started")]
    CrankAlreadyStarted,
    #[error("no crank in progress")]
    NoCrank,
    #[error("unknown savepoint '{0}'")]
    UnknownSavepoint(String),
    #[error("vat {vat} has no current transcript span")]
    NoCurrentSpan { vat: String },
    #[error("vat {vat} already has a transcript")]
    TranscriptExists { vat: String },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Exclusive upper bound for keys starting with `prefix`.
///
/// Keys are ASCII, so bumping the last byte is enough.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8(bytes).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_end_bumps_last_byte() {
        assert_eq!(prefix_end("v1.c.").as_deref(), Some("v1.c/"));
        assert_eq!(prefix_end("ko").as_deref(), Some("kp"));
        assert_eq!(prefix_end(""), None);
    }
}
