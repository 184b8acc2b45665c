use crate::overlay::Overlay;
use crate::{
    ChangeSet, DynBackend, SnapshotRecord, SpanRecord, StoreBackend, StoreError, StoreResult,
    VatPos, prefix_end,
};
use std::collections::BTreeMap;
use std::ops::Bound;
use swing_cbor::{Hash, HashWriter};

const ACTIVITY_HASH_KEY: &str = "activityhash";
const LOCAL_PREFIX: &str = "local.";

/// Hashes emitted at the end of a crank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrankHashes {
    /// Digest of this crank's consensus-visible KV writes.
    pub crank: Hash,
    /// Running chain over every crank hash so far.
    pub activity: Hash,
}

#[derive(Debug)]
struct Savepoint {
    name: String,
    kv: usize,
    items: usize,
    spans: usize,
    snapshots: usize,
    snapshot_bytes: usize,
    hasher: HashWriter,
}

/// The kernel's view of storage.
///
/// Reads see committed data overlaid with everything written since the last
/// [`SwingStore::commit`]. Writes made during a crank can be rolled back to a
/// named savepoint; nothing reaches the backend until the host commits
/// between cranks.
pub struct SwingStore {
    backend: DynBackend,
    kv: Overlay<String, String>,
    items: Overlay<VatPos, String>,
    spans: Overlay<VatPos, SpanRecord>,
    snapshots: Overlay<VatPos, SnapshotRecord>,
    snapshot_bytes: Overlay<VatPos, Vec<u8>>,
    savepoints: Vec<Savepoint>,
    in_crank: bool,
    crank_hasher: HashWriter,
}

impl std::fmt::Debug for SwingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwingStore")
            .field("pending", &self.pending_len())
            .field("in_crank", &self.in_crank)
            .field("savepoints", &self.savepoints.len())
            .finish()
    }
}

fn vat_key(vat: &str, pos: u64) -> VatPos {
    (vat.to_string(), pos)
}

fn parse_hash(s: &str) -> StoreResult<Hash> {
    Hash::from_hex_str(s).map_err(|err| StoreError::Corrupt(format!("bad hash '{s}': {err}")))
}

/// Merge committed rows with overlay rows of one vat (or all vats).
fn merge_vat_rows<V: Clone>(
    committed: Vec<V>,
    key_of: impl Fn(&V) -> VatPos,
    overlay: &Overlay<VatPos, V>,
    vat: Option<&str>,
) -> Vec<V> {
    let mut merged: BTreeMap<VatPos, V> = committed
        .into_iter()
        .map(|row| (key_of(&row), row))
        .collect();
    for (key, value) in overlay.iter() {
        if vat.is_some_and(|want| want != key.0) {
            continue;
        }
        match value {
            Some(row) => {
                merged.insert(key.clone(), row.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged.into_values().collect()
}

impl SwingStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: DynBackend) -> Self {
        Self {
            backend,
            kv: Overlay::default(),
            items: Overlay::default(),
            spans: Overlay::default(),
            snapshots: Overlay::default(),
            snapshot_bytes: Overlay::default(),
            savepoints: Vec::new(),
            in_crank: false,
            crank_hasher: HashWriter::new(),
        }
    }

    pub fn backend(&self) -> &dyn StoreBackend {
        self.backend.as_ref()
    }

    // ---------------------------------------------------------------------
    // Key-value namespace
    // ---------------------------------------------------------------------

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.kv.get(key) {
            Some(value) => Ok(value.cloned()),
            None => self.backend.kv_get(key),
        }
    }

    pub fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.note_write(&key, Some(&value));
        self.kv.put(key, Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        self.note_write(key, None);
        self.kv.put(key.to_string(), None);
    }

    fn note_write(&mut self, key: &str, value: Option<&str>) {
        if key.starts_with(LOCAL_PREFIX) {
            return;
        }
        let record = match value {
            Some(value) => format!("add {key} {value}"),
            None => format!("delete {key}"),
        };
        self.crank_hasher.record(record.as_bytes());
    }

    /// Entries with `start <= key < end`, in key order.
    pub fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, String)>> {
        let mut merged: BTreeMap<String, String> =
            self.backend.kv_range(start, end)?.into_iter().collect();
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        for (key, value) in self.kv.range::<str, _>((Bound::Included(start), upper)) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Every entry whose key starts with `prefix`.
    pub fn prefixed(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref())
    }

    pub fn delete_prefixed(&mut self, prefix: &str) -> StoreResult<usize> {
        let keys: Vec<String> = self.prefixed(prefix)?.into_iter().map(|(k, _)| k).collect();
        for key in &keys {
            self.delete(key);
        }
        Ok(keys.len())
    }

    /// Smallest live key strictly greater than `after`.
    pub fn get_next_key(&self, after: &str) -> StoreResult<Option<String>> {
        let overlay_next = self
            .kv
            .range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
            .find(|(_, value)| value.is_some())
            .map(|(key, _)| key.clone());

        let mut cursor = after.to_string();
        let backend_next = loop {
            match self.backend.kv_next_key(&cursor)? {
                None => break None,
                Some(key) => {
                    if matches!(self.kv.get(key.as_str()), Some(None)) {
                        cursor = key;
                        continue;
                    }
                    break Some(key);
                }
            }
        };

        Ok(match (overlay_next, backend_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    // ---------------------------------------------------------------------
    // Crank control
    // ---------------------------------------------------------------------

    pub fn start_crank(&mut self) -> StoreResult<()> {
        if self.in_crank {
            return Err(StoreError::CrankAlreadyStarted);
        }
        self.in_crank = true;
        self.savepoints.clear();
        Ok(())
    }

    pub fn in_crank(&self) -> bool {
        self.in_crank
    }

    pub fn establish_savepoint(&mut self, name: &str) -> StoreResult<()> {
        if !self.in_crank {
            return Err(StoreError::NoCrank);
        }
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            kv: self.kv.mark(),
            items: self.items.mark(),
            spans: self.spans.mark(),
            snapshots: self.snapshots.mark(),
            snapshot_bytes: self.snapshot_bytes.mark(),
            hasher: self.crank_hasher.clone(),
        });
        Ok(())
    }

    /// Undo every write made after the most recent savepoint called `name`.
    /// The savepoint itself survives and can be rolled back to again.
    pub fn rollback_to(&mut self, name: &str) -> StoreResult<()> {
        let idx = self
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.savepoints.truncate(idx + 1);
        let sp = &self.savepoints[idx];
        self.kv.rollback(sp.kv);
        self.items.rollback(sp.items);
        self.spans.rollback(sp.spans);
        self.snapshots.rollback(sp.snapshots);
        self.snapshot_bytes.rollback(sp.snapshot_bytes);
        self.crank_hasher = sp.hasher.clone();
        log::debug!("rolled back crank to savepoint '{name}'");
        Ok(())
    }

    pub fn end_crank(&mut self) -> StoreResult<()> {
        if !self.in_crank {
            return Err(StoreError::NoCrank);
        }
        self.in_crank = false;
        self.savepoints.clear();
        self.forget_undo();
        Ok(())
    }

    fn forget_undo(&mut self) {
        self.kv.forget_undo();
        self.items.forget_undo();
        self.spans.forget_undo();
        self.snapshots.forget_undo();
        self.snapshot_bytes.forget_undo();
    }

    /// Close the crank hash and fold it into the activity hash.
    pub fn emit_crank_hashes(&mut self) -> StoreResult<CrankHashes> {
        let crank = self.crank_hasher.finish_reset();
        let prev = self.activity_hash()?;
        let activity = Hash::chain(&prev, crank.as_bytes());
        // The activity hash key itself is not part of any crank hash.
        self.kv
            .put(ACTIVITY_HASH_KEY.to_string(), Some(activity.to_hex()));
        Ok(CrankHashes { crank, activity })
    }

    pub fn activity_hash(&self) -> StoreResult<Hash> {
        match self.get(ACTIVITY_HASH_KEY)? {
            Some(hex) => parse_hash(&hex),
            None => Ok(Hash::ZERO),
        }
    }

    /// Number of uncommitted rows.
    pub fn pending_len(&self) -> usize {
        self.kv.len()
            + self.items.len()
            + self.spans.len()
            + self.snapshots.len()
            + self.snapshot_bytes.len()
    }

    /// Atomically write every pending change to the backend.
    pub fn commit(&mut self) -> StoreResult<usize> {
        if self.in_crank {
            return Err(StoreError::CommitInCrank);
        }
        let changes = ChangeSet {
            kv: self.kv.snapshot(),
            items: self.items.snapshot(),
            spans: self.spans.snapshot(),
            snapshots: self.snapshots.snapshot(),
            snapshot_bytes: self.snapshot_bytes.snapshot(),
        };
        let count = changes.len();
        self.backend.commit(&changes)?;
        self.discard_pending();
        log::debug!("committed {count} store changes");
        Ok(count)
    }

    /// Drop every uncommitted change.
    pub fn discard_pending(&mut self) {
        self.kv.clear();
        self.items.clear();
        self.spans.clear();
        self.snapshots.clear();
        self.snapshot_bytes.clear();
        self.savepoints.clear();
        self.crank_hasher = HashWriter::new();
    }

    // ---------------------------------------------------------------------
    // Transcripts
    // ---------------------------------------------------------------------

    pub fn spans(&self, vat: Option<&str>) -> StoreResult<Vec<SpanRecord>> {
        let committed = self.backend.spans(vat)?;
        Ok(merge_vat_rows(
            committed,
            |s| vat_key(&s.vat_id, s.start_pos),
            &self.spans,
            vat,
        ))
    }

    pub fn current_span(&self, vat: &str) -> StoreResult<Option<SpanRecord>> {
        Ok(self
            .spans(Some(vat))?
            .into_iter()
            .find(|span| span.is_current))
    }

    fn require_current_span(&self, vat: &str) -> StoreResult<SpanRecord> {
        self.current_span(vat)?
            .ok_or_else(|| StoreError::NoCurrentSpan {
                vat: vat.to_string(),
            })
    }

    fn put_span(&mut self, span: SpanRecord) {
        let key = vat_key(&span.vat_id, span.start_pos);
        self.spans.put(key, Some(span));
    }

    /// Start the first span of a vat's transcript.
    pub fn init_transcript(&mut self, vat: &str, incarnation: u64) -> StoreResult<()> {
        if !self.spans(Some(vat))?.is_empty() {
            return Err(StoreError::TranscriptExists {
                vat: vat.to_string(),
            });
        }
        self.put_span(SpanRecord {
            vat_id: vat.to_string(),
            start_pos: 0,
            end_pos: 0,
            hash: Hash::ZERO.to_hex(),
            is_current: true,
            incarnation,
        });
        Ok(())
    }

    /// Append an item to the current span, returning its position.
    pub fn add_item(&mut self, vat: &str, item: &str) -> StoreResult<u64> {
        let mut span = self.require_current_span(vat)?;
        let pos = span.end_pos;
        self.items.put(vat_key(vat, pos), Some(item.to_string()));
        span.end_pos += 1;
        span.hash = Hash::chain(&parse_hash(&span.hash)?, item.as_bytes()).to_hex();
        self.put_span(span);
        Ok(pos)
    }

    fn rollover(&mut self, vat: &str, bump_incarnation: bool) -> StoreResult<SpanRecord> {
        let mut old = self.require_current_span(vat)?;
        old.is_current = false;
        let next = SpanRecord {
            vat_id: vat.to_string(),
            start_pos: old.end_pos,
            end_pos: old.end_pos,
            hash: Hash::ZERO.to_hex(),
            is_current: true,
            incarnation: old.incarnation + u64::from(bump_incarnation),
        };
        self.put_span(old);
        self.put_span(next.clone());
        Ok(next)
    }

    /// Close the current span and open a new one at the same position.
    pub fn rollover_span(&mut self, vat: &str) -> StoreResult<u64> {
        Ok(self.rollover(vat, false)?.start_pos)
    }

    /// Like [`Self::rollover_span`], also bumping the incarnation number.
    pub fn rollover_incarnation(&mut self, vat: &str) -> StoreResult<u64> {
        Ok(self.rollover(vat, true)?.incarnation)
    }

    /// Items of `vat` with `start <= position < end`.
    pub fn read_items(&self, vat: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, String)>> {
        let mut merged: BTreeMap<u64, String> = self
            .backend
            .transcript_items(vat, start, end)?
            .into_iter()
            .collect();
        for ((_, pos), item) in self.items.range(vat_key(vat, start)..vat_key(vat, end)) {
            match item {
                Some(item) => {
                    merged.insert(*pos, item.clone());
                }
                None => {
                    merged.remove(pos);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn read_current_span(&self, vat: &str) -> StoreResult<Vec<(u64, String)>> {
        let span = self.require_current_span(vat)?;
        self.read_items(vat, span.start_pos, span.end_pos)
    }

    /// Freeze a vat's transcript: no span stays current.
    pub fn stop_using_transcript(&mut self, vat: &str) -> StoreResult<()> {
        if let Some(mut span) = self.current_span(vat)? {
            span.is_current = false;
            self.put_span(span);
        }
        Ok(())
    }

    /// Delete transcript items that precede both the current span and the
    /// latest committed in-use snapshot. Span records are kept.
    pub fn prune_superseded(&mut self, vat: &str) -> StoreResult<u64> {
        let Some(span) = self.current_span(vat)? else {
            return Ok(0);
        };
        let committed_snapshot = self
            .backend
            .snapshots(Some(vat))?
            .into_iter()
            .filter(|s| s.in_use)
            .map(|s| s.snap_pos)
            .max();
        let Some(snap_pos) = committed_snapshot else {
            return Ok(0);
        };
        let bound = span.start_pos.min(snap_pos);
        let doomed = self.read_items(vat, 0, bound)?;
        for (pos, _) in &doomed {
            self.items.put(vat_key(vat, *pos), None);
        }
        if !doomed.is_empty() {
            log::info!("pruned {} transcript items of {vat} below {bound}", doomed.len());
        }
        Ok(doomed.len() as u64)
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    pub fn snapshots(&self, vat: Option<&str>) -> StoreResult<Vec<SnapshotRecord>> {
        let committed = self.backend.snapshots(vat)?;
        Ok(merge_vat_rows(
            committed,
            |s| vat_key(&s.vat_id, s.snap_pos),
            &self.snapshots,
            vat,
        ))
    }

    pub fn latest_snapshot(&self, vat: &str) -> StoreResult<Option<SnapshotRecord>> {
        Ok(self
            .snapshots(Some(vat))?
            .into_iter()
            .filter(|s| s.in_use)
            .max_by_key(|s| s.snap_pos))
    }

    /// Store a snapshot taken at transcript position `snap_pos`; it becomes the
    /// vat's only in-use snapshot.
    pub fn save_snapshot(
        &mut self,
        vat: &str,
        snap_pos: u64,
        bytes: Vec<u8>,
    ) -> StoreResult<SnapshotRecord> {
        self.stop_using_snapshot(vat)?;
        let size = bytes.len() as u64;
        let record = SnapshotRecord {
            vat_id: vat.to_string(),
            snap_pos,
            hash: Hash::of_bytes(&bytes).to_hex(),
            compressed_size: size,
            uncompressed_size: size,
            in_use: true,
        };
        self.snapshots
            .put(vat_key(vat, snap_pos), Some(record.clone()));
        self.snapshot_bytes.put(vat_key(vat, snap_pos), Some(bytes));
        Ok(record)
    }

    /// Snapshot bytes at a position, verified against the recorded hash.
    pub fn snapshot_bytes(&self, vat: &str, snap_pos: u64) -> StoreResult<Option<Vec<u8>>> {
        let Some(record) = self
            .snapshots(Some(vat))?
            .into_iter()
            .find(|s| s.snap_pos == snap_pos)
        else {
            return Ok(None);
        };
        let key = vat_key(vat, snap_pos);
        let bytes = match self.snapshot_bytes.get(&key) {
            Some(bytes) => bytes.cloned(),
            None => self.backend.snapshot_bytes(vat, snap_pos)?,
        };
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let actual = Hash::of_bytes(&bytes).to_hex();
        if actual != record.hash {
            return Err(StoreError::Corrupt(format!(
                "snapshot {vat}@{snap_pos} hash mismatch: expected {}, got {actual}",
                record.hash
            )));
        }
        Ok(Some(bytes))
    }

    pub fn stop_using_snapshot(&mut self, vat: &str) -> StoreResult<()> {
        for mut record in self.snapshots(Some(vat))? {
            if record.in_use {
                record.in_use = false;
                let key = vat_key(vat, record.snap_pos);
                self.snapshots.put(key, Some(record));
            }
        }
        Ok(())
    }

    /// Delete every snapshot that is no longer in use.
    pub fn delete_unused_snapshots(&mut self, vat: Option<&str>) -> StoreResult<u64> {
        let mut count = 0;
        for record in self.snapshots(vat)? {
            if !record.in_use {
                let key = vat_key(&record.vat_id, record.snap_pos);
                self.snapshots.put(key.clone(), None);
                self.snapshot_bytes.put(key, None);
                count += 1;
            }
        }
        Ok(count)
    }
}
