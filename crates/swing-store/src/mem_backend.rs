use crate::{ChangeSet, SnapshotRecord, SpanRecord, StoreBackend, StoreError, StoreResult, VatPos};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct MemState {
    kv: BTreeMap<String, String>,
    items: BTreeMap<VatPos, String>,
    spans: BTreeMap<VatPos, SpanRecord>,
    snapshots: BTreeMap<VatPos, SnapshotRecord>,
    snapshot_bytes: BTreeMap<VatPos, Vec<u8>>,
}

/// In-memory backend. Clones share the same committed state, so a test can
/// drop a kernel and rebuild another one over the same data.
#[derive(Clone, Default)]
pub struct MemBackend {
    state: Arc<RwLock<MemState>>,
}

impl std::fmt::Debug for MemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("MemBackend");
        if let Ok(state) = self.state.read() {
            dbg.field("kv", &state.kv.len())
                .field("items", &state.items.len())
                .field("snapshots", &state.snapshots.len());
        }
        dbg.finish()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemState>> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemState>> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }
}

fn apply<K: Ord + Clone, V: Clone>(table: &mut BTreeMap<K, V>, changes: &BTreeMap<K, Option<V>>) {
    for (key, value) in changes {
        match value {
            Some(v) => {
                table.insert(key.clone(), v.clone());
            }
            None => {
                table.remove(key);
            }
        }
    }
}

fn vat_rows<V: Clone>(table: &BTreeMap<VatPos, V>, vat: Option<&str>) -> Vec<V> {
    table
        .iter()
        .filter(|((v, _), _)| vat.is_none_or(|want| want == v))
        .map(|(_, row)| row.clone())
        .collect()
}

impl StoreBackend for MemBackend {
    fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read()?.kv.get(key).cloned())
    }

    fn kv_range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, String)>> {
        let state = self.read()?;
        let upper = match end {
            Some(end) => Bound::Excluded(end.to_string()),
            None => Bound::Unbounded,
        };
        Ok(state
            .kv
            .range((Bound::Included(start.to_string()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn kv_next_key(&self, after: &str) -> StoreResult<Option<String>> {
        let state = self.read()?;
        Ok(state
            .kv
            .range((Bound::Excluded(after.to_string()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn transcript_items(&self, vat: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, String)>> {
        let state = self.read()?;
        Ok(state
            .items
            .range((vat.to_string(), start)..(vat.to_string(), end))
            .map(|((_, pos), item)| (*pos, item.clone()))
            .collect())
    }

    fn spans(&self, vat: Option<&str>) -> StoreResult<Vec<SpanRecord>> {
        Ok(vat_rows(&self.read()?.spans, vat))
    }

    fn snapshots(&self, vat: Option<&str>) -> StoreResult<Vec<SnapshotRecord>> {
        Ok(vat_rows(&self.read()?.snapshots, vat))
    }

    fn snapshot_bytes(&self, vat: &str, pos: u64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .read()?
            .snapshot_bytes
            .get(&(vat.to_string(), pos))
            .cloned())
    }

    fn commit(&mut self, changes: &ChangeSet) -> StoreResult<()> {
        let mut state = self.write()?;
        apply(&mut state.kv, &changes.kv);
        apply(&mut state.items, &changes.items);
        apply(&mut state.spans, &changes.spans);
        apply(&mut state.snapshots, &changes.snapshots);
        apply(&mut state.snapshot_bytes, &changes.snapshot_bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_sets_and_deletes() {
        let mut backend = MemBackend::new();
        let mut changes = ChangeSet::default();
        changes.kv.insert("a".into(), Some("1".into()));
        changes.kv.insert("b".into(), Some("2".into()));
        backend.commit(&changes).unwrap();

        let mut changes = ChangeSet::default();
        changes.kv.insert("a".into(), None);
        backend.commit(&changes).unwrap();

        assert_eq!(backend.kv_get("a").unwrap(), None);
        assert_eq!(backend.kv_get("b").unwrap().as_deref(), Some("2"));
        assert_eq!(backend.kv_next_key("a").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn clones_share_committed_state() {
        let mut backend = MemBackend::new();
        let other = backend.clone();
        let mut changes = ChangeSet::default();
        changes.kv.insert("crankNumber".into(), Some("4".into()));
        backend.commit(&changes).unwrap();
        assert_eq!(other.kv_get("crankNumber").unwrap().as_deref(), Some("4"));
    }
}
