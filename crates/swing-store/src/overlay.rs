use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::RangeBounds;

/// Uncommitted writes over a committed table, with an undo log for savepoints.
///
/// A pending value of `None` is a deletion that shadows the committed row.
#[derive(Debug)]
pub(crate) struct Overlay<K: Ord + Clone, V: Clone> {
    pending: BTreeMap<K, Option<V>>,
    undo: Vec<(K, Option<Option<V>>)>,
}

impl<K: Ord + Clone, V: Clone> Default for Overlay<K, V> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            undo: Vec::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Overlay<K, V> {
    /// `Some(None)` means deleted in the overlay; `None` means fall through to the backend.
    pub fn get<Q>(&self, key: &Q) -> Option<Option<&V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.pending.get(key).map(|v| v.as_ref())
    }

    pub fn put(&mut self, key: K, value: Option<V>) {
        let prev = self.pending.insert(key.clone(), value);
        self.undo.push((key, prev));
    }

    pub fn mark(&self) -> usize {
        self.undo.len()
    }

    pub fn rollback(&mut self, mark: usize) {
        while self.undo.len() > mark {
            let Some((key, prev)) = self.undo.pop() else {
                break;
            };
            match prev {
                Some(value) => {
                    self.pending.insert(key, value);
                }
                None => {
                    self.pending.remove(&key);
                }
            }
        }
    }

    pub fn forget_undo(&mut self) {
        self.undo.clear();
    }

    pub fn range<Q, R>(&self, range: R) -> btree_map::Range<'_, K, Option<V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        R: RangeBounds<Q>,
    {
        self.pending.range(range)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Option<V>)> {
        self.pending.iter()
    }

    pub fn snapshot(&self) -> BTreeMap<K, Option<V>> {
        self.pending.clone()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.undo.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
