//! Typed access to the kernel's slice of the store.
//!
//! Every piece of durable kernel state lives in the [`SwingStore`] KV
//! namespace. [`KernelKeeper`] owns the store and knows the key layout; the
//! c-list, registry, run-queue and GC modules extend it with their own
//! `impl` blocks.

use crate::config::{KernelConfig, ReapInterval, VatOptions};
use crate::error::KernelError;
use crate::vat::VatSource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use swing_abi::{KernelSlot, Value, VatId};
use swing_store::SwingStore;

pub(crate) const KERNEL_VERSION: &str = "1";

/// Snapshot and reap parameters persisted at initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelOptions {
    pub snapshot_initial: u64,
    pub snapshot_interval: u64,
    pub default_reap_interval: ReapInterval,
}

/// Why a vat stopped, persisted under `vN.terminated`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub reject: bool,
    pub info: Value,
}

pub struct KernelKeeper {
    store: SwingStore,
    /// Krefs whose counts dropped during this crank.
    pub(crate) maybe_free: BTreeSet<KernelSlot>,
}

impl std::fmt::Debug for KernelKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelKeeper")
            .field("store", &self.store)
            .field("maybe_free", &self.maybe_free.len())
            .finish()
    }
}

pub(crate) fn join_list<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn parse_list<T>(raw: &str) -> Result<Vec<T>, KernelError>
where
    T: std::str::FromStr,
    KernelError: From<T::Err>,
{
    raw.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<T>().map_err(KernelError::from))
        .collect()
}

impl KernelKeeper {
    pub fn new(store: SwingStore) -> Self {
        Self {
            store,
            maybe_free: BTreeSet::new(),
        }
    }

    pub fn store(&self) -> &SwingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SwingStore {
        &mut self.store
    }

    pub fn into_store(self) -> SwingStore {
        self.store
    }

    // ---------------------------------------------------------------------
    // Raw helpers
    // ---------------------------------------------------------------------

    pub(crate) fn get(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.store.get(key)?)
    }

    pub(crate) fn require(&self, key: &str) -> Result<String, KernelError> {
        self.get(key)?
            .ok_or_else(|| KernelError::corrupt(format!("missing key '{key}'")))
    }

    pub(crate) fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.store.set(key, value);
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.store.delete(key);
    }

    pub(crate) fn get_u64(&self, key: &str) -> Result<Option<u64>, KernelError> {
        match self.get(key)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| KernelError::corrupt(format!("key '{key}' is not a number: '{raw}'"))),
            None => Ok(None),
        }
    }

    pub(crate) fn set_u64(&mut self, key: impl Into<String>, value: u64) {
        self.store.set(key, value.to_string());
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn set_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), KernelError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw);
        Ok(())
    }

    /// Bump a `nextID` counter, returning the id it held.
    pub(crate) fn allocate(&mut self, counter: &str) -> Result<u64, KernelError> {
        let id = self.get_u64(counter)?.unwrap_or(1);
        self.set_u64(counter, id + 1);
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Kernel-wide state
    // ---------------------------------------------------------------------

    pub fn is_initialized(&self) -> Result<bool, KernelError> {
        Ok(self.get("initialized")?.as_deref() == Some("true"))
    }

    pub fn initialize(&mut self, config: &KernelConfig) -> Result<(), KernelError> {
        self.set("version", KERNEL_VERSION);
        self.set_u64("crankNumber", 0);
        self.set_u64("kernel.snapshotInitial", config.snapshot_initial);
        self.set_u64("kernel.snapshotInterval", config.snapshot_interval);
        self.set(
            "kernel.defaultReapInterval",
            ReapInterval::from_option(config.default_reap_interval).encode(),
        );
        self.set_u64("vat.nextID", 1);
        self.set_json("vat.names", &Vec::<String>::new())?;
        self.set_json("vat.dynamicIDs", &Vec::<VatId>::new())?;
        self.set_json("vats.terminated", &Vec::<VatId>::new())?;
        self.set_u64("ko.nextID", 1);
        self.set_u64("kp.nextID", 1);
        self.set_u64("kd.nextID", 1);
        self.set_json("gcActions", &Vec::<String>::new())?;
        self.set_json("reapQueue", &Vec::<VatId>::new())?;
        self.set_json("runQueue", &[1u64, 1u64])?;
        self.set("pinnedObjects", "");
        self.set_json("kernel.externalRefs", &BTreeMap::<String, u64>::new())?;
        self.set("initialized", "true");
        Ok(())
    }

    pub fn crank_number(&self) -> Result<u64, KernelError> {
        Ok(self.get_u64("crankNumber")?.unwrap_or(0))
    }

    pub(crate) fn increment_crank_number(&mut self) -> Result<u64, KernelError> {
        let next = self.crank_number()? + 1;
        self.set_u64("crankNumber", next);
        Ok(next)
    }

    pub fn kernel_options(&self) -> Result<KernelOptions, KernelError> {
        let reap = match self.get("kernel.defaultReapInterval")? {
            Some(raw) => ReapInterval::decode(&raw)?,
            None => ReapInterval::Never,
        };
        Ok(KernelOptions {
            snapshot_initial: self.get_u64("kernel.snapshotInitial")?.unwrap_or(3),
            snapshot_interval: self.get_u64("kernel.snapshotInterval")?.unwrap_or(200),
            default_reap_interval: reap,
        })
    }

    pub(crate) fn set_kernel_options(&mut self, options: &KernelOptions) {
        self.set_u64("kernel.snapshotInitial", options.snapshot_initial);
        self.set_u64("kernel.snapshotInterval", options.snapshot_interval);
        self.set("kernel.defaultReapInterval", options.default_reap_interval.encode());
    }

    // ---------------------------------------------------------------------
    // Vats
    // ---------------------------------------------------------------------

    pub(crate) fn allocate_vat_id(&mut self) -> Result<VatId, KernelError> {
        Ok(VatId(self.allocate("vat.nextID")?))
    }

    pub fn vat_id_for_name(&self, name: &str) -> Result<Option<VatId>, KernelError> {
        match self.get(&format!("vat.name.{name}"))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub fn vat_names(&self) -> Result<Vec<String>, KernelError> {
        Ok(self.get_json("vat.names")?.unwrap_or_default())
    }

    /// Register a new vat under `name`.
    pub(crate) fn add_vat(&mut self, name: &str, vat: VatId) -> Result<(), KernelError> {
        if self.vat_id_for_name(name)?.is_some() {
            return Err(KernelError::DuplicateVatName(name.to_string()));
        }
        let mut names = self.vat_names()?;
        names.push(name.to_string());
        self.set_json("vat.names", &names)?;
        self.set(format!("vat.name.{name}"), vat.to_string());
        let mut ids = self.all_vat_ids()?;
        ids.push(vat);
        self.set_json("vat.dynamicIDs", &ids)?;
        Ok(())
    }

    /// Every vat ever created, terminated ones included.
    pub fn all_vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        Ok(self.get_json("vat.dynamicIDs")?.unwrap_or_default())
    }

    pub fn live_vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        let terminated: BTreeSet<VatId> = self.terminated_vats()?.into_iter().collect();
        Ok(self
            .all_vat_ids()?
            .into_iter()
            .filter(|vat| !terminated.contains(vat))
            .collect())
    }

    pub fn terminated_vats(&self) -> Result<Vec<VatId>, KernelError> {
        Ok(self.get_json("vats.terminated")?.unwrap_or_default())
    }

    pub fn is_vat_terminated(&self, vat: VatId) -> Result<bool, KernelError> {
        Ok(self.has(&format!("{vat}.terminated"))?)
    }

    /// Created, initialized and not terminated.
    pub fn is_vat_alive(&self, vat: VatId) -> Result<bool, KernelError> {
        Ok(self.has(&format!("{vat}.options"))? && !self.is_vat_terminated(vat)?)
    }

    pub(crate) fn has(&self, key: &str) -> Result<bool, KernelError> {
        Ok(self.store.has(key)?)
    }

    pub(crate) fn mark_vat_terminated(&mut self, vat: VatId, record: &TerminationRecord) -> Result<(), KernelError> {
        let mut terminated = self.terminated_vats()?;
        if !terminated.contains(&vat) {
            terminated.push(vat);
            self.set_json("vats.terminated", &terminated)?;
        }
        self.set_json(format!("{vat}.terminated"), record)
    }

    pub fn termination_record(&self, vat: VatId) -> Result<Option<TerminationRecord>, KernelError> {
        self.get_json(&format!("{vat}.terminated"))
    }

    pub fn vat_options(&self, vat: VatId) -> Result<VatOptions, KernelError> {
        self.get_json(&format!("{vat}.options"))?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub(crate) fn set_vat_options(&mut self, vat: VatId, options: &VatOptions) -> Result<(), KernelError> {
        self.set_json(format!("{vat}.options"), options)
    }

    pub fn vat_source(&self, vat: VatId) -> Result<VatSource, KernelError> {
        self.get_json(&format!("{vat}.source"))?
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))
    }

    pub fn set_vat_source(&mut self, vat: VatId, source: &VatSource) -> Result<(), KernelError> {
        self.set_json(format!("{vat}.source"), source)
    }

    pub fn incarnation(&self, vat: VatId) -> Result<u64, KernelError> {
        Ok(self.get_u64(&format!("{vat}.incarnation"))?.unwrap_or(0))
    }

    pub(crate) fn set_incarnation(&mut self, vat: VatId, incarnation: u64) {
        self.set_u64(format!("{vat}.incarnation"), incarnation);
    }

    pub(crate) fn reap_dirt(&self, vat: VatId) -> Result<u64, KernelError> {
        Ok(self.get_u64(&format!("{vat}.reapDirt"))?.unwrap_or(0))
    }

    pub(crate) fn set_reap_dirt(&mut self, vat: VatId, dirt: u64) {
        self.set_u64(format!("{vat}.reapDirt"), dirt);
    }

    /// Effective reap interval: the vat's own setting or the kernel default.
    pub(crate) fn reap_interval(&self, vat: VatId) -> Result<ReapInterval, KernelError> {
        match self.vat_options(vat)?.reap_interval {
            Some(interval) => Ok(interval),
            None => Ok(self.kernel_options()?.default_reap_interval),
        }
    }

    // ---------------------------------------------------------------------
    // Vatstore
    // ---------------------------------------------------------------------

    pub(crate) fn vatstore_get(&self, vat: VatId, key: &str) -> Result<Option<String>, KernelError> {
        self.get(&format!("{vat}.vs.{key}"))
    }

    pub(crate) fn vatstore_set(&mut self, vat: VatId, key: &str, value: &str) {
        self.set(format!("{vat}.vs.{key}"), value);
    }

    pub(crate) fn vatstore_delete(&mut self, vat: VatId, key: &str) {
        self.delete(&format!("{vat}.vs.{key}"));
    }

    /// Next vatstore key after `prior`, with the vat prefix stripped.
    pub(crate) fn vatstore_next_key(&self, vat: VatId, prior: &str) -> Result<Option<String>, KernelError> {
        let prefix = format!("{vat}.vs.");
        let next = self.store.get_next_key(&format!("{prefix}{prior}"))?;
        Ok(next.and_then(|key| key.strip_prefix(&prefix).map(str::to_string)))
    }

    // ---------------------------------------------------------------------
    // Host-held references
    // ---------------------------------------------------------------------

    pub fn pinned_objects(&self) -> Result<Vec<KernelSlot>, KernelError> {
        parse_list(&self.get("pinnedObjects")?.unwrap_or_default())
    }

    /// Keep an object alive for good. Pinning twice is a no-op.
    pub fn pin_object(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        if !kref.is_object() {
            return Err(KernelError::Invalid(format!("cannot pin {kref}: not an object")));
        }
        let mut pinned: BTreeSet<KernelSlot> = self.pinned_objects()?.into_iter().collect();
        if pinned.insert(kref) {
            self.incref(kref)?;
            self.set("pinnedObjects", join_list(pinned));
        }
        Ok(())
    }

    pub fn external_refs(&self) -> Result<BTreeMap<KernelSlot, u64>, KernelError> {
        let raw: BTreeMap<String, u64> = self.get_json("kernel.externalRefs")?.unwrap_or_default();
        raw.into_iter()
            .map(|(kref, count)| Ok((kref.parse()?, count)))
            .collect()
    }

    fn save_external_refs(&mut self, refs: &BTreeMap<KernelSlot, u64>) -> Result<(), KernelError> {
        let raw: BTreeMap<String, u64> = refs
            .iter()
            .map(|(kref, count)| (kref.to_string(), *count))
            .collect();
        self.set_json("kernel.externalRefs", &raw)
    }

    pub(crate) fn add_external_ref(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let mut refs = self.external_refs()?;
        *refs.entry(kref).or_insert(0) += 1;
        self.save_external_refs(&refs)?;
        self.incref(kref)
    }

    pub(crate) fn drop_external_ref(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let mut refs = self.external_refs()?;
        match refs.get_mut(&kref) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                refs.remove(&kref);
            }
            None => return Err(KernelError::Invalid(format!("host holds no reference to {kref}"))),
        }
        self.save_external_refs(&refs)?;
        self.decref(kref)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use swing_store::MemBackend;

    pub(crate) fn keeper() -> KernelKeeper {
        let mut keeper = KernelKeeper::new(SwingStore::new(MemBackend::new()));
        keeper.initialize(&KernelConfig::default()).unwrap();
        keeper
    }

    #[test]
    fn initialize_writes_kernel_options() {
        let keeper = keeper();
        assert!(keeper.is_initialized().unwrap());
        let opts = keeper.kernel_options().unwrap();
        assert_eq!(opts.snapshot_initial, 3);
        assert_eq!(opts.default_reap_interval, ReapInterval::Deliveries(1000));
    }

    #[test]
    fn vat_names_are_unique() {
        let mut keeper = keeper();
        let v1 = keeper.allocate_vat_id().unwrap();
        keeper.add_vat("alice", v1).unwrap();
        let v2 = keeper.allocate_vat_id().unwrap();
        assert!(matches!(
            keeper.add_vat("alice", v2),
            Err(KernelError::DuplicateVatName(_))
        ));
        assert_eq!(keeper.vat_id_for_name("alice").unwrap(), Some(v1));
        assert_eq!(keeper.all_vat_ids().unwrap(), vec![v1]);
    }

    #[test]
    fn vatstore_next_key_stays_inside_vat() {
        let mut keeper = keeper();
        let v1 = VatId(1);
        let v2 = VatId(2);
        keeper.vatstore_set(v1, "a", "1");
        keeper.vatstore_set(v1, "b", "2");
        keeper.vatstore_set(v2, "a", "3");
        assert_eq!(keeper.vatstore_next_key(v1, "a").unwrap().as_deref(), Some("b"));
        assert_eq!(keeper.vatstore_next_key(v1, "b").unwrap(), None);
    }
}
