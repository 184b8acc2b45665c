//! The vat warehouse: a bounded, least-recently-used set of online vat
//! workers, rebuilt on demand from snapshot plus transcript replay.

use crate::config::{KernelConfig, ManagerType};
use crate::error::KernelError;
use crate::keeper::KernelKeeper;
use crate::manager::{VatWorker, start_worker};
use crate::transcript::{
    DivergenceKind, ReplayDivergence, ReplaySyscall, TranscriptDelivery, TranscriptItem,
    check_divergence,
};
use crate::vat::VatRegistry;
use indexmap::IndexMap;
use swing_abi::VatId;

pub struct VatWarehouse {
    /// Least recently used first.
    online: IndexMap<VatId, Box<dyn VatWorker>>,
    max_online: usize,
}

impl std::fmt::Debug for VatWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VatWarehouse")
            .field("online", &self.online.keys().collect::<Vec<_>>())
            .field("max_online", &self.max_online)
            .finish()
    }
}

impl VatWarehouse {
    pub fn new(max_online: usize) -> Self {
        Self {
            online: IndexMap::new(),
            max_online: max_online.max(1),
        }
    }

    pub fn is_online(&self, vat: VatId) -> bool {
        self.online.contains_key(&vat)
    }

    pub fn online_vats(&self) -> Vec<VatId> {
        self.online.keys().copied().collect()
    }

    pub(crate) fn set_max_online(&mut self, max_online: usize) {
        self.max_online = max_online.max(1);
    }

    /// Register a worker built elsewhere (fresh vats, upgrades).
    pub(crate) fn insert(&mut self, keeper: &KernelKeeper, vat: VatId, worker: Box<dyn VatWorker>) -> Result<(), KernelError> {
        self.evict(vat);
        self.make_room(keeper)?;
        self.online.insert(vat, worker);
        Ok(())
    }

    /// Shut a vat's worker down. Its state survives in the store.
    pub fn evict(&mut self, vat: VatId) {
        if let Some(mut worker) = self.online.shift_remove(&vat) {
            worker.shutdown();
            log::debug!("{vat} evicted from warehouse");
        }
    }

    pub fn evict_all(&mut self) {
        for (_, mut worker) in self.online.drain(..) {
            worker.shutdown();
        }
    }

    fn make_room(&mut self, keeper: &KernelKeeper) -> Result<(), KernelError> {
        while self.online.len() >= self.max_online {
            // vats without a transcript cannot be rebuilt, so they stay
            let mut victim = None;
            for vat in self.online.keys() {
                if keeper.vat_options(*vat)?.use_transcript {
                    victim = Some(*vat);
                    break;
                }
            }
            let Some(victim) = victim else {
                break;
            };
            self.evict(victim);
        }
        Ok(())
    }

    /// The worker for `vat`, bringing it online first if needed.
    pub(crate) fn worker(
        &mut self,
        keeper: &KernelKeeper,
        registry: &VatRegistry,
        config: &KernelConfig,
        vat: VatId,
    ) -> Result<&mut Box<dyn VatWorker>, KernelError> {
        if let Some(index) = self.online.get_index_of(&vat) {
            let last = self.online.len() - 1;
            self.online.move_index(index, last);
        } else {
            let worker = self.load(keeper, registry, config, vat)?;
            self.make_room(keeper)?;
            self.online.insert(vat, worker);
        }
        self.online
            .get_mut(&vat)
            .ok_or_else(|| KernelError::panic(format!("{vat} vanished from the warehouse")))
    }

    /// Rebuild a vat from its latest snapshot (or from scratch) and replay
    /// the current transcript span.
    fn load(
        &self,
        keeper: &KernelKeeper,
        registry: &VatRegistry,
        config: &KernelConfig,
        vat: VatId,
    ) -> Result<Box<dyn VatWorker>, KernelError> {
        let options = keeper.vat_options(vat)?;
        if !options.use_transcript {
            return Err(KernelError::Worker(format!(
                "{vat} has no transcript and cannot be rebuilt"
            )));
        }
        let source = keeper.vat_source(vat)?;
        let bundle = registry.get(&source.bundle)?;
        let manager = options.manager_type.unwrap_or(config.default_manager);
        let vat_key = vat.to_string();
        let store = keeper.store();
        let snapshot = match store.latest_snapshot(&vat_key)? {
            Some(record) => {
                let bytes = store.snapshot_bytes(&vat_key, record.snap_pos)?.ok_or_else(|| {
                    KernelError::corrupt(format!("{vat} snapshot {} has no bytes", record.snap_pos))
                })?;
                Some(bytes)
            }
            None => None,
        };
        let from_snapshot = snapshot.is_some();
        let mut worker = start_worker(manager, vat, bundle, snapshot)?;
        let items = store.read_current_span(&vat_key)?;
        let mut replayed = 0;
        for (pos, raw) in items {
            let item = TranscriptItem::decode(&raw)?;
            let TranscriptDelivery::Vat(delivery) = &item.d else {
                continue;
            };
            let mut sim = ReplaySyscall::new(vat, pos, &item.sc);
            let status = worker.deliver(delivery, &mut sim)?;
            let mut divergence = sim.finish();
            if divergence.is_none() && status != item.r.status {
                divergence = Some(ReplayDivergence {
                    vat,
                    delivery: pos,
                    index: item.sc.len(),
                    kind: DivergenceKind::Status,
                });
            }
            if let Err(err) = check_divergence(config.replay_check, divergence) {
                worker.shutdown();
                return Err(err);
            }
            replayed += 1;
        }
        log::debug!(
            "{vat} online ({}, replayed {replayed} deliveries)",
            if from_snapshot { "from snapshot" } else { "fresh" }
        );
        Ok(worker)
    }

    /// Worker of a vat known to be online.
    pub(crate) fn online_worker(&mut self, vat: VatId) -> Option<&mut Box<dyn VatWorker>> {
        self.online.get_mut(&vat)
    }
}

impl Drop for VatWarehouse {
    fn drop(&mut self) {
        self.evict_all();
    }
}
