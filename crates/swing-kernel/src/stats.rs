//! Kernel-wide counters for monitoring and the `swing stats` command.

use crate::error::KernelError;
use crate::keeper::KernelKeeper;
use crate::registry::PromiseState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DISPATCH_KEY: &str = "kernelStats";

/// Per-event-kind crank counts, persisted under `kernelStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchCounters {
    /// Cranks that reached a vat.
    pub deliveries: u64,
    /// Cranks by run-queue event kind, delivered or not.
    pub by_kind: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseCounts {
    pub unresolved: u64,
    pub fulfilled: u64,
    pub rejected: u64,
    pub forwarded: u64,
}

impl PromiseCounts {
    pub fn total(&self) -> u64 {
        self.unresolved + self.fulfilled + self.rejected + self.forwarded
    }

    fn count(&mut self, state: PromiseState) {
        match state {
            PromiseState::Unresolved => self.unresolved += 1,
            PromiseState::Fulfilled => self.fulfilled += 1,
            PromiseState::Rejected => self.rejected += 1,
            PromiseState::Forwarded => self.forwarded += 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStats {
    pub crank_number: u64,
    pub vats: u64,
    pub terminated_vats: u64,
    pub objects: u64,
    pub promises: PromiseCounts,
    pub run_queue_length: u64,
    /// Messages waiting on unresolved promises.
    pub promise_queue_length: u64,
    pub gc_actions: u64,
    pub reap_queue_length: u64,
    pub dispatch: DispatchCounters,
}

/// Gather the current counters by scanning the store.
pub fn collect_stats(keeper: &KernelKeeper) -> Result<KernelStats, KernelError> {
    let store = keeper.store();
    let mut objects = 0;
    for (key, _) in store.prefixed("ko")? {
        if key.ends_with(".refCount") {
            objects += 1;
        }
    }
    let mut promises = PromiseCounts::default();
    let mut promise_queue_length = 0;
    for (key, value) in store.prefixed("kp")? {
        if key.ends_with(".state") {
            promises.count(value.parse()?);
        } else if key.contains(".queue.") && !key.ends_with(".nextID") {
            promise_queue_length += 1;
        }
    }
    Ok(KernelStats {
        crank_number: keeper.crank_number()?,
        vats: keeper.live_vat_ids()?.len() as u64,
        terminated_vats: keeper.terminated_vats()?.len() as u64,
        objects,
        promises,
        run_queue_length: keeper.run_queue_len()?,
        promise_queue_length,
        gc_actions: keeper.gc_actions()?.len() as u64,
        reap_queue_length: keeper.reap_queue()?.len() as u64,
        dispatch: dispatch_counters(keeper)?,
    })
}

pub fn dispatch_counters(keeper: &KernelKeeper) -> Result<DispatchCounters, KernelError> {
    Ok(keeper.get_json(DISPATCH_KEY)?.unwrap_or_default())
}

pub(crate) fn record_dispatch(keeper: &mut KernelKeeper, kind: &str, delivered: bool) -> Result<(), KernelError> {
    let mut counters = dispatch_counters(keeper)?;
    if delivered {
        counters.deliveries += 1;
    }
    *counters.by_kind.entry(kind.to_string()).or_insert(0) += 1;
    keeper.set_json(DISPATCH_KEY, &counters)
}
