//! Consistency checks over the kernel's persisted state.
//!
//! Refcounts are recomputed from every place that holds a reference and
//! compared with the stored counts; c-lists are checked in both directions.

use crate::error::KernelError;
use crate::gc::{GcAction, GcActionKind};
use crate::keeper::KernelKeeper;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use swing_abi::{KernelSlot, VatSlot};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub description: String,
}

impl InvariantViolation {
    fn new(invariant: &str, description: String) -> Self {
        Self {
            invariant: invariant.to_string(),
            description,
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.description)
    }
}

#[derive(Default)]
struct Expected {
    objects: BTreeMap<KernelSlot, (u64, u64)>,
    promises: BTreeMap<KernelSlot, u64>,
}

impl Expected {
    /// A strong reference: both counts of an object, the count of a promise.
    fn hold(&mut self, kref: KernelSlot, violations: &mut Vec<InvariantViolation>, holder: &str) {
        match kref {
            KernelSlot::Object(_) => match self.objects.get_mut(&kref) {
                Some((reach, recog)) => {
                    *reach += 1;
                    *recog += 1;
                }
                None => violations.push(InvariantViolation::new(
                    "danglingKref",
                    format!("{holder} refers to deleted object {kref}"),
                )),
            },
            KernelSlot::Promise(_) => match self.promises.get_mut(&kref) {
                Some(count) => *count += 1,
                None => violations.push(InvariantViolation::new(
                    "danglingKref",
                    format!("{holder} refers to deleted promise {kref}"),
                )),
            },
            KernelSlot::Device(_) => {}
        }
    }
}

fn krefs_with_suffix(keeper: &KernelKeeper, prefix: &str, suffix: &str) -> Result<Vec<KernelSlot>, KernelError> {
    let mut krefs = Vec::new();
    for (key, _) in keeper.store().prefixed(prefix)? {
        if let Some(kref) = key.strip_suffix(suffix) {
            if let Ok(kref) = kref.parse() {
                krefs.push(kref);
            }
        }
    }
    Ok(krefs)
}

/// Check every refcount and c-list against what the rest of the state
/// implies. An empty result means the state is consistent.
pub fn check_invariants(keeper: &KernelKeeper) -> Result<Vec<InvariantViolation>, KernelError> {
    let mut violations = Vec::new();
    let mut expected = Expected::default();
    for kref in krefs_with_suffix(keeper, "ko", ".refCount")? {
        expected.objects.insert(kref, (0, 0));
    }
    for kpid in krefs_with_suffix(keeper, "kp", ".state")? {
        expected.promises.insert(kpid, 0);
    }
    let pending_retires: BTreeSet<GcAction> = keeper
        .gc_actions()?
        .into_iter()
        .filter(|action| action.kind == GcActionKind::RetireImport)
        .collect();

    for vat in keeper.all_vat_ids()? {
        for (kref, entry) in keeper.clist_entries(vat)? {
            if keeper.clist_kref(vat, entry.vref)? != Some(kref) {
                violations.push(InvariantViolation::new(
                    "clistConsistency",
                    format!("{vat} maps {kref} to {} but not back", entry.vref),
                ));
            }
            match kref {
                KernelSlot::Object(_) if entry.vref.is_import() => match expected.objects.get_mut(&kref) {
                    Some((reach, recog)) => {
                        *reach += u64::from(entry.reachable);
                        *recog += 1;
                    }
                    None => {
                        let action = GcAction::new(vat, GcActionKind::RetireImport, kref);
                        if !pending_retires.contains(&action) {
                            violations.push(InvariantViolation::new(
                                "danglingKref",
                                format!("{vat} imports deleted object {kref}"),
                            ));
                        }
                    }
                },
                KernelSlot::Object(_) => {
                    if keeper.object_owner(kref)? != Some(vat) {
                        violations.push(InvariantViolation::new(
                            "exportOwnership",
                            format!("{vat} exports {kref} but does not own it"),
                        ));
                    }
                }
                KernelSlot::Promise(_) => expected.hold(kref, &mut violations, &format!("{vat} c-list")),
                KernelSlot::Device(_) => {}
            }
        }
        for (key, raw) in keeper.store().prefixed(&format!("{vat}.c."))? {
            let Some(vref) = key.rsplit('.').next() else {
                continue;
            };
            let Ok(vref) = vref.parse::<VatSlot>() else {
                continue;
            };
            let kref: KernelSlot = raw.parse()?;
            if keeper.clist_entry(vat, kref)?.map(|entry| entry.vref) != Some(vref) {
                violations.push(InvariantViolation::new(
                    "clistConsistency",
                    format!("{vat} maps {vref} to {kref} but not back"),
                ));
            }
        }
    }

    for event in keeper.run_queue_events()? {
        for kref in event.krefs() {
            expected.hold(kref, &mut violations, &format!("{} event", event.kind()));
        }
    }

    let kpids: Vec<KernelSlot> = expected.promises.keys().copied().collect();
    for kpid in kpids {
        let promise = keeper.require_promise(kpid)?;
        let holder = format!("{kpid}");
        for msg in keeper.promise_queue(kpid)? {
            for kref in msg.args.slots().iter().chain(msg.result.iter()) {
                expected.hold(*kref, &mut violations, &holder);
            }
        }
        if let Some(data) = &promise.data {
            for kref in data.slots() {
                expected.hold(*kref, &mut violations, &holder);
            }
        }
        if let Some(target) = promise.forward {
            expected.hold(target, &mut violations, &holder);
        }
    }

    for kref in keeper.pinned_objects()? {
        expected.hold(kref, &mut violations, "pinned set");
    }
    for (kref, count) in keeper.external_refs()? {
        for _ in 0..count {
            expected.hold(kref, &mut violations, "host");
        }
    }

    for (kref, want) in &expected.objects {
        let Some(have) = keeper.object_refcount(*kref)? else {
            continue;
        };
        if have != *want {
            violations.push(InvariantViolation::new(
                "objectRefcount",
                format!("{kref} stores {},{} but {},{} references exist", have.0, have.1, want.0, want.1),
            ));
        }
        if have.0 > have.1 {
            violations.push(InvariantViolation::new(
                "reachableExceedsRecognizable",
                format!("{kref} is {},{}", have.0, have.1),
            ));
        }
    }
    for (kpid, want) in &expected.promises {
        let have = keeper.require_promise(*kpid)?.refcount;
        if have != *want {
            violations.push(InvariantViolation::new(
                "promiseRefcount",
                format!("{kpid} stores {have} but {want} references exist"),
            ));
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::tests::keeper;
    use swing_abi::{CapData, Message, VatId};

    fn populated() -> (KernelKeeper, KernelSlot, KernelSlot) {
        let mut keeper = keeper();
        let owner = VatId(1);
        let user = VatId(2);
        for (vat, name) in [(owner, "owner"), (user, "user")] {
            keeper.add_vat(name, vat).unwrap();
            keeper
                .set_vat_options(vat, &crate::config::VatOptions::named(name))
                .unwrap();
        }
        let ko = keeper.add_kernel_object(Some(owner)).unwrap();
        keeper.add_clist_entry(owner, ko, VatSlot::export(1), true).unwrap();
        keeper.map_kernel_slot_to_vat(user, ko).unwrap();
        let kp = keeper.add_kernel_promise(Some(owner)).unwrap();
        keeper.map_kernel_slot_to_vat(user, kp).unwrap();
        keeper
            .add_to_promise_queue(kp, Message::new("later", CapData::single(ko), None))
            .unwrap();
        keeper.add_external_ref(kp).unwrap();
        (keeper, ko, kp)
    }

    #[test]
    fn consistent_state_passes() {
        let (keeper, ko, kp) = populated();
        assert_eq!(keeper.object_refcount(ko).unwrap(), Some((2, 2)));
        assert_eq!(keeper.promise(kp).unwrap().unwrap().refcount, 2);
        assert_eq!(check_invariants(&keeper).unwrap(), Vec::new());
    }

    #[test]
    fn tampered_refcount_is_reported() {
        let (mut keeper, ko, _) = populated();
        keeper.set(format!("{ko}.refCount"), "3,3");
        let violations = check_invariants(&keeper).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "objectRefcount");
    }

    #[test]
    fn one_sided_clist_is_reported() {
        let (mut keeper, _, _) = populated();
        keeper.delete(&format!("v2.c.{}", VatSlot::import(1)));
        let violations = check_invariants(&keeper).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "clistConsistency");
    }
}
