//! Staged GC actions and their conversion into run-queue events.

use crate::error::KernelError;
use crate::keeper::KernelKeeper;
use crate::run_queue::RunQueueEvent;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use swing_abi::{KernelSlot, VatId};

/// Ordered the way actions are processed within one vat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GcActionKind {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionKind {
    pub const ALL: [GcActionKind; 3] = [
        GcActionKind::DropExport,
        GcActionKind::RetireExport,
        GcActionKind::RetireImport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcAction {
    pub vat: VatId,
    pub kind: GcActionKind,
    pub kref: KernelSlot,
}

impl GcAction {
    pub fn new(vat: VatId, kind: GcActionKind, kref: KernelSlot) -> Self {
        Self { vat, kind, kref }
    }
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat, self.kind.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KernelError::corrupt(format!("bad gc action '{s}'"));
        let mut parts = s.split(' ');
        let (Some(vat), Some(kind), Some(kref), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let kind = GcActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == kind)
            .ok_or_else(bad)?;
        Ok(Self {
            vat: vat.parse()?,
            kind,
            kref: kref.parse()?,
        })
    }
}

impl KernelKeeper {
    fn gc_action_strings(&self) -> Result<BTreeSet<String>, KernelError> {
        let list: Vec<String> = self.get_json("gcActions")?.unwrap_or_default();
        Ok(list.into_iter().collect())
    }

    fn save_gc_action_strings(&mut self, set: &BTreeSet<String>) -> Result<(), KernelError> {
        let list: Vec<&String> = set.iter().collect();
        self.set_json("gcActions", &list)
    }

    /// Pending actions in stored (string) order.
    pub fn gc_actions(&self) -> Result<Vec<GcAction>, KernelError> {
        self.gc_action_strings()?
            .iter()
            .map(|raw| raw.parse())
            .collect()
    }

    pub(crate) fn add_gc_actions(&mut self, actions: impl IntoIterator<Item = GcAction>) -> Result<(), KernelError> {
        let mut set = self.gc_action_strings()?;
        let before = set.len();
        set.extend(actions.into_iter().map(|action| action.to_string()));
        if set.len() != before {
            self.save_gc_action_strings(&set)?;
        }
        Ok(())
    }

    /// Whether an action has become pointless since it was staged.
    fn gc_action_negated(&self, action: &GcAction) -> Result<bool, KernelError> {
        if !self.is_vat_alive(action.vat)? {
            return Ok(true);
        }
        let Some(entry) = self.clist_entry(action.vat, action.kref)? else {
            return Ok(true);
        };
        if action.kind == GcActionKind::RetireImport {
            return Ok(false);
        }
        let Some((reach, recog)) = self.object_refcount(action.kref)? else {
            return Ok(true);
        };
        Ok(match action.kind {
            GcActionKind::DropExport => reach > 0 || !entry.reachable,
            GcActionKind::RetireExport => reach > 0 || recog > 0,
            GcActionKind::RetireImport => false,
        })
    }

    /// Turn the first surviving (vat, kind) group of staged actions into a
    /// run-queue event. Groups examined before it are discarded. Returns
    /// `NegatedGcAction` when every staged action was negated, and `None`
    /// when nothing was staged.
    pub(crate) fn next_gc_event(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        let mut set = self.gc_action_strings()?;
        if set.is_empty() {
            return Ok(None);
        }
        let mut groups: BTreeMap<(VatId, GcActionKind), Vec<(String, GcAction)>> = BTreeMap::new();
        for raw in &set {
            let action: GcAction = raw.parse()?;
            groups
                .entry((action.vat, action.kind))
                .or_default()
                .push((raw.clone(), action));
        }
        for ((vat, kind), actions) in groups {
            let mut krefs = Vec::new();
            for (raw, action) in actions {
                set.remove(&raw);
                if !self.gc_action_negated(&action)? {
                    krefs.push(action.kref);
                }
            }
            if krefs.is_empty() {
                continue;
            }
            krefs.sort();
            self.save_gc_action_strings(&set)?;
            return Ok(Some(match kind {
                GcActionKind::DropExport => RunQueueEvent::DropExports { vat, krefs },
                GcActionKind::RetireExport => RunQueueEvent::RetireExports { vat, krefs },
                GcActionKind::RetireImport => RunQueueEvent::RetireImports { vat, krefs },
            }));
        }
        self.save_gc_action_strings(&set)?;
        Ok(Some(RunQueueEvent::NegatedGcAction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VatOptions;
    use crate::keeper::tests::keeper;
    use swing_abi::VatSlot;

    fn live_vat(keeper: &mut KernelKeeper, vat: VatId, name: &str) {
        keeper.add_vat(name, vat).unwrap();
        keeper.set_vat_options(vat, &VatOptions::named(name)).unwrap();
    }

    #[test]
    fn action_strings_round_trip() {
        let action: GcAction = "v3 retireImport ko12".parse().unwrap();
        assert_eq!(
            action,
            GcAction::new(VatId(3), GcActionKind::RetireImport, KernelSlot::Object(12))
        );
        assert_eq!(action.to_string(), "v3 retireImport ko12");
        assert!("v3 forget ko12".parse::<GcAction>().is_err());
    }

    #[test]
    fn drop_is_emitted_before_retire() {
        let mut keeper = keeper();
        let vat = VatId(1);
        live_vat(&mut keeper, vat, "owner");
        let ko = keeper.add_kernel_object(Some(vat)).unwrap();
        keeper.add_clist_entry(vat, ko, VatSlot::export(1), true).unwrap();
        keeper
            .add_gc_actions([
                GcAction::new(vat, GcActionKind::RetireExport, ko),
                GcAction::new(vat, GcActionKind::DropExport, ko),
            ])
            .unwrap();

        let first = keeper.next_gc_event().unwrap().unwrap();
        assert_eq!(first, RunQueueEvent::DropExports { vat, krefs: vec![ko] });
        let second = keeper.next_gc_event().unwrap().unwrap();
        assert_eq!(second, RunQueueEvent::RetireExports { vat, krefs: vec![ko] });
        assert_eq!(keeper.next_gc_event().unwrap(), None);
    }

    #[test]
    fn fully_negated_set_yields_marker_event() {
        let mut keeper = keeper();
        let vat = VatId(1);
        live_vat(&mut keeper, vat, "owner");
        let ko = keeper.add_kernel_object(Some(vat)).unwrap();
        keeper.add_clist_entry(vat, ko, VatSlot::export(1), true).unwrap();
        keeper.pin_object(ko).unwrap();
        keeper
            .add_gc_actions([GcAction::new(vat, GcActionKind::DropExport, ko)])
            .unwrap();
        assert_eq!(keeper.next_gc_event().unwrap(), Some(RunQueueEvent::NegatedGcAction));
        assert!(keeper.gc_actions().unwrap().is_empty());
    }

    #[test]
    fn actions_for_dead_vats_are_negated() {
        let mut keeper = keeper();
        let ko = keeper.add_kernel_object(Some(VatId(9))).unwrap();
        keeper
            .add_gc_actions([GcAction::new(VatId(9), GcActionKind::RetireImport, ko)])
            .unwrap();
        assert_eq!(keeper.next_gc_event().unwrap(), Some(RunQueueEvent::NegatedGcAction));
    }
}
