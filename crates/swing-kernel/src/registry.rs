//! Kernel objects and promises: ownership, refcounts, resolution and forwarding.

use crate::error::KernelError;
use crate::gc::{GcAction, GcActionKind};
use crate::keeper::{KernelKeeper, join_list, parse_list};
use crate::run_queue::RunQueueEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use swing_abi::{CapData, KernelSlot, Message, Value, VatId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
    Forwarded,
}

impl PromiseState {
    pub fn is_settled(self) -> bool {
        matches!(self, PromiseState::Fulfilled | PromiseState::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
            PromiseState::Forwarded => "forwarded",
        }
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromiseState {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(PromiseState::Unresolved),
            "fulfilled" => Ok(PromiseState::Fulfilled),
            "rejected" => Ok(PromiseState::Rejected),
            "forwarded" => Ok(PromiseState::Forwarded),
            other => Err(KernelError::corrupt(format!("bad promise state '{other}'"))),
        }
    }
}

/// Everything the kernel knows about one promise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPromise {
    pub kpid: KernelSlot,
    pub state: PromiseState,
    pub refcount: u64,
    pub decider: Option<VatId>,
    pub subscribers: Vec<VatId>,
    pub data: Option<CapData<KernelSlot>>,
    pub forward: Option<KernelSlot>,
    pub forwarders: Vec<KernelSlot>,
}

fn parse_refcount(kref: KernelSlot, raw: &str) -> Result<(u64, u64), KernelError> {
    let bad = || KernelError::corrupt(format!("bad refcount for {kref}: '{raw}'"));
    let (reach, recog) = raw.split_once(',').ok_or_else(bad)?;
    Ok((
        reach.parse().map_err(|_| bad())?,
        recog.parse().map_err(|_| bad())?,
    ))
}

impl KernelKeeper {
    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    pub(crate) fn add_kernel_object(&mut self, owner: Option<VatId>) -> Result<KernelSlot, KernelError> {
        let kref = KernelSlot::Object(self.allocate("ko.nextID")?);
        if let Some(owner) = owner {
            self.set(format!("{kref}.owner"), owner.to_string());
        }
        self.set(format!("{kref}.refCount"), "0,0");
        Ok(kref)
    }

    pub fn object_exists(&self, kref: KernelSlot) -> Result<bool, KernelError> {
        self.has(&format!("{kref}.refCount"))
    }

    /// Owning vat, `None` once the object is orphaned.
    pub fn object_owner(&self, kref: KernelSlot) -> Result<Option<VatId>, KernelError> {
        match self.get(&format!("{kref}.owner"))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub(crate) fn orphan_object(&mut self, kref: KernelSlot) {
        self.delete(&format!("{kref}.owner"));
        self.maybe_free.insert(kref);
    }

    /// `(reachable, recognizable)`.
    pub fn object_refcount(&self, kref: KernelSlot) -> Result<Option<(u64, u64)>, KernelError> {
        match self.get(&format!("{kref}.refCount"))? {
            Some(raw) => Ok(Some(parse_refcount(kref, &raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn adjust_object_refcount(
        &mut self,
        kref: KernelSlot,
        reach_delta: i64,
        recog_delta: i64,
    ) -> Result<(), KernelError> {
        let (reach, recog) = self
            .object_refcount(kref)?
            .ok_or_else(|| KernelError::panic(format!("refcount change on deleted object {kref}")))?;
        let reach = reach
            .checked_add_signed(reach_delta)
            .ok_or_else(|| KernelError::panic(format!("reachable count underflow on {kref}")))?;
        let recog = recog
            .checked_add_signed(recog_delta)
            .ok_or_else(|| KernelError::panic(format!("recognizable count underflow on {kref}")))?;
        if reach > recog {
            return Err(KernelError::panic(format!(
                "{kref} reachable count {reach} exceeds recognizable {recog}"
            )));
        }
        self.set(format!("{kref}.refCount"), format!("{reach},{recog}"));
        if reach_delta < 0 || recog_delta < 0 {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    fn delete_kernel_object(&mut self, kref: KernelSlot) {
        self.delete(&format!("{kref}.owner"));
        self.delete(&format!("{kref}.refCount"));
        log::debug!("deleted {kref}");
    }

    /// Vats whose c-list imports `kref`.
    pub fn importers_of(&self, kref: KernelSlot) -> Result<Vec<VatId>, KernelError> {
        let mut importers = Vec::new();
        for vat in self.live_vat_ids()? {
            if let Some(entry) = self.clist_entry(vat, kref)? {
                if entry.vref.is_import() {
                    importers.push(vat);
                }
            }
        }
        Ok(importers)
    }

    // ---------------------------------------------------------------------
    // Generic references
    // ---------------------------------------------------------------------

    /// A strong kernel-held reference: both counts for objects, the single
    /// count for promises. Device nodes are not counted.
    pub(crate) fn incref(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        match kref {
            KernelSlot::Object(_) => self.adjust_object_refcount(kref, 1, 1),
            KernelSlot::Promise(_) => self.adjust_promise_refcount(kref, 1),
            KernelSlot::Device(_) => Ok(()),
        }
    }

    pub(crate) fn decref(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        match kref {
            KernelSlot::Object(_) => self.adjust_object_refcount(kref, -1, -1),
            KernelSlot::Promise(_) => self.adjust_promise_refcount(kref, -1),
            KernelSlot::Device(_) => Ok(()),
        }
    }

    pub(crate) fn incref_all<'a>(&mut self, krefs: impl IntoIterator<Item = &'a KernelSlot>) -> Result<(), KernelError> {
        krefs.into_iter().try_for_each(|kref| self.incref(*kref))
    }

    pub(crate) fn decref_all<'a>(&mut self, krefs: impl IntoIterator<Item = &'a KernelSlot>) -> Result<(), KernelError> {
        krefs.into_iter().try_for_each(|kref| self.decref(*kref))
    }

    // ---------------------------------------------------------------------
    // Promises
    // ---------------------------------------------------------------------

    pub(crate) fn add_kernel_promise(&mut self, decider: Option<VatId>) -> Result<KernelSlot, KernelError> {
        let kpid = KernelSlot::Promise(self.allocate("kp.nextID")?);
        self.set(format!("{kpid}.state"), PromiseState::Unresolved.as_str());
        self.set_u64(format!("{kpid}.refCount"), 0);
        self.set(
            format!("{kpid}.decider"),
            decider.map(|v| v.to_string()).unwrap_or_default(),
        );
        self.set(format!("{kpid}.subscribers"), "");
        self.set_u64(format!("{kpid}.queue.nextID"), 1);
        Ok(kpid)
    }

    pub fn promise_state(&self, kpid: KernelSlot) -> Result<Option<PromiseState>, KernelError> {
        match self.get(&format!("{kpid}.state"))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub fn promise(&self, kpid: KernelSlot) -> Result<Option<KernelPromise>, KernelError> {
        let Some(state) = self.promise_state(kpid)? else {
            return Ok(None);
        };
        let decider = match self.get(&format!("{kpid}.decider"))?.unwrap_or_default() {
            raw if raw.is_empty() => None,
            raw => Some(raw.parse()?),
        };
        let data = match self.get(&format!("{kpid}.data.body"))? {
            Some(body) => {
                let body: Value = serde_json::from_str(&body)?;
                let slots = parse_list(&self.require(&format!("{kpid}.data.slots"))?)?;
                Some(CapData::new(body, slots)?)
            }
            None => None,
        };
        let forward = match self.get(&format!("{kpid}.forward"))? {
            Some(raw) => Some(raw.parse()?),
            None => None,
        };
        Ok(Some(KernelPromise {
            kpid,
            state,
            refcount: self.get_u64(&format!("{kpid}.refCount"))?.unwrap_or(0),
            decider,
            subscribers: parse_list(&self.get(&format!("{kpid}.subscribers"))?.unwrap_or_default())?,
            data,
            forward,
            forwarders: parse_list(&self.get(&format!("{kpid}.forwarders"))?.unwrap_or_default())?,
        }))
    }

    pub(crate) fn require_promise(&self, kpid: KernelSlot) -> Result<KernelPromise, KernelError> {
        self.promise(kpid)?
            .ok_or_else(|| KernelError::panic(format!("unknown promise {kpid}")))
    }

    fn adjust_promise_refcount(&mut self, kpid: KernelSlot, delta: i64) -> Result<(), KernelError> {
        let key = format!("{kpid}.refCount");
        let count = self
            .get_u64(&key)?
            .ok_or_else(|| KernelError::panic(format!("refcount change on deleted promise {kpid}")))?;
        let count = count
            .checked_add_signed(delta)
            .ok_or_else(|| KernelError::panic(format!("refcount underflow on {kpid}")))?;
        self.set_u64(key, count);
        if count == 0 {
            self.maybe_free.insert(kpid);
        }
        Ok(())
    }

    pub(crate) fn set_decider(&mut self, kpid: KernelSlot, decider: Option<VatId>) {
        self.set(
            format!("{kpid}.decider"),
            decider.map(|v| v.to_string()).unwrap_or_default(),
        );
    }

    pub(crate) fn add_subscriber(&mut self, kpid: KernelSlot, vat: VatId) -> Result<(), KernelError> {
        let key = format!("{kpid}.subscribers");
        let mut subscribers: BTreeSet<VatId> = parse_list::<VatId>(&self.get(&key)?.unwrap_or_default())?
            .into_iter()
            .collect();
        if subscribers.insert(vat) {
            self.set(key, join_list(subscribers));
        }
        Ok(())
    }

    /// Queue a message on an unresolved promise. The queue holds its own
    /// references to the message's slots.
    pub(crate) fn add_to_promise_queue(&mut self, kpid: KernelSlot, msg: Message<KernelSlot>) -> Result<(), KernelError> {
        self.incref_all(msg.args.slots())?;
        self.incref_all(msg.result.iter())?;
        let seq = self.allocate(&format!("{kpid}.queue.nextID"))?;
        self.set_json(format!("{kpid}.queue.{seq}"), &msg)
    }

    /// Messages queued on a promise, in arrival order.
    pub fn promise_queue(&self, kpid: KernelSlot) -> Result<Vec<Message<KernelSlot>>, KernelError> {
        let prefix = format!("{kpid}.queue.");
        let mut entries = Vec::new();
        for (key, raw) in self.store().prefixed(&prefix)? {
            let suffix = &key[prefix.len()..];
            if suffix == "nextID" {
                continue;
            }
            let seq: u64 = suffix
                .parse()
                .map_err(|_| KernelError::corrupt(format!("bad promise queue key '{key}'")))?;
            entries.push((seq, serde_json::from_str(&raw)?));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, msg)| msg).collect())
    }

    /// Remove and return a promise's queued messages, releasing the queue's references.
    pub(crate) fn take_promise_queue(&mut self, kpid: KernelSlot) -> Result<Vec<Message<KernelSlot>>, KernelError> {
        let messages = self.promise_queue(kpid)?;
        let prefix = format!("{kpid}.queue.");
        for (key, _) in self.store().prefixed(&prefix)? {
            if !key.ends_with(".nextID") {
                self.delete(&key);
            }
        }
        for msg in &messages {
            self.decref_all(msg.args.slots())?;
            self.decref_all(msg.result.iter())?;
        }
        Ok(messages)
    }

    /// Follow forwarding links to the promise that will actually settle.
    pub fn chain_end(&self, kpid: KernelSlot) -> Result<KernelSlot, KernelError> {
        let mut current = kpid;
        let mut seen = BTreeSet::new();
        while let Some(next) = self.get(&format!("{current}.forward"))? {
            if !seen.insert(current) {
                return Err(KernelError::panic(format!("forwarding loop through {current}")));
            }
            current = next.parse()?;
        }
        Ok(current)
    }

    /// Resolve `kpid`. Fulfilling with exactly one unresolved promise
    /// forwards instead of settling.
    pub(crate) fn resolve_promise(
        &mut self,
        kpid: KernelSlot,
        rejected: bool,
        data: CapData<KernelSlot>,
    ) -> Result<(), KernelError> {
        let target = match data.single_slot() {
            Some(slot) if !rejected && slot.is_promise() => Some(*slot),
            _ => None,
        };
        let Some(target) = target else {
            return self.settle_promise(kpid, rejected, data);
        };
        let end = self.chain_end(target)?;
        if end == kpid {
            return self.settle_promise(kpid, true, CapData::error("promise forwarding cycle"));
        }
        let end_promise = self.require_promise(end)?;
        match (end_promise.state, end_promise.data) {
            (PromiseState::Unresolved, _) => self.forward_promise(kpid, end),
            (state, Some(settled)) if state.is_settled() => {
                self.settle_promise(kpid, state == PromiseState::Rejected, settled)
            }
            (state, _) => Err(KernelError::panic(format!(
                "chain end {end} of {kpid} is {state} without data"
            ))),
        }
    }

    fn forward_promise(&mut self, kpid: KernelSlot, target: KernelSlot) -> Result<(), KernelError> {
        let promise = self.require_promise(kpid)?;
        if promise.state != PromiseState::Unresolved {
            return Err(KernelError::panic(format!("cannot forward {} promise {kpid}", promise.state)));
        }
        self.set(format!("{kpid}.state"), PromiseState::Forwarded.as_str());
        self.set(format!("{kpid}.forward"), target.to_string());
        self.set_decider(kpid, None);
        self.incref(target)?;
        let key = format!("{target}.forwarders");
        let mut forwarders: BTreeSet<KernelSlot> = parse_list::<KernelSlot>(&self.get(&key)?.unwrap_or_default())?
            .into_iter()
            .collect();
        forwarders.insert(kpid);
        self.set(key, join_list(forwarders));
        for msg in self.take_promise_queue(kpid)? {
            self.add_to_promise_queue(target, msg)?;
        }
        log::debug!("{kpid} forwarded to {target}");
        Ok(())
    }

    /// Remove `kpid`'s forwarding link, if any.
    fn unlink_forward(&mut self, kpid: KernelSlot) -> Result<(), KernelError> {
        let Some(raw) = self.get(&format!("{kpid}.forward"))? else {
            return Ok(());
        };
        let target: KernelSlot = raw.parse()?;
        self.delete(&format!("{kpid}.forward"));
        let key = format!("{target}.forwarders");
        if let Some(raw) = self.get(&key)? {
            let remaining: Vec<KernelSlot> = parse_list::<KernelSlot>(&raw)?
                .into_iter()
                .filter(|fwd| *fwd != kpid)
                .collect();
            if remaining.is_empty() {
                self.delete(&key);
            } else {
                self.set(key, join_list(remaining));
            }
        }
        self.decref(target)
    }

    /// Settle a promise for good: notify subscribers, requeue its queued
    /// messages and settle everything forwarded to it.
    pub(crate) fn settle_promise(
        &mut self,
        kpid: KernelSlot,
        rejected: bool,
        data: CapData<KernelSlot>,
    ) -> Result<(), KernelError> {
        let promise = self.require_promise(kpid)?;
        if promise.state.is_settled() {
            return Err(KernelError::panic(format!("{kpid} is already {}", promise.state)));
        }
        self.unlink_forward(kpid)?;
        let state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        self.set(format!("{kpid}.state"), state.as_str());
        self.set(format!("{kpid}.data.body"), serde_json::to_string(data.body())?);
        self.set(format!("{kpid}.data.slots"), join_list(data.slots()));
        self.incref_all(data.slots())?;
        self.delete(&format!("{kpid}.decider"));
        self.delete(&format!("{kpid}.subscribers"));
        for vat in &promise.subscribers {
            self.enqueue(RunQueueEvent::Notify { vat: *vat, kpid })?;
        }
        for msg in self.take_promise_queue(kpid)? {
            self.enqueue(RunQueueEvent::Send { target: kpid, msg })?;
        }
        self.delete(&format!("{kpid}.queue.nextID"));
        self.delete(&format!("{kpid}.forwarders"));
        self.maybe_free.insert(kpid);
        log::debug!("{kpid} {state}");
        for forwarder in promise.forwarders {
            if self.promise_state(forwarder)? == Some(PromiseState::Forwarded) {
                self.settle_promise(forwarder, rejected, data.clone())?;
            }
        }
        Ok(())
    }

    fn delete_kernel_promise(&mut self, kpid: KernelSlot) -> Result<(), KernelError> {
        let promise = self.require_promise(kpid)?;
        if let Some(data) = &promise.data {
            self.decref_all(data.slots())?;
        }
        self.unlink_forward(kpid)?;
        self.take_promise_queue(kpid)?;
        self.store_mut().delete_prefixed(&format!("{kpid}."))?;
        log::debug!("deleted {kpid}");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // End-of-crank refcount processing
    // ---------------------------------------------------------------------

    /// Examine every kref whose count dropped this crank, deleting dead
    /// promises and scheduling GC actions for unreachable objects. Runs to
    /// a fixpoint since deletions release further references.
    pub(crate) fn process_refcounts(&mut self) -> Result<(), KernelError> {
        let mut actions = Vec::new();
        loop {
            let batch = std::mem::take(&mut self.maybe_free);
            if batch.is_empty() {
                break;
            }
            for kref in batch {
                match kref {
                    KernelSlot::Promise(_) => {
                        let Some(count) = self.get_u64(&format!("{kref}.refCount"))? else {
                            continue;
                        };
                        if count == 0 {
                            self.delete_kernel_promise(kref)?;
                        }
                    }
                    KernelSlot::Object(_) => self.process_object(kref, &mut actions)?,
                    KernelSlot::Device(_) => {}
                }
            }
        }
        self.add_gc_actions(actions)
    }

    fn process_object(&mut self, kref: KernelSlot, actions: &mut Vec<GcAction>) -> Result<(), KernelError> {
        let Some((reach, recog)) = self.object_refcount(kref)? else {
            return Ok(());
        };
        if reach > 0 {
            return Ok(());
        }
        let mut owner = self.object_owner(kref)?;
        if let Some(vat) = owner {
            if self.is_vat_terminated(vat)? {
                self.delete(&format!("{kref}.owner"));
                owner = None;
            }
        }
        match owner {
            Some(vat) => {
                let flagged = self
                    .clist_entry(vat, kref)?
                    .is_some_and(|entry| entry.reachable);
                if flagged {
                    actions.push(GcAction::new(vat, GcActionKind::DropExport, kref));
                }
                if recog == 0 {
                    actions.push(GcAction::new(vat, GcActionKind::RetireExport, kref));
                }
            }
            None if recog > 0 => {
                for importer in self.importers_of(kref)? {
                    actions.push(GcAction::new(importer, GcActionKind::RetireImport, kref));
                }
                self.delete_kernel_object(kref);
            }
            None => self.delete_kernel_object(kref),
        }
        Ok(())
    }

    /// Delete a kernel object after its owner was told to retire it.
    pub(crate) fn retire_kernel_object(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        let mut actions = Vec::new();
        for importer in self.importers_of(kref)? {
            actions.push(GcAction::new(importer, GcActionKind::RetireImport, kref));
        }
        self.delete_kernel_object(kref);
        self.add_gc_actions(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::tests::keeper;
    use swing_abi::VatSlot;

    #[test]
    fn settling_requeues_messages_and_notifies() {
        let mut keeper = keeper();
        let kp = keeper.add_kernel_promise(None).unwrap();
        keeper.add_external_ref(kp).unwrap();
        keeper.add_subscriber(kp, VatId(2)).unwrap();
        let ko = keeper.add_kernel_object(Some(VatId(1))).unwrap();
        keeper
            .add_to_promise_queue(kp, Message::new("hi", CapData::single(ko), None))
            .unwrap();
        assert_eq!(keeper.object_refcount(ko).unwrap(), Some((1, 1)));

        keeper.settle_promise(kp, false, CapData::int(4)).unwrap();
        let events = keeper.run_queue_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunQueueEvent::Notify { vat: VatId(2), .. }));
        assert!(matches!(&events[1], RunQueueEvent::Send { target, .. } if *target == kp));
        assert_eq!(keeper.object_refcount(ko).unwrap(), Some((1, 1)));
        let promise = keeper.promise(kp).unwrap().unwrap();
        assert_eq!(promise.state, PromiseState::Fulfilled);
        assert_eq!(promise.refcount, 3);
    }

    #[test]
    fn forwarding_moves_queue_and_settles_forwarders() {
        let mut keeper = keeper();
        let p = keeper.add_kernel_promise(None).unwrap();
        let q = keeper.add_kernel_promise(None).unwrap();
        keeper.add_external_ref(p).unwrap();
        keeper.add_external_ref(q).unwrap();
        keeper
            .add_to_promise_queue(p, Message::new("later", CapData::null(), None))
            .unwrap();

        keeper.resolve_promise(p, false, CapData::single(q)).unwrap();
        assert_eq!(keeper.promise_state(p).unwrap(), Some(PromiseState::Forwarded));
        assert_eq!(keeper.chain_end(p).unwrap(), q);
        assert_eq!(keeper.promise_queue(q).unwrap().len(), 1);
        assert_eq!(keeper.promise(q).unwrap().unwrap().forwarders, vec![p]);

        keeper.settle_promise(q, true, CapData::error("nope")).unwrap();
        let p_record = keeper.promise(p).unwrap().unwrap();
        assert_eq!(p_record.state, PromiseState::Rejected);
        assert_eq!(p_record.forward, None);
        assert_eq!(p_record.data, Some(CapData::error("nope")));
    }

    #[test]
    fn self_forwarding_rejects() {
        let mut keeper = keeper();
        let p = keeper.add_kernel_promise(None).unwrap();
        keeper.add_external_ref(p).unwrap();
        keeper.resolve_promise(p, false, CapData::single(p)).unwrap();
        let record = keeper.promise(p).unwrap().unwrap();
        assert_eq!(record.state, PromiseState::Rejected);
        assert_eq!(record.data, Some(CapData::error("promise forwarding cycle")));
    }

    #[test]
    fn unreferenced_promise_is_deleted_with_its_data_refs() {
        let mut keeper = keeper();
        let ko = keeper.add_kernel_object(Some(VatId(1))).unwrap();
        keeper
            .add_clist_entry(VatId(1), ko, VatSlot::export(1), true)
            .unwrap();
        let kp = keeper.add_kernel_promise(None).unwrap();
        keeper.add_external_ref(kp).unwrap();
        keeper.settle_promise(kp, false, CapData::single(ko)).unwrap();
        assert_eq!(keeper.object_refcount(ko).unwrap(), Some((1, 1)));

        keeper.drop_external_ref(kp).unwrap();
        keeper.process_refcounts().unwrap();
        assert_eq!(keeper.promise(kp).unwrap(), None);
        assert_eq!(keeper.object_refcount(ko).unwrap(), Some((0, 0)));
        let actions = keeper.gc_actions().unwrap();
        assert_eq!(
            actions,
            vec![
                GcAction::new(VatId(1), GcActionKind::DropExport, ko),
                GcAction::new(VatId(1), GcActionKind::RetireExport, ko),
            ]
        );
    }

    #[test]
    fn orphaned_object_is_retired_from_importers() {
        let mut keeper = keeper();
        let owner = VatId(1);
        let importer = VatId(2);
        for (vat, name) in [(owner, "a"), (importer, "b")] {
            keeper.add_vat(name, vat).unwrap();
            keeper
                .set_vat_options(vat, &crate::config::VatOptions::named(name))
                .unwrap();
        }
        let ko = keeper.add_kernel_object(Some(owner)).unwrap();
        keeper.map_kernel_slot_to_vat(importer, ko).unwrap();
        keeper.clear_reachable_flag(importer, ko).unwrap();
        keeper.orphan_object(ko);
        keeper.process_refcounts().unwrap();
        assert!(!keeper.object_exists(ko).unwrap());
        assert_eq!(
            keeper.gc_actions().unwrap(),
            vec![GcAction::new(importer, GcActionKind::RetireImport, ko)]
        );
    }

    #[test]
    fn underflow_is_a_panic() {
        let mut keeper = keeper();
        let ko = keeper.add_kernel_object(None).unwrap();
        assert!(matches!(keeper.decref(ko), Err(KernelError::Panic(_))));
    }
}
