use crate::{Reply, Vat, VatCtx, VatError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use swing_abi::{
    CapData, DeliveryStatus, Dispatch, Message, Resolution, Syscall, Value, VatDelivery, VatSlot,
    VatSyscall,
};

pub(crate) const ID_COUNTERS_KEY: &str = "idCounters";
pub(crate) const DURABLE_PREFIX: &str = "durable.";
pub(crate) const BAGGAGE_PREFIX: &str = "baggage.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IdCounters {
    pub export: u64,
    pub durable: u64,
    pub promise: u64,
}

impl IdCounters {
    fn initial() -> Self {
        Self {
            export: 1,
            durable: 1,
            promise: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExportState {
    /// The kernel still holds a reachable reference.
    pub kernel_reachable: bool,
    /// Vat code still holds the object.
    pub held: bool,
    /// The kernel has seen this export.
    pub announced: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ImportState {
    /// Vat code released the import.
    pub dropped: bool,
    /// The drop was reported with `dropImports`.
    pub reported: bool,
    /// Baggage entries that refer to the import.
    #[serde(default)]
    pub baggage: u32,
}

impl ImportState {
    /// Nothing in the vat holds the import anymore.
    fn is_dead(&self) -> bool {
        self.dropped && self.baggage == 0
    }
}

/// Per-vat slot bookkeeping, serialized into snapshots together with the vat.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SlotTable {
    pub(crate) ids: IdCounters,
    pub(crate) persisted_ids: Option<IdCounters>,
    pub(crate) exports: BTreeMap<VatSlot, ExportState>,
    pub(crate) imports: BTreeMap<VatSlot, ImportState>,
    pub(crate) weak: BTreeMap<VatSlot, Value>,
    /// Promises this vat must settle.
    pub(crate) decided: BTreeSet<VatSlot>,
    /// Promises this vat subscribed to.
    pub(crate) watched: BTreeSet<VatSlot>,
    /// Messages pipelined to a promise this vat decides.
    pub(crate) pipelined: BTreeMap<VatSlot, Vec<Message<VatSlot>>>,
    #[serde(skip)]
    pub(crate) local: VecDeque<(VatSlot, Message<VatSlot>)>,
    #[serde(skip)]
    pub(crate) settled_now: BTreeSet<VatSlot>,
}

impl SlotTable {
    fn new() -> Self {
        let mut table = Self {
            ids: IdCounters::initial(),
            ..Self::default()
        };
        table.exports.insert(
            VatSlot::root(),
            ExportState {
                kernel_reachable: true,
                held: true,
                announced: true,
            },
        );
        table
    }

    pub fn exports(&self) -> impl Iterator<Item = &VatSlot> {
        self.exports.keys()
    }

    pub fn imports(&self) -> impl Iterator<Item = &VatSlot> {
        self.imports.keys()
    }

    pub fn is_export(&self, vref: &VatSlot) -> bool {
        self.exports.contains_key(vref)
    }

    pub fn is_import(&self, vref: &VatSlot) -> bool {
        self.imports.contains_key(vref)
    }

    pub fn decides(&self, vpid: &VatSlot) -> bool {
        self.decided.contains(vpid)
    }

    pub(crate) fn new_export(&mut self, durable: bool) -> VatSlot {
        let vref = if durable {
            let id = self.ids.durable;
            self.ids.durable += 1;
            VatSlot::durable_export(id)
        } else {
            let id = self.ids.export;
            self.ids.export += 1;
            VatSlot::export(id)
        };
        self.exports.insert(
            vref,
            ExportState {
                kernel_reachable: false,
                held: true,
                announced: false,
            },
        );
        vref
    }

    pub(crate) fn new_promise(&mut self) -> VatSlot {
        let id = self.ids.promise;
        self.ids.promise += 1;
        VatSlot::promise_export(id)
    }

    /// Slots the kernel handed to us.
    pub(crate) fn note_inbound<'s>(&mut self, slots: impl IntoIterator<Item = &'s VatSlot>) -> Vec<VatSlot> {
        let mut fresh_promises = Vec::new();
        for vref in slots {
            match vref {
                VatSlot::Object { .. } if vref.is_import() => {
                    let state = self.imports.entry(*vref).or_default();
                    state.dropped = false;
                    state.reported = false;
                }
                VatSlot::Object { .. } => {
                    if let Some(state) = self.exports.get_mut(vref) {
                        state.kernel_reachable = true;
                    }
                }
                VatSlot::Promise { .. } => {
                    if !self.watched.contains(vref) && !self.decided.contains(vref) {
                        fresh_promises.push(*vref);
                    }
                }
                VatSlot::Device { .. } => {}
            }
        }
        fresh_promises.sort();
        fresh_promises.dedup();
        fresh_promises
    }

    /// Whether `vref` may be kept in baggage across upgrades.
    pub(crate) fn check_durable_ref(&self, vref: &VatSlot) -> Result<(), VatError> {
        let storable = match vref {
            VatSlot::Object { .. } if vref.is_import() => {
                self.imports.get(vref).is_some_and(|state| !state.reported)
            }
            VatSlot::Object { .. } => vref.is_durable() || *vref == VatSlot::root(),
            VatSlot::Device { .. } => true,
            VatSlot::Promise { .. } => false,
        };
        if storable {
            Ok(())
        } else {
            Err(VatError::rejected(format!("{vref} cannot be stored in baggage")))
        }
    }

    pub(crate) fn add_baggage_refs<'s>(&mut self, slots: impl IntoIterator<Item = &'s VatSlot>) {
        for vref in slots {
            if let Some(state) = self.imports.get_mut(vref) {
                state.baggage += 1;
            }
        }
    }

    pub(crate) fn remove_baggage_refs<'s>(&mut self, slots: impl IntoIterator<Item = &'s VatSlot>) {
        for vref in slots {
            if let Some(state) = self.imports.get_mut(vref) {
                state.baggage = state.baggage.saturating_sub(1);
            }
        }
    }

    /// Imports read back out of baggage are held by vat code again.
    pub(crate) fn note_revived<'s>(&mut self, slots: impl IntoIterator<Item = &'s VatSlot>) {
        for vref in slots {
            if let Some(state) = self.imports.get_mut(vref) {
                state.dropped = false;
            }
        }
    }

    /// The heap is going away: only baggage keeps imports alive now, and
    /// weak entries go with the heap.
    fn release_heap(&mut self) {
        for state in self.imports.values_mut() {
            state.dropped = true;
        }
        self.weak.clear();
    }

    /// Slots we hand to the kernel.
    pub(crate) fn note_outbound<'s>(&mut self, slots: impl IntoIterator<Item = &'s VatSlot>) {
        for vref in slots {
            if vref.is_object() && vref.is_export() {
                let state = self.exports.entry(*vref).or_insert(ExportState {
                    kernel_reachable: true,
                    held: true,
                    announced: true,
                });
                state.kernel_reachable = true;
                state.announced = true;
            }
        }
    }
}

#[derive(Serialize)]
struct ImageRef<'a, V> {
    slots: &'a SlotTable,
    vat: &'a V,
}

#[derive(Deserialize)]
struct Image<V> {
    slots: SlotTable,
    vat: V,
}

/// Adapts a [`Vat`] to the kernel's [`Dispatch`] interface.
pub struct LiveslotsDispatch<V> {
    vat: V,
    slots: SlotTable,
}

impl<V: Vat> LiveslotsDispatch<V> {
    pub fn new(vat: V) -> Self {
        Self {
            vat,
            slots: SlotTable::new(),
        }
    }

    pub fn restore(snapshot: &[u8]) -> Result<Self, VatError> {
        let image: Image<V> =
            serde_cbor::from_slice(snapshot).map_err(|err| VatError::Codec(err.to_string()))?;
        Ok(Self {
            vat: image.vat,
            slots: image.slots,
        })
    }

    pub fn vat(&self) -> &V {
        &self.vat
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    fn run(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> Result<(), VatError> {
        self.slots.settled_now.clear();
        match delivery {
            VatDelivery::StartVat { params } => self.start(syscall, params)?,
            VatDelivery::Message { target, msg } => {
                self.deliver_message(syscall, *target, msg.clone())?
            }
            VatDelivery::Notify { resolutions } => self.notify(syscall, resolutions)?,
            VatDelivery::DropExports { vrefs } => {
                for vref in vrefs {
                    if let Some(state) = self.slots.exports.get_mut(vref) {
                        state.kernel_reachable = false;
                    }
                }
            }
            VatDelivery::RetireExports { vrefs } => {
                for vref in vrefs {
                    if self.slots.exports.remove(vref).is_some() {
                        self.vat.export_retired(*vref);
                    }
                }
            }
            VatDelivery::RetireImports { vrefs } => {
                for vref in vrefs {
                    self.slots.weak.remove(vref);
                    if self.slots.imports.remove(vref).is_some() {
                        self.vat.import_retired(*vref);
                    }
                }
            }
            VatDelivery::StopVat { .. } => {
                let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
                self.vat.stop(&mut ctx)?;
                self.slots.release_heap();
                self.bring_out_your_dead(syscall)?;
            }
            VatDelivery::BringOutYourDead => self.bring_out_your_dead(syscall)?,
        }
        self.drain_local(syscall)?;
        self.persist_ids(syscall)
    }

    fn start(&mut self, syscall: &mut dyn Syscall, params: &CapData<VatSlot>) -> Result<(), VatError> {
        self.load_durable_state(syscall)?;
        let fresh = self.slots.note_inbound(params.slots());
        let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
        for vpid in fresh {
            ctx.subscribe(vpid)?;
        }
        self.vat.start(&mut ctx, params)
    }

    /// Pick up id counters, durable exports and the imports baggage still
    /// refers to, left by an earlier incarnation.
    fn load_durable_state(&mut self, syscall: &mut dyn Syscall) -> Result<(), VatError> {
        let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
        let counters = match ctx.vatstore_get(ID_COUNTERS_KEY)? {
            Some(json) => Some(
                serde_json::from_str::<IdCounters>(&json)
                    .map_err(|err| VatError::Codec(err.to_string()))?,
            ),
            None => None,
        };
        let mut durable = Vec::new();
        let mut prior = DURABLE_PREFIX.to_string();
        while let Some(key) = ctx.vatstore_next_key(&prior)? {
            let Some(text) = key.strip_prefix(DURABLE_PREFIX) else {
                break;
            };
            if let Ok(vref) = text.parse::<VatSlot>() {
                durable.push(vref);
            }
            prior = key;
        }
        let mut kept = Vec::new();
        let mut prior = BAGGAGE_PREFIX.to_string();
        while let Some(key) = ctx.vatstore_next_key(&prior)? {
            if !key.starts_with(BAGGAGE_PREFIX) {
                break;
            }
            if let Some(json) = ctx.vatstore_get(&key)? {
                let data: CapData<VatSlot> =
                    serde_json::from_str(&json).map_err(|err| VatError::Codec(err.to_string()))?;
                kept.extend(data.slots().iter().copied().filter(|vref| vref.is_object() && vref.is_import()));
            }
            prior = key;
        }
        if let Some(counters) = counters {
            self.slots.ids = counters;
            self.slots.persisted_ids = Some(counters);
        }
        for vref in durable {
            self.slots.exports.insert(
                vref,
                ExportState {
                    kernel_reachable: true,
                    held: true,
                    announced: true,
                },
            );
        }
        for vref in kept {
            let state = self.slots.imports.entry(vref).or_insert(ImportState {
                dropped: true,
                ..ImportState::default()
            });
            state.baggage += 1;
        }
        Ok(())
    }

    fn persist_ids(&mut self, syscall: &mut dyn Syscall) -> Result<(), VatError> {
        if self.slots.persisted_ids == Some(self.slots.ids) {
            return Ok(());
        }
        let json =
            serde_json::to_string(&self.slots.ids).map_err(|err| VatError::Codec(err.to_string()))?;
        let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
        ctx.vatstore_set(ID_COUNTERS_KEY, &json)?;
        self.slots.persisted_ids = Some(self.slots.ids);
        Ok(())
    }

    fn deliver_message(
        &mut self,
        syscall: &mut dyn Syscall,
        target: VatSlot,
        msg: Message<VatSlot>,
    ) -> Result<(), VatError> {
        let fresh = self.slots.note_inbound(msg.args.slots());
        if target.is_promise() {
            return self.queue_pipelined(syscall, target, msg, fresh);
        }
        let result = msg.result;
        let reply = {
            let mut ctx = VatCtx::new(syscall, &mut self.slots, result);
            for vpid in fresh {
                ctx.subscribe(vpid)?;
            }
            if ctx.is_export(&target) {
                self.vat.deliver(&mut ctx, target, &msg.method, &msg.args)
            } else {
                Err(VatError::rejected(format!("no such object {target}")))
            }
        };
        self.settle_result(syscall, result, reply)
    }

    fn queue_pipelined(
        &mut self,
        syscall: &mut dyn Syscall,
        target: VatSlot,
        msg: Message<VatSlot>,
        fresh: Vec<VatSlot>,
    ) -> Result<(), VatError> {
        let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
        for vpid in fresh {
            ctx.subscribe(vpid)?;
        }
        if !ctx.decides(&target) {
            if let Some(result) = msg.result {
                ctx.reject(result, CapData::error(format!("cannot pipeline to {target}")))?;
            }
            return Ok(());
        }
        if let Some(result) = msg.result {
            self.slots.decided.insert(result);
        }
        self.slots.pipelined.entry(target).or_default().push(msg);
        Ok(())
    }

    fn settle_result(
        &mut self,
        syscall: &mut dyn Syscall,
        result: Option<VatSlot>,
        reply: Result<Reply, VatError>,
    ) -> Result<(), VatError> {
        let Some(result) = result else {
            return reply.map(|_| ()).or_else(|err| {
                if err.is_application() { Ok(()) } else { Err(err) }
            });
        };
        match reply {
            Ok(Reply::Pending) => {
                if !self.slots.settled_now.contains(&result) {
                    self.slots.decided.insert(result);
                }
                Ok(())
            }
            Ok(Reply::Value(data)) => VatCtx::new(syscall, &mut self.slots, None).resolve(result, data),
            Err(err) if err.is_application() => VatCtx::new(syscall, &mut self.slots, None)
                .reject(result, CapData::error(err.to_string())),
            Err(err) => Err(err),
        }
    }

    fn notify(
        &mut self,
        syscall: &mut dyn Syscall,
        resolutions: &[Resolution<VatSlot>],
    ) -> Result<(), VatError> {
        for resolution in resolutions {
            self.slots.watched.remove(&resolution.promise);
        }
        for resolution in resolutions {
            let fresh = self.slots.note_inbound(resolution.data.slots());
            let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
            for vpid in fresh {
                ctx.subscribe(vpid)?;
            }
            let outcome = self.vat.notify(
                &mut ctx,
                resolution.promise,
                resolution.rejected,
                &resolution.data,
            );
            match outcome {
                Err(err) if !err.is_application() => return Err(err),
                _ => {}
            }
        }
        Ok(())
    }

    fn drain_local(&mut self, syscall: &mut dyn Syscall) -> Result<(), VatError> {
        while let Some((target, msg)) = self.slots.local.pop_front() {
            self.deliver_message(syscall, target, msg)?;
        }
        Ok(())
    }

    /// Report imports released since the last sweep and retire exports
    /// nobody can reach anymore.
    fn bring_out_your_dead(&mut self, syscall: &mut dyn Syscall) -> Result<(), VatError> {
        let to_drop: Vec<VatSlot> = self
            .slots
            .imports
            .iter()
            .filter(|(_, state)| state.is_dead() && !state.reported)
            .map(|(vref, _)| *vref)
            .collect();
        let to_retire: Vec<VatSlot> = self
            .slots
            .imports
            .iter()
            .filter(|(vref, state)| state.is_dead() && !self.slots.weak.contains_key(vref))
            .map(|(vref, _)| *vref)
            .collect();
        let dead_exports: Vec<VatSlot> = self
            .slots
            .exports
            .iter()
            .filter(|(vref, state)| {
                !state.held && !state.kernel_reachable && state.announced && **vref != VatSlot::root()
            })
            .map(|(vref, _)| *vref)
            .collect();

        let mut ctx = VatCtx::new(syscall, &mut self.slots, None);
        if !to_drop.is_empty() {
            ctx.raw(VatSyscall::DropImports {
                vrefs: to_drop.clone(),
            })?;
        }
        if !to_retire.is_empty() {
            ctx.raw(VatSyscall::RetireImports {
                vrefs: to_retire.clone(),
            })?;
        }
        if !dead_exports.is_empty() {
            ctx.raw(VatSyscall::RetireExports {
                vrefs: dead_exports.clone(),
            })?;
        }
        for vref in &to_drop {
            if let Some(state) = self.slots.imports.get_mut(vref) {
                state.reported = true;
            }
        }
        for vref in &to_retire {
            self.slots.imports.remove(vref);
        }
        for vref in &dead_exports {
            self.slots.exports.remove(vref);
        }
        Ok(())
    }
}

impl<V: Vat> Dispatch for LiveslotsDispatch<V> {
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> DeliveryStatus {
        match self.run(delivery, syscall) {
            Ok(()) => DeliveryStatus::Ok,
            Err(err) => DeliveryStatus::error(err.to_string()),
        }
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, String> {
        let image = ImageRef {
            slots: &self.slots,
            vat: &self.vat,
        };
        serde_cbor::to_vec(&image).map_err(|err| err.to_string())
    }
}

/// Records syscalls and keeps a private vatstore; used by unit tests.
#[cfg(test)]
pub(crate) struct RecordingSyscall {
    pub calls: Vec<VatSyscall>,
    pub store: BTreeMap<String, String>,
}

#[cfg(test)]
impl RecordingSyscall {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            store: BTreeMap::new(),
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.calls.iter().map(|c| c.kind()).collect()
    }
}

#[cfg(test)]
impl Syscall for RecordingSyscall {
    fn call(&mut self, syscall: VatSyscall) -> swing_abi::SyscallResult {
        use swing_abi::SyscallResult;
        let result = match &syscall {
            VatSyscall::VatstoreGet { key } => SyscallResult::Value {
                value: self.store.get(key).cloned(),
            },
            VatSyscall::VatstoreGetNextKey { prior } => SyscallResult::Value {
                value: self
                    .store
                    .range::<String, _>((
                        std::ops::Bound::Excluded(prior.clone()),
                        std::ops::Bound::Unbounded,
                    ))
                    .next()
                    .map(|(k, _)| k.clone()),
            },
            VatSyscall::VatstoreSet { key, value } => {
                self.store.insert(key.clone(), value.clone());
                SyscallResult::Ok
            }
            VatSyscall::VatstoreDelete { key } => {
                self.store.remove(key);
                SyscallResult::Ok
            }
            _ => SyscallResult::Ok,
        };
        self.calls.push(syscall);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Serialize, Deserialize)]
    struct Echo {
        seen: u32,
        held: Vec<VatSlot>,
    }

    impl Vat for Echo {
        fn deliver(
            &mut self,
            ctx: &mut VatCtx<'_>,
            _target: VatSlot,
            method: &str,
            args: &CapData<VatSlot>,
        ) -> Result<Reply, VatError> {
            self.seen += 1;
            match method {
                "echo" => Ok(Reply::Value(args.clone())),
                "fail" => Err(VatError::rejected("nope")),
                "hold" => {
                    self.held.extend(args.slots().iter().copied());
                    Ok(Reply::Value(CapData::null()))
                }
                "release" => {
                    for vref in self.held.drain(..) {
                        ctx.release(vref);
                    }
                    Ok(Reply::Value(CapData::null()))
                }
                "remember" => {
                    let vref = args.slots()[0];
                    ctx.weak_set(vref, Value::Int(1));
                    for vref in self.held.drain(..) {
                        ctx.release(vref);
                    }
                    Ok(Reply::Value(CapData::null()))
                }
                "later" => Ok(Reply::Pending),
                "stash" => {
                    ctx.baggage_set_data("kept", args)?;
                    Ok(Reply::Value(CapData::null()))
                }
                _ => Err(VatError::Fatal(format!("unknown method {method}"))),
            }
        }
    }

    fn message(method: &str, args: CapData<VatSlot>, result: Option<VatSlot>) -> VatDelivery {
        VatDelivery::Message {
            target: VatSlot::root(),
            msg: Message::new(method, args, result),
        }
    }

    fn started() -> (LiveslotsDispatch<Echo>, RecordingSyscall) {
        let mut dispatch = LiveslotsDispatch::new(Echo::default());
        let mut sys = RecordingSyscall::new();
        let status = dispatch.deliver(
            &VatDelivery::StartVat {
                params: CapData::null(),
            },
            &mut sys,
        );
        assert_eq!(status, DeliveryStatus::Ok);
        sys.calls.clear();
        (dispatch, sys)
    }

    #[test]
    fn reply_resolves_result_promise() {
        let (mut dispatch, mut sys) = started();
        let result = VatSlot::promise_import(1);
        let status = dispatch.deliver(&message("echo", CapData::int(5), Some(result)), &mut sys);
        assert_eq!(status, DeliveryStatus::Ok);
        assert_eq!(
            sys.calls,
            vec![VatSyscall::Resolve {
                resolutions: vec![Resolution::fulfill(result, CapData::int(5))]
            }]
        );
    }

    #[test]
    fn application_error_rejects_result() {
        let (mut dispatch, mut sys) = started();
        let result = VatSlot::promise_import(2);
        dispatch.deliver(&message("fail", CapData::null(), Some(result)), &mut sys);
        assert_eq!(
            sys.calls,
            vec![VatSyscall::Resolve {
                resolutions: vec![Resolution::reject(result, CapData::error("nope"))]
            }]
        );
    }

    #[test]
    fn fatal_error_fails_delivery() {
        let (mut dispatch, mut sys) = started();
        let status = dispatch.deliver(&message("bogus", CapData::null(), None), &mut sys);
        assert!(!status.is_ok());
    }

    #[test]
    fn pending_reply_marks_result_decided() {
        let (mut dispatch, mut sys) = started();
        let result = VatSlot::promise_import(3);
        dispatch.deliver(&message("later", CapData::null(), Some(result)), &mut sys);
        assert!(sys.calls.is_empty());
        assert!(dispatch.slots().decides(&result));
    }

    #[test]
    fn released_imports_are_reported_at_bring_out_your_dead() {
        let (mut dispatch, mut sys) = started();
        let import = VatSlot::import(7);
        dispatch.deliver(&message("hold", CapData::single(import), None), &mut sys);
        dispatch.deliver(&message("release", CapData::null(), None), &mut sys);
        sys.calls.clear();

        dispatch.deliver(&VatDelivery::BringOutYourDead, &mut sys);
        assert_eq!(sys.kinds(), vec!["dropImports", "retireImports"]);
        assert!(!dispatch.slots().is_import(&import));

        sys.calls.clear();
        dispatch.deliver(&VatDelivery::BringOutYourDead, &mut sys);
        assert!(sys.calls.is_empty());
    }

    #[test]
    fn weakly_held_imports_stay_recognizable() {
        let (mut dispatch, mut sys) = started();
        let import = VatSlot::import(8);
        dispatch.deliver(&message("hold", CapData::single(import), None), &mut sys);
        dispatch.deliver(&message("remember", CapData::single(import), None), &mut sys);
        sys.calls.clear();

        dispatch.deliver(&VatDelivery::BringOutYourDead, &mut sys);
        assert_eq!(sys.kinds(), vec!["dropImports"]);
        assert!(dispatch.slots().is_import(&import));

        dispatch.deliver(
            &VatDelivery::RetireImports {
                vrefs: vec![import],
            },
            &mut sys,
        );
        assert!(!dispatch.slots().is_import(&import));
        assert!(dispatch.slots().weak.is_empty());
    }

    #[test]
    fn stop_drops_imports_that_only_the_heap_held() {
        let (mut dispatch, mut sys) = started();
        let loose = VatSlot::import(7);
        let kept = VatSlot::import(8);
        dispatch.deliver(&message("hold", CapData::single(loose), None), &mut sys);
        dispatch.deliver(&message("hold", CapData::single(kept), None), &mut sys);
        dispatch.deliver(&message("stash", CapData::single(kept), None), &mut sys);
        sys.calls.clear();

        let status = dispatch.deliver(&VatDelivery::StopVat { info: CapData::null() }, &mut sys);
        assert_eq!(status, DeliveryStatus::Ok);
        assert!(sys.calls.contains(&VatSyscall::DropImports { vrefs: vec![loose] }));
        assert!(sys.calls.contains(&VatSyscall::RetireImports { vrefs: vec![loose] }));
        assert!(dispatch.slots().is_import(&kept));
        assert!(!dispatch.slots().is_import(&loose));

        let mut next = LiveslotsDispatch::new(Echo::default());
        next.deliver(&VatDelivery::StartVat { params: CapData::null() }, &mut sys);
        assert!(next.slots().is_import(&kept));
        assert_eq!(next.slots().imports[&kept].baggage, 1);
    }

    #[test]
    fn inbound_promises_are_subscribed() {
        let (mut dispatch, mut sys) = started();
        let vpid = VatSlot::promise_import(4);
        dispatch.deliver(&message("hold", CapData::single(vpid), None), &mut sys);
        assert_eq!(sys.calls[0], VatSyscall::Subscribe { vpid });
    }

    #[test]
    fn snapshot_restores_vat_and_slots() {
        let (mut dispatch, mut sys) = started();
        dispatch.deliver(&message("hold", CapData::single(VatSlot::import(3)), None), &mut sys);
        let bytes = dispatch.snapshot().unwrap();

        let mut restored = LiveslotsDispatch::<Echo>::restore(&bytes).unwrap();
        assert_eq!(restored.vat().seen, 1);
        assert!(restored.slots().is_import(&VatSlot::import(3)));
        assert_eq!(restored.snapshot().unwrap(), bytes);
    }

    #[test]
    fn pipelined_messages_follow_resolution() {
        #[derive(Default, Serialize, Deserialize)]
        struct Forwarder {
            pending: Option<VatSlot>,
        }

        impl Vat for Forwarder {
            fn deliver(
                &mut self,
                ctx: &mut VatCtx<'_>,
                _target: VatSlot,
                method: &str,
                args: &CapData<VatSlot>,
            ) -> Result<Reply, VatError> {
                match method {
                    "defer" => {
                        self.pending = ctx.result();
                        Ok(Reply::Pending)
                    }
                    "settle" => {
                        if let Some(vpid) = self.pending.take() {
                            ctx.resolve(vpid, CapData::single(args.slots()[0]))?;
                        }
                        Ok(Reply::Value(CapData::null()))
                    }
                    _ => Ok(Reply::Value(CapData::null())),
                }
            }
        }

        let mut dispatch = LiveslotsDispatch::new(Forwarder::default());
        let mut sys = RecordingSyscall::new();
        dispatch.deliver(&VatDelivery::StartVat { params: CapData::null() }, &mut sys);
        let deferred = VatSlot::promise_import(1);
        dispatch.deliver(
            &VatDelivery::Message {
                target: VatSlot::root(),
                msg: Message::new("defer", CapData::null(), Some(deferred)),
            },
            &mut sys,
        );
        let piped_result = VatSlot::promise_import(2);
        dispatch.deliver(
            &VatDelivery::Message {
                target: deferred,
                msg: Message::new("ping", CapData::null(), Some(piped_result)),
            },
            &mut sys,
        );
        sys.calls.clear();

        let elsewhere = VatSlot::import(9);
        dispatch.deliver(
            &VatDelivery::Message {
                target: VatSlot::root(),
                msg: Message::new("settle", CapData::single(elsewhere), None),
            },
            &mut sys,
        );
        assert_eq!(sys.kinds(), vec!["resolve", "send"]);
        assert_eq!(
            sys.calls[1],
            VatSyscall::Send {
                target: elsewhere,
                msg: Message::new("ping", CapData::null(), Some(piped_result)),
            }
        );
    }
}
