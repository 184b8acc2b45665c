use crate::VatError;
use crate::liveslots::{BAGGAGE_PREFIX, DURABLE_PREFIX, SlotTable};
use swing_abi::{CapData, Message, Resolution, Syscall, SyscallResult, Value, VatSlot, VatSyscall};

/// Execution context handed to vat code for the duration of one delivery.
pub struct VatCtx<'a> {
    syscall: &'a mut dyn Syscall,
    slots: &'a mut SlotTable,
    result: Option<VatSlot>,
}

impl<'a> VatCtx<'a> {
    pub(crate) fn new(
        syscall: &'a mut dyn Syscall,
        slots: &'a mut SlotTable,
        result: Option<VatSlot>,
    ) -> Self {
        Self {
            syscall,
            slots,
            result,
        }
    }

    /// Result promise of the message being handled, if the sender asked for one.
    pub fn result(&self) -> Option<VatSlot> {
        self.result
    }

    pub fn is_export(&self, vref: &VatSlot) -> bool {
        self.slots.is_export(vref)
    }

    pub fn decides(&self, vpid: &VatSlot) -> bool {
        self.slots.decides(vpid)
    }

    pub(crate) fn raw(&mut self, syscall: VatSyscall) -> Result<SyscallResult, VatError> {
        let kind = syscall.kind();
        match self.syscall.call(syscall) {
            SyscallResult::Error { message } => Err(VatError::Syscall { kind, message }),
            other => Ok(other),
        }
    }

    fn expect_value(&mut self, syscall: VatSyscall) -> Result<Option<String>, VatError> {
        match self.raw(syscall)? {
            SyscallResult::Value { value } => Ok(value),
            other => Err(VatError::Codec(format!("unexpected syscall result {other:?}"))),
        }
    }

    // ---------------------------------------------------------------------
    // Objects and promises
    // ---------------------------------------------------------------------

    /// Allocate a new ephemeral export (`o+N`). It is discarded on upgrade.
    pub fn export(&mut self) -> VatSlot {
        self.slots.new_export(false)
    }

    /// Allocate a durable export (`o+dN`) that survives upgrades.
    pub fn export_durable(&mut self) -> Result<VatSlot, VatError> {
        let vref = self.slots.new_export(true);
        self.vatstore_set(&format!("{DURABLE_PREFIX}{vref}"), "1")?;
        Ok(vref)
    }

    /// Allocate a promise this vat will settle.
    pub fn make_promise(&mut self) -> VatSlot {
        let vpid = self.slots.new_promise();
        self.slots.decided.insert(vpid);
        vpid
    }

    /// Eventual send; returns the result promise, already subscribed.
    pub fn send(
        &mut self,
        target: VatSlot,
        method: &str,
        args: CapData<VatSlot>,
    ) -> Result<VatSlot, VatError> {
        let result = self.slots.new_promise();
        self.slots.note_outbound([&target]);
        self.slots.note_outbound(args.slots());
        self.raw(VatSyscall::Send {
            target,
            msg: Message::new(method, args, Some(result)),
        })?;
        self.subscribe(result)?;
        Ok(result)
    }

    /// Eventual send without a result promise.
    pub fn send_only(
        &mut self,
        target: VatSlot,
        method: &str,
        args: CapData<VatSlot>,
    ) -> Result<(), VatError> {
        self.slots.note_outbound([&target]);
        self.slots.note_outbound(args.slots());
        self.raw(VatSyscall::Send {
            target,
            msg: Message::new(method, args, None),
        })?;
        Ok(())
    }

    pub fn subscribe(&mut self, vpid: VatSlot) -> Result<(), VatError> {
        self.raw(VatSyscall::Subscribe { vpid })?;
        self.slots.watched.insert(vpid);
        Ok(())
    }

    pub fn resolve(&mut self, vpid: VatSlot, data: CapData<VatSlot>) -> Result<(), VatError> {
        self.settle(vpid, false, data)
    }

    pub fn reject(&mut self, vpid: VatSlot, data: CapData<VatSlot>) -> Result<(), VatError> {
        self.settle(vpid, true, data)
    }

    fn settle(&mut self, vpid: VatSlot, rejected: bool, data: CapData<VatSlot>) -> Result<(), VatError> {
        self.slots.note_outbound(data.slots());
        let resolution = Resolution {
            promise: vpid,
            rejected,
            data: data.clone(),
        };
        self.raw(VatSyscall::Resolve {
            resolutions: vec![resolution],
        })?;
        self.slots.decided.remove(&vpid);
        self.slots.settled_now.insert(vpid);
        if let Some(queued) = self.slots.pipelined.remove(&vpid) {
            for msg in queued {
                self.redirect(msg, rejected, &data)?;
            }
        }
        Ok(())
    }

    /// Forward a message that was pipelined to a promise we just settled.
    fn redirect(
        &mut self,
        msg: Message<VatSlot>,
        rejected: bool,
        data: &CapData<VatSlot>,
    ) -> Result<(), VatError> {
        if rejected {
            if let Some(result) = msg.result {
                self.settle(result, true, data.clone())?;
            }
            return Ok(());
        }
        match data.single_slot().copied() {
            Some(target) if self.slots.is_export(&target) => {
                self.slots.local.push_back((target, msg));
                Ok(())
            }
            Some(target) => {
                if let Some(result) = msg.result {
                    self.slots.decided.remove(&result);
                }
                self.slots.note_outbound(msg.args.slots());
                self.raw(VatSyscall::Send { target, msg })?;
                Ok(())
            }
            None => match msg.result {
                Some(result) => self.settle(
                    result,
                    true,
                    CapData::error(format!("data is not callable, has no method {}", msg.method)),
                ),
                None => Ok(()),
            },
        }
    }

    /// Vat code no longer holds `vref`. Drops are reported at the next
    /// bring-out-your-dead.
    pub fn release(&mut self, vref: VatSlot) {
        if let Some(state) = self.slots.imports.get_mut(&vref) {
            state.dropped = true;
        }
        let unannounced = match self.slots.exports.get_mut(&vref) {
            Some(state) => {
                state.held = false;
                !state.announced
            }
            None => false,
        };
        if unannounced {
            self.slots.exports.remove(&vref);
        }
    }

    /// Terminate this vat at the end of the crank.
    pub fn exit(&mut self, failure: bool, info: CapData<VatSlot>) -> Result<(), VatError> {
        self.raw(VatSyscall::Exit { failure, info })?;
        Ok(())
    }

    /// Synchronous device call.
    pub fn call_now(
        &mut self,
        device: VatSlot,
        method: &str,
        args: CapData<VatSlot>,
    ) -> Result<CapData<VatSlot>, VatError> {
        match self.raw(VatSyscall::CallNow {
            target: device,
            method: method.to_string(),
            args,
        })? {
            SyscallResult::Data { data } => Ok(data),
            other => Err(VatError::Codec(format!("unexpected device result {other:?}"))),
        }
    }

    // ---------------------------------------------------------------------
    // Weak side table
    // ---------------------------------------------------------------------

    /// Associate a value with a reference without keeping it reachable.
    /// The entry disappears once the kernel retires the reference.
    pub fn weak_set(&mut self, key: VatSlot, value: Value) {
        self.slots.weak.insert(key, value);
    }

    pub fn weak_get(&self, key: &VatSlot) -> Option<&Value> {
        self.slots.weak.get(key)
    }

    pub fn weak_has(&self, key: &VatSlot) -> bool {
        self.slots.weak.contains_key(key)
    }

    pub fn weak_delete(&mut self, key: &VatSlot) -> Option<Value> {
        self.slots.weak.remove(key)
    }

    // ---------------------------------------------------------------------
    // Vatstore and baggage
    // ---------------------------------------------------------------------

    pub fn vatstore_get(&mut self, key: &str) -> Result<Option<String>, VatError> {
        self.expect_value(VatSyscall::VatstoreGet {
            key: key.to_string(),
        })
    }

    pub fn vatstore_set(&mut self, key: &str, value: &str) -> Result<(), VatError> {
        self.raw(VatSyscall::VatstoreSet {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    pub fn vatstore_delete(&mut self, key: &str) -> Result<(), VatError> {
        self.raw(VatSyscall::VatstoreDelete {
            key: key.to_string(),
        })?;
        Ok(())
    }

    pub fn vatstore_next_key(&mut self, prior: &str) -> Result<Option<String>, VatError> {
        self.expect_value(VatSyscall::VatstoreGetNextKey {
            prior: prior.to_string(),
        })
    }

    /// Durable value stored under `key`; survives upgrades. References
    /// come back as bare `Slot` indices; read them with
    /// [`VatCtx::baggage_get_data`].
    pub fn baggage_get(&mut self, key: &str) -> Result<Option<Value>, VatError> {
        Ok(self.read_baggage(key)?.map(|data| data.body().clone()))
    }

    /// Stored entry together with its references. Imports read back are
    /// held by vat code until it releases them.
    pub fn baggage_get_data(&mut self, key: &str) -> Result<Option<CapData<VatSlot>>, VatError> {
        let data = self.read_baggage(key)?;
        if let Some(data) = &data {
            self.slots.note_revived(data.slots());
        }
        Ok(data)
    }

    pub fn baggage_set(&mut self, key: &str, value: &Value) -> Result<(), VatError> {
        self.baggage_set_data(key, &CapData::data(value.clone())?)
    }

    /// Store data with references. Imports, durable exports, the root and
    /// device nodes may be kept; an import stays alive across upgrades for
    /// as long as some entry refers to it.
    pub fn baggage_set_data(&mut self, key: &str, data: &CapData<VatSlot>) -> Result<(), VatError> {
        for vref in data.slots() {
            self.slots.check_durable_ref(vref)?;
        }
        let previous = self.read_baggage(key)?;
        let json = serde_json::to_string(data).map_err(|err| VatError::Codec(err.to_string()))?;
        self.vatstore_set(&format!("{BAGGAGE_PREFIX}{key}"), &json)?;
        self.slots.add_baggage_refs(data.slots());
        if let Some(previous) = previous {
            self.slots.remove_baggage_refs(previous.slots());
        }
        Ok(())
    }

    pub fn baggage_delete(&mut self, key: &str) -> Result<(), VatError> {
        let previous = self.read_baggage(key)?;
        self.vatstore_delete(&format!("{BAGGAGE_PREFIX}{key}"))?;
        if let Some(previous) = previous {
            self.slots.remove_baggage_refs(previous.slots());
        }
        Ok(())
    }

    fn read_baggage(&mut self, key: &str) -> Result<Option<CapData<VatSlot>>, VatError> {
        match self.vatstore_get(&format!("{BAGGAGE_PREFIX}{key}"))? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| VatError::Codec(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn baggage_keys(&mut self) -> Result<Vec<String>, VatError> {
        let mut keys = Vec::new();
        let mut prior = BAGGAGE_PREFIX.to_string();
        while let Some(key) = self.vatstore_next_key(&prior)? {
            let Some(name) = key.strip_prefix(BAGGAGE_PREFIX) else {
                break;
            };
            keys.push(name.to_string());
            prior = key;
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveslots::RecordingSyscall;

    #[test]
    fn baggage_round_trips_through_vatstore() {
        let mut sys = RecordingSyscall::new();
        let mut slots = SlotTable::default();
        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        ctx.baggage_set("counter", &Value::Int(7)).unwrap();
        ctx.baggage_set("name", &Value::text("alice")).unwrap();
        assert_eq!(ctx.baggage_get("counter").unwrap(), Some(Value::Int(7)));
        assert_eq!(ctx.baggage_keys().unwrap(), vec!["counter", "name"]);
        ctx.baggage_delete("name").unwrap();
        assert_eq!(ctx.baggage_get("name").unwrap(), None);
        assert!(sys.store.contains_key("baggage.counter"));
    }

    #[test]
    fn baggage_refuses_promises_and_ephemeral_exports() {
        let mut sys = RecordingSyscall::new();
        let mut slots = SlotTable::default();
        slots.ids.export = 1;
        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        assert!(matches!(
            ctx.baggage_set("x", &Value::Slot(0)),
            Err(VatError::Marshal(_))
        ));
        let ephemeral = ctx.export();
        for vref in [VatSlot::promise_import(1), ephemeral, VatSlot::import(9)] {
            assert!(matches!(
                ctx.baggage_set_data("x", &CapData::single(vref)),
                Err(VatError::Rejected(_))
            ));
        }
        assert!(sys.store.is_empty());
    }

    #[test]
    fn baggage_counts_the_imports_it_holds() {
        let mut sys = RecordingSyscall::new();
        let mut slots = SlotTable::default();
        let import = VatSlot::import(4);
        slots.note_inbound([&import]);
        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        ctx.baggage_set_data("a", &CapData::single(import)).unwrap();
        ctx.baggage_set_data("b", &CapData::single(import)).unwrap();
        ctx.release(import);
        ctx.baggage_set("a", &Value::Int(1)).unwrap();
        assert_eq!(ctx.baggage_get("b").unwrap(), Some(Value::Slot(0)));
        assert_eq!(slots.imports[&import].baggage, 1);
        assert!(slots.imports[&import].dropped);

        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        let data = ctx.baggage_get_data("b").unwrap().unwrap();
        assert_eq!(data.single_slot(), Some(&import));
        ctx.baggage_delete("b").unwrap();
        assert_eq!(slots.imports[&import].baggage, 0);
        assert!(!slots.imports[&import].dropped);
    }

    #[test]
    fn send_allocates_and_subscribes_result() {
        let mut sys = RecordingSyscall::new();
        let mut slots = SlotTable::default();
        slots.ids.promise = 1;
        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        let result = ctx.send(VatSlot::import(1), "hi", CapData::null()).unwrap();
        assert_eq!(result, VatSlot::promise_export(1));
        assert_eq!(sys.kinds(), vec!["send", "subscribe"]);
    }

    #[test]
    fn releasing_unannounced_export_forgets_it() {
        let mut sys = RecordingSyscall::new();
        let mut slots = SlotTable::default();
        slots.ids.export = 1;
        let mut ctx = VatCtx::new(&mut sys, &mut slots, None);
        let vref = ctx.export();
        ctx.release(vref);
        assert!(!ctx.is_export(&vref));
    }
}
