use super::*;

/// What a delivery's syscalls left behind.
#[derive(Debug)]
pub(crate) struct SyscallOutcome {
    pub records: Vec<SyscallRecord>,
    pub meter: Meter,
    pub illegal: Option<String>,
    pub exit: Option<(bool, CapData<KernelSlot>)>,
}

/// Kernel side of one delivery: translates and executes the vat's
/// syscalls against the store.
pub(crate) struct SyscallHandler<'a> {
    vat: VatId,
    keeper: &'a mut KernelKeeper,
    devices: &'a mut DeviceTable,
    meter: Meter,
    records: Vec<SyscallRecord>,
    illegal: Option<String>,
    failure: Option<KernelError>,
    exit: Option<(bool, CapData<KernelSlot>)>,
}

impl<'a> SyscallHandler<'a> {
    pub(crate) fn new(vat: VatId, keeper: &'a mut KernelKeeper, devices: &'a mut DeviceTable, meter: Meter) -> Self {
        Self {
            vat,
            keeper,
            devices,
            meter,
            records: Vec::new(),
            illegal: None,
            failure: None,
            exit: None,
        }
    }

    /// Surface a kernel failure hit during the delivery.
    pub(crate) fn finish(self) -> Result<SyscallOutcome, KernelError> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        Ok(SyscallOutcome {
            records: self.records,
            meter: self.meter,
            illegal: self.illegal,
            exit: self.exit,
        })
    }

    fn import_kref(&mut self, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        self.keeper.map_vat_slot_to_kernel(self.vat, vref)
    }

    fn promise_kref(&mut self, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        if !vref.is_promise() {
            return Err(SyscallError::fatal(format!("{} used {vref} as a promise", self.vat)));
        }
        self.import_kref(vref)
    }

    fn execute(&mut self, syscall: VatSyscall) -> Result<SyscallResult, SyscallError> {
        let vat = self.vat;
        match syscall {
            VatSyscall::Send { target, msg } => {
                let target = self.import_kref(target)?;
                if target.is_device() {
                    return Err(SyscallError::fatal(format!("{vat} sent a message to device {target}")));
                }
                let msg = msg.try_map_slots(|vref| self.keeper.map_vat_slot_to_kernel(vat, vref))?;
                if let Some(result) = msg.result {
                    let promise = self
                        .keeper
                        .promise(result)?
                        .ok_or_else(|| SyscallError::fatal(format!("{vat} send result {result} is not a promise")))?;
                    if promise.decider != Some(vat) || promise.state != PromiseState::Unresolved {
                        return Err(SyscallError::fatal(format!(
                            "{vat} cannot use {result} as a result: it does not decide it"
                        )));
                    }
                    self.keeper.set_decider(result, None);
                }
                log::debug!("{vat} send {target}.{}", msg.method);
                self.keeper.enqueue(RunQueueEvent::Send { target, msg })?;
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Subscribe { vpid } => {
                let kpid = self.promise_kref(vpid)?;
                let state = self
                    .keeper
                    .promise_state(kpid)?
                    .ok_or(KernelError::UnknownKref(kpid))?;
                if state.is_settled() {
                    self.keeper.enqueue(RunQueueEvent::Notify { vat, kpid })?;
                } else {
                    self.keeper.add_subscriber(kpid, vat)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Resolve { resolutions } => {
                let mut seen = BTreeSet::new();
                for resolution in &resolutions {
                    if !resolution.promise.is_promise() {
                        return Err(SyscallError::fatal(format!("{vat} resolved non-promise {}", resolution.promise)));
                    }
                    let kpid = self.keeper.lookup_vat_slot(vat, resolution.promise)?;
                    let promise = self.keeper.require_promise(kpid)?;
                    if promise.decider != Some(vat) || promise.state != PromiseState::Unresolved {
                        return Err(SyscallError::fatal(format!(
                            "{vat} is not the decider of {kpid} ({})",
                            promise.state
                        )));
                    }
                    if !seen.insert(kpid) {
                        return Err(SyscallError::fatal(format!("{vat} resolved {kpid} twice")));
                    }
                }
                let mut mapped = Vec::with_capacity(resolutions.len());
                for resolution in resolutions {
                    mapped.push(resolution.try_map_slots(|vref| self.keeper.map_vat_slot_to_kernel(vat, vref))?);
                }
                for resolution in &mapped {
                    self.keeper
                        .resolve_promise(resolution.promise, resolution.rejected, resolution.data.clone())?;
                }
                for resolution in &mapped {
                    self.keeper.delete_clist_entry(vat, resolution.promise)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::Exit { failure, info } => {
                let info = info.try_map_slots(|vref| self.keeper.map_vat_slot_to_kernel(vat, vref))?;
                if self.exit.is_none() {
                    self.exit = Some((failure, info));
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreGet { key } => Ok(SyscallResult::Value {
                value: self.keeper.vatstore_get(vat, &key)?,
            }),
            VatSyscall::VatstoreGetNextKey { prior } => Ok(SyscallResult::Value {
                value: self.keeper.vatstore_next_key(vat, &prior)?,
            }),
            VatSyscall::VatstoreSet { key, value } => {
                self.keeper.vatstore_set(vat, &key, &value);
                Ok(SyscallResult::Ok)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.keeper.vatstore_delete(vat, &key);
                Ok(SyscallResult::Ok)
            }
            VatSyscall::DropImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_import(vref, "dropImports")?;
                    self.keeper.clear_reachable_flag(vat, kref)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_import(vref, "retireImports")?;
                    let reachable = self.keeper.clist_entry(vat, kref)?.is_some_and(|entry| entry.reachable);
                    if reachable {
                        return Err(SyscallError::fatal(format!("{vat} retired {vref} while still reachable")));
                    }
                    self.keeper.delete_clist_entry(vat, kref)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::RetireExports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_export(vref, "retireExports")?;
                    let (reach, _) = self.keeper.object_refcount(kref)?.unwrap_or((0, 0));
                    if reach > 0 {
                        return Err(SyscallError::fatal(format!("{vat} retired reachable export {vref}")));
                    }
                    self.keeper.delete_clist_entry(vat, kref)?;
                    self.keeper.retire_kernel_object(kref)?;
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::AbandonExports { vrefs } => {
                for vref in vrefs {
                    let kref = self.object_export(vref, "abandonExports")?;
                    self.keeper.delete_clist_entry(vat, kref)?;
                    self.keeper.orphan_object(kref);
                }
                Ok(SyscallResult::Ok)
            }
            VatSyscall::CallNow { target, method, args } => {
                if !target.is_device() {
                    return Err(SyscallError::fatal(format!("{vat} callNow on non-device {target}")));
                }
                let device = self.keeper.lookup_vat_slot(vat, target)?;
                let args = args.try_map_slots(|vref| self.keeper.map_vat_slot_to_kernel(vat, vref))?;
                match self.devices.invoke(device, &method, args) {
                    Ok(data) => {
                        let data = data.try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat(vat, kref))?;
                        Ok(SyscallResult::Data { data })
                    }
                    Err(message) => Ok(SyscallResult::error(message)),
                }
            }
        }
    }

    fn object_import(&self, vref: VatSlot, op: &str) -> Result<KernelSlot, SyscallError> {
        if !(vref.is_object() && vref.is_import()) {
            return Err(SyscallError::fatal(format!("{}: {op} of non-import {vref}", self.vat)));
        }
        self.keeper.lookup_vat_slot(self.vat, vref)
    }

    fn object_export(&self, vref: VatSlot, op: &str) -> Result<KernelSlot, SyscallError> {
        if !(vref.is_object() && vref.is_export()) {
            return Err(SyscallError::fatal(format!("{}: {op} of non-export {vref}", self.vat)));
        }
        self.keeper.lookup_vat_slot(self.vat, vref)
    }
}

impl Syscall for SyscallHandler<'_> {
    fn call(&mut self, syscall: VatSyscall) -> SyscallResult {
        self.meter.charge_syscall(&syscall);
        // once the delivery is doomed nothing more reaches the store
        if self.illegal.is_some() || self.failure.is_some() {
            return SyscallResult::error("vat is being terminated");
        }
        let kind = syscall.kind();
        let result = match self.execute(syscall.clone()) {
            Ok(result) => result,
            Err(SyscallError::Fatal(message)) => {
                log::warn!("{} illegal {kind}: {message}", self.vat);
                self.illegal = Some(message.clone());
                SyscallResult::error(message)
            }
            Err(SyscallError::Kernel(err)) => {
                let message = err.to_string();
                self.failure = Some(err);
                SyscallResult::error(message)
            }
        };
        self.records.push(SyscallRecord {
            s: syscall,
            r: result.clone(),
        });
        result
    }
}
