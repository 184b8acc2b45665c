use super::*;

impl Kernel {
    /// Carry out one selected event. References held by the event are
    /// released by the caller.
    pub(crate) fn process_event(&mut self, event: &RunQueueEvent, results: &mut CrankResults) -> Result<(), KernelError> {
        match event {
            RunQueueEvent::Send { target, msg } => self.route_send(*target, msg.clone(), results),
            RunQueueEvent::Notify { vat, kpid } => self.deliver_notify(*vat, *kpid, results),
            RunQueueEvent::DropExports { vat, krefs } => self.deliver_drop_exports(*vat, krefs, results),
            RunQueueEvent::RetireExports { vat, krefs } => self.deliver_retire_exports(*vat, krefs, results),
            RunQueueEvent::RetireImports { vat, krefs } => self.deliver_retire_imports(*vat, krefs, results),
            RunQueueEvent::CreateVat {
                vat,
                source,
                params,
                options,
            } => self.process_create_vat(*vat, source, params.clone(), options, results),
            RunQueueEvent::UpgradeVat {
                vat,
                source,
                params,
                message,
                ..
            } => self.process_upgrade_vat(*vat, source, params.clone(), message.clone(), results),
            RunQueueEvent::TerminateVat { vat, reject, info } => {
                if self.keeper.is_vat_alive(*vat)? {
                    self.terminate_vat_now(*vat, *reject, info.clone())?;
                }
                Ok(())
            }
            RunQueueEvent::BringOutYourDead { vat } => {
                if self.keeper.is_vat_alive(*vat)? {
                    self.deliver_to_vat(*vat, VatDelivery::BringOutYourDead, results)?;
                    self.keeper.set_reap_dirt(*vat, 0);
                }
                Ok(())
            }
            RunQueueEvent::ChangeVatOptions { vat, options } => {
                if self.keeper.is_vat_alive(*vat)? {
                    let current = self.keeper.vat_options(*vat)?;
                    let options = VatOptions {
                        name: current.name,
                        ..options.clone()
                    };
                    self.keeper.set_vat_options(*vat, &options)?;
                    log::info!("{vat} options changed");
                }
                Ok(())
            }
            RunQueueEvent::NegatedGcAction => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    fn route_send(&mut self, target: KernelSlot, msg: Message<KernelSlot>, results: &mut CrankResults) -> Result<(), KernelError> {
        match target {
            KernelSlot::Object(_) => self.send_to_object(target, msg, results),
            KernelSlot::Promise(_) => self.send_to_promise(target, msg, results),
            KernelSlot::Device(_) => self.splat(msg, CapData::error("devices do not accept messages")),
        }
    }

    fn send_to_object(&mut self, target: KernelSlot, msg: Message<KernelSlot>, results: &mut CrankResults) -> Result<(), KernelError> {
        match self.keeper.object_owner(target)? {
            Some(vat) if self.keeper.is_vat_alive(vat)? => self.deliver_message(vat, target, msg, results),
            _ => {
                log::debug!("{target}.{} has no live owner", msg.method);
                self.splat(msg, CapData::error("vat terminated"))
            }
        }
    }

    fn send_to_promise(&mut self, target: KernelSlot, msg: Message<KernelSlot>, results: &mut CrankResults) -> Result<(), KernelError> {
        let end = self.keeper.chain_end(target)?;
        let promise = self.keeper.require_promise(end)?;
        match (promise.state, promise.data) {
            (PromiseState::Fulfilled, Some(data)) => match data.single_slot() {
                Some(slot) if slot.is_object() => self.send_to_object(*slot, msg, results),
                _ => {
                    let error = CapData::error(format!("data is not callable, has no method {}", msg.method));
                    self.splat(msg, error)
                }
            },
            (PromiseState::Rejected, Some(data)) => self.splat(msg, data),
            (PromiseState::Unresolved, _) => {
                let pipeline_to = match promise.decider {
                    Some(vat) if self.keeper.is_vat_alive(vat)? => {
                        self.keeper.vat_options(vat)?.enable_pipelining.then_some(vat)
                    }
                    _ => None,
                };
                match pipeline_to {
                    Some(vat) => self.deliver_message(vat, end, msg, results),
                    None => self.keeper.add_to_promise_queue(end, msg),
                }
            }
            (state, _) => Err(KernelError::panic(format!("{end} is {state} at the end of its chain"))),
        }
    }

    fn deliver_message(
        &mut self,
        vat: VatId,
        target: KernelSlot,
        msg: Message<KernelSlot>,
        results: &mut CrankResults,
    ) -> Result<(), KernelError> {
        if let Some(result) = msg.result {
            if self.keeper.promise_state(result)? == Some(PromiseState::Unresolved) {
                self.keeper.set_decider(result, Some(vat));
            }
        }
        let target = self.keeper.map_kernel_slot_to_vat(vat, target)?;
        let msg = msg.try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat(vat, kref))?;
        self.deliver_to_vat(vat, VatDelivery::Message { target, msg }, results)
    }

    /// Reject a message's result promise instead of delivering it.
    fn splat(&mut self, msg: Message<KernelSlot>, error: CapData<KernelSlot>) -> Result<(), KernelError> {
        let Some(result) = msg.result else {
            return Ok(());
        };
        if self.keeper.promise_state(result)? == Some(PromiseState::Unresolved) {
            self.keeper.settle_promise(result, true, error)?;
        }
        Ok(())
    }

    fn deliver_notify(&mut self, vat: VatId, kpid: KernelSlot, results: &mut CrankResults) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        let Some(entry) = self.keeper.clist_entry(vat, kpid)? else {
            log::debug!("{vat} no longer knows {kpid}; notify dropped");
            return Ok(());
        };
        let promise = self.keeper.require_promise(kpid)?;
        let data = match (promise.state.is_settled(), promise.data) {
            (true, Some(data)) => data,
            _ => {
                log::debug!("{kpid} is {}; notify dropped", promise.state);
                return Ok(());
            }
        };
        let rejected = promise.state == PromiseState::Rejected;
        let data = data.try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat(vat, kref))?;
        self.keeper.delete_clist_entry(vat, kpid)?;
        let resolution = Resolution {
            promise: entry.vref,
            rejected,
            data,
        };
        self.deliver_to_vat(
            vat,
            VatDelivery::Notify {
                resolutions: vec![resolution],
            },
            results,
        )
    }

    // ---------------------------------------------------------------------
    // GC deliveries
    // ---------------------------------------------------------------------

    fn deliver_drop_exports(&mut self, vat: VatId, krefs: &[KernelSlot], results: &mut CrankResults) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        let mut vrefs = Vec::new();
        for kref in krefs {
            if let Some(entry) = self.keeper.clist_entry(vat, *kref)? {
                self.keeper.clear_reachable_flag(vat, *kref)?;
                vrefs.push(entry.vref);
            }
        }
        if vrefs.is_empty() {
            return Ok(());
        }
        self.deliver_to_vat(vat, VatDelivery::DropExports { vrefs }, results)
    }

    fn deliver_retire_exports(&mut self, vat: VatId, krefs: &[KernelSlot], results: &mut CrankResults) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        let mut vrefs = Vec::new();
        let mut retired = Vec::new();
        for kref in krefs {
            if let Some(entry) = self.keeper.delete_clist_entry(vat, *kref)? {
                vrefs.push(entry.vref);
                retired.push(*kref);
            }
        }
        if vrefs.is_empty() {
            return Ok(());
        }
        self.deliver_to_vat(vat, VatDelivery::RetireExports { vrefs }, results)?;
        for kref in retired {
            self.keeper.retire_kernel_object(kref)?;
        }
        Ok(())
    }

    fn deliver_retire_imports(&mut self, vat: VatId, krefs: &[KernelSlot], results: &mut CrankResults) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        let mut vrefs = Vec::new();
        for kref in krefs {
            if let Some(entry) = self.keeper.delete_clist_entry(vat, *kref)? {
                vrefs.push(entry.vref);
            }
        }
        if vrefs.is_empty() {
            return Ok(());
        }
        self.deliver_to_vat(vat, VatDelivery::RetireImports { vrefs }, results)
    }
}
