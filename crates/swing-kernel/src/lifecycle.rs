//! Vat creation, upgrade and termination.

use crate::config::VatOptions;
use crate::error::KernelError;
use crate::kernel::{CrankResults, Kernel};
use crate::keeper::TerminationRecord;
use crate::manager::start_worker;
use crate::registry::PromiseState;
use crate::run_queue::RunQueueEvent;
use crate::transcript::{PseudoDelivery, TranscriptItem};
use crate::vat::VatSource;
use serde::Serialize;
use swing_abi::{CapData, KernelSlot, Value, VatDelivery, VatId, VatSlot};

/// Lifecycle transitions reported to the host through
/// [`Kernel::drain_lifecycle_events`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LifecycleEvent {
    VatCreated {
        vat: VatId,
        name: String,
    },
    VatCreateFailed {
        vat: VatId,
        error: String,
    },
    VatUpgraded {
        vat: VatId,
        upgrade_id: u64,
        incarnation: u64,
    },
    VatUpgradeFailed {
        vat: VatId,
        upgrade_id: u64,
        error: String,
    },
    VatTerminated {
        vat: VatId,
        reject: bool,
        info: Value,
    },
}

impl Kernel {
    // ---------------------------------------------------------------------
    // Host requests
    // ---------------------------------------------------------------------

    /// Register a new vat and queue its creation. The id is usable at once;
    /// the vat starts when the `CreateVat` event reaches the front of the
    /// run queue.
    pub fn create_vat(
        &mut self,
        name: &str,
        bundle: &str,
        params: CapData<KernelSlot>,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        self.check_usable()?;
        if !self.registry.contains(bundle) {
            return Err(KernelError::UnknownBundle(bundle.to_string()));
        }
        if name.is_empty() {
            return Err(KernelError::Invalid("vat name must not be empty".into()));
        }
        self.check_krefs(params.slots())?;
        let vat = self.keeper.allocate_vat_id()?;
        self.keeper.add_vat(name, vat)?;
        let options = VatOptions {
            name: name.to_string(),
            ..options
        };
        let source = VatSource::bundle(bundle);
        self.keeper.set_vat_options(vat, &options)?;
        self.keeper.set_vat_source(vat, &source)?;
        self.keeper.enqueue(RunQueueEvent::CreateVat {
            vat,
            source,
            params,
            options,
        })?;
        log::debug!("queued creation of {vat} ({name}) from bundle {bundle}");
        Ok(vat)
    }

    /// Queue an upgrade of `vat` to `bundle`. Returns the upgrade id that
    /// the matching lifecycle event will carry.
    pub fn upgrade_vat(
        &mut self,
        vat: VatId,
        bundle: &str,
        params: CapData<KernelSlot>,
        message: Value,
    ) -> Result<u64, KernelError> {
        self.check_usable()?;
        if !self.keeper.is_vat_alive(vat)? {
            return Err(KernelError::VatTerminated(vat));
        }
        if !self.registry.contains(bundle) {
            return Err(KernelError::UnknownBundle(bundle.to_string()));
        }
        self.check_krefs(params.slots())?;
        // the message travels to the vat as pure data
        CapData::<KernelSlot>::data(message.clone())?;
        let upgrade_id = self.keeper.allocate("upgrade.nextID")?;
        self.keeper.enqueue(RunQueueEvent::UpgradeVat {
            vat,
            upgrade_id,
            source: VatSource::bundle(bundle),
            params,
            message,
        })?;
        log::debug!("queued upgrade {upgrade_id} of {vat} to bundle {bundle}");
        Ok(upgrade_id)
    }

    /// Queue termination of `vat`. Promises it decides are rejected with
    /// `info`.
    pub fn terminate_vat(&mut self, vat: VatId, info: CapData<KernelSlot>) -> Result<(), KernelError> {
        self.check_usable()?;
        if !self.keeper.is_vat_alive(vat)? {
            return Err(KernelError::VatTerminated(vat));
        }
        self.check_krefs(info.slots())?;
        self.keeper.enqueue(RunQueueEvent::TerminateVat {
            vat,
            reject: true,
            info,
        })
    }

    // ---------------------------------------------------------------------
    // Crank handlers
    // ---------------------------------------------------------------------

    /// Build a fresh worker for the vat's current source and put it online.
    /// Returns false when the worker could not be built.
    fn start_fresh_worker(
        &mut self,
        vat: VatId,
        source: &VatSource,
        options: &VatOptions,
        results: &mut CrankResults,
    ) -> Result<bool, KernelError> {
        results.vat = Some(vat);
        let bundle = match self.registry.get(&source.bundle) {
            Ok(bundle) => bundle,
            Err(err) => {
                results.delivery_error = Some(err.to_string());
                return Ok(false);
            }
        };
        let manager = options.manager_type.unwrap_or(self.config.default_manager);
        let worker = match start_worker(manager, vat, bundle, None) {
            Ok(worker) => worker,
            Err(KernelError::Worker(message)) => {
                results.delivery_error = Some(message);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        self.warehouse.insert(&self.keeper, vat, worker)?;
        Ok(true)
    }

    pub(crate) fn process_create_vat(
        &mut self,
        vat: VatId,
        source: &VatSource,
        params: CapData<KernelSlot>,
        options: &VatOptions,
        results: &mut CrankResults,
    ) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        self.keeper.set_incarnation(vat, 0);
        if options.use_transcript {
            self.keeper.store_mut().init_transcript(&vat.to_string(), 0)?;
            self.add_transcript_item(
                vat,
                &TranscriptItem::pseudo(PseudoDelivery::InitializeWorker { incarnation: 0 }),
            )?;
        }
        if !self.start_fresh_worker(vat, source, options, results)? {
            return Ok(());
        }
        let root = self.keeper.add_kernel_object(Some(vat))?;
        self.keeper.add_clist_entry(vat, root, VatSlot::root(), true)?;
        self.keeper.pin_object(root)?;
        let params = params.try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat(vat, kref))?;
        self.deliver_to_vat(vat, VatDelivery::StartVat { params }, results)
    }

    pub(crate) fn process_upgrade_vat(
        &mut self,
        vat: VatId,
        source: &VatSource,
        params: CapData<KernelSlot>,
        message: Value,
        results: &mut CrankResults,
    ) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            log::warn!("upgrade of terminated {vat} ignored");
            return Ok(());
        }
        self.deliver_to_vat(vat, VatDelivery::BringOutYourDead, results)?;
        if results.aborted() || results.exit.is_some() {
            return Ok(());
        }
        self.keeper.set_reap_dirt(vat, 0);
        let old_incarnation = self.keeper.incarnation(vat)?;
        let info = CapData::data(message.clone())?;
        self.deliver_to_vat(vat, VatDelivery::StopVat { info }, results)?;
        if results.aborted() || results.exit.is_some() {
            return Ok(());
        }

        self.disconnect_for_upgrade(vat, message, old_incarnation)?;
        self.warehouse.evict(vat);
        let options = self.keeper.vat_options(vat)?;
        let incarnation = old_incarnation + 1;
        if options.use_transcript {
            let key = vat.to_string();
            self.keeper.store_mut().rollover_incarnation(&key)?;
            self.keeper.store_mut().stop_using_snapshot(&key)?;
        }
        self.keeper.set_vat_source(vat, source)?;
        self.keeper.set_incarnation(vat, incarnation);
        self.add_transcript_item(
            vat,
            &TranscriptItem::pseudo(PseudoDelivery::InitializeWorker { incarnation }),
        )?;
        if !self.start_fresh_worker(vat, source, &options, results)? {
            return Ok(());
        }
        let params = params.try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat(vat, kref))?;
        self.deliver_to_vat(vat, VatDelivery::StartVat { params }, results)
    }

    /// Cut the old incarnation loose: reject what it was deciding, forget
    /// its promises, and abandon exports that do not survive. Imports stay;
    /// the old incarnation dropped the ones its baggage does not refer to
    /// when it stopped.
    fn disconnect_for_upgrade(&mut self, vat: VatId, message: Value, old_incarnation: u64) -> Result<(), KernelError> {
        let record = Value::record([
            ("name", Value::text("vatUpgraded")),
            ("upgradeMessage", message),
            (
                "incarnationNumber",
                Value::Int(i64::try_from(old_incarnation).unwrap_or(i64::MAX)),
            ),
        ]);
        let disconnect = CapData::data(record)?;
        let mut abandoned = 0;
        for (kref, entry) in self.keeper.clist_entries(vat)? {
            match kref {
                KernelSlot::Promise(_) => {
                    if self.decides_unresolved(vat, kref)? {
                        self.keeper.settle_promise(kref, true, disconnect.clone())?;
                    }
                    self.keeper.delete_clist_entry(vat, kref)?;
                }
                KernelSlot::Object(_) if is_ephemeral_export(&entry.vref) => {
                    self.keeper.delete_clist_entry(vat, kref)?;
                    self.keeper.orphan_object(kref);
                    abandoned += 1;
                }
                _ => {}
            }
        }
        log::debug!("{vat} upgrade abandoned {abandoned} ephemeral exports");
        Ok(())
    }

    fn decides_unresolved(&self, vat: VatId, kpid: KernelSlot) -> Result<bool, KernelError> {
        let promise = self.keeper.require_promise(kpid)?;
        Ok(promise.decider == Some(vat) && promise.state == PromiseState::Unresolved)
    }

    /// Terminate a vat within the current crank.
    pub(crate) fn terminate_vat_now(
        &mut self,
        vat: VatId,
        reject: bool,
        info: CapData<KernelSlot>,
    ) -> Result<(), KernelError> {
        let options = self.keeper.vat_options(vat)?;
        if options.critical {
            return Err(KernelError::panic(format!(
                "critical vat {vat} ({}) terminated: {:?}",
                options.name,
                info.body()
            )));
        }
        let rejection = if *info.body() == Value::Null {
            CapData::error("vat terminated")
        } else {
            info.clone()
        };
        let entries = self.keeper.clist_entries(vat)?;
        for (kref, _) in &entries {
            if kref.is_promise() && self.decides_unresolved(vat, *kref)? {
                self.keeper.settle_promise(*kref, true, rejection.clone())?;
            }
        }
        self.keeper.freeze_clist(vat, &entries);
        for (kref, entry) in &entries {
            self.keeper.delete_clist_entry(vat, *kref)?;
            if kref.is_object() && entry.vref.is_export() {
                self.keeper.orphan_object(*kref);
            }
        }
        let body = info.body().clone();
        self.keeper.mark_vat_terminated(
            vat,
            &TerminationRecord {
                reject,
                info: body.clone(),
            },
        )?;
        if options.use_transcript {
            let key = vat.to_string();
            self.keeper.store_mut().stop_using_transcript(&key)?;
            self.keeper.store_mut().stop_using_snapshot(&key)?;
        }
        self.warehouse.evict(vat);
        log::info!("{vat} ({}) terminated (reject: {reject})", options.name);
        self.lifecycle.push(LifecycleEvent::VatTerminated {
            vat,
            reject,
            info: body,
        });
        Ok(())
    }
}

fn is_ephemeral_export(vref: &VatSlot) -> bool {
    vref.is_export() && !vref.is_durable() && *vref != VatSlot::root()
}
