use std::collections::BTreeSet;

use swing_abi::{
    CapData, DeliveryStatus, KernelSlot, Message, Resolution, Syscall, SyscallResult, VatDelivery,
    VatId, VatSlot, VatSyscall,
};
use swing_cbor::Hash;
use swing_store::SwingStore;

use crate::config::{KernelConfig, ReapInterval, VatOptions};
use crate::device::{Device, DeviceTable};
use crate::error::{KernelError, SyscallError};
use crate::invariants::{InvariantViolation, check_invariants};
use crate::keeper::{KERNEL_VERSION, KernelKeeper, KernelOptions};
use crate::lifecycle::LifecycleEvent;
use crate::metering::Meter;
use crate::policy::{CrankDetails, Exhaustion, ForeverPolicy, RunOutcome, RunPolicy};
use crate::registry::PromiseState;
use crate::run_queue::RunQueueEvent;
use crate::stats::{KernelStats, collect_stats};
use crate::transcript::{PseudoDelivery, SyscallRecord, TranscriptItem};
use crate::vat::VatRegistry;
use crate::warehouse::VatWarehouse;

mod crank;
mod delivery;
mod routing;
mod syscall;

pub(crate) use crank::CrankResults;
pub(crate) use syscall::SyscallHandler;

/// The vat kernel: owns the store, the vat warehouse and the devices, and
/// advances the system one crank at a time.
pub struct Kernel {
    pub(crate) keeper: KernelKeeper,
    pub(crate) config: KernelConfig,
    pub(crate) registry: VatRegistry,
    pub(crate) devices: DeviceTable,
    pub(crate) warehouse: VatWarehouse,
    pub(crate) lifecycle: Vec<LifecycleEvent>,
    /// Set once a crank fails in a way that leaves state untrustworthy.
    pub(crate) panicked: Option<String>,
    pub(crate) cranking: bool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("keeper", &self.keeper)
            .field("warehouse", &self.warehouse)
            .field("devices", &self.devices)
            .field("panicked", &self.panicked)
            .finish()
    }
}

pub struct KernelBuilder {
    store: SwingStore,
    config: KernelConfig,
    registry: VatRegistry,
    devices: DeviceTable,
}

impl KernelBuilder {
    pub fn new(store: SwingStore) -> Self {
        Self {
            store,
            config: KernelConfig::default(),
            registry: VatRegistry::new(),
            devices: DeviceTable::default(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: VatRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_bundle(mut self, name: impl Into<String>, bundle: impl swing_abi::VatBundle + 'static) -> Self {
        self.registry.register(name, bundle);
        self
    }

    pub fn with_device(mut self, name: impl Into<String>, device: impl Device + 'static) -> Self {
        self.devices.insert(name, Box::new(device));
        self
    }

    /// Open the kernel, initializing the store on first use.
    pub fn build(self) -> Result<Kernel, KernelError> {
        let KernelBuilder {
            store,
            config,
            registry,
            mut devices,
        } = self;
        config.validate()?;
        let mut keeper = KernelKeeper::new(store);
        if keeper.is_initialized()? {
            let version = keeper.require("version")?;
            if version != KERNEL_VERSION {
                return Err(KernelError::corrupt(format!(
                    "store has kernel version {version}, expected {KERNEL_VERSION}"
                )));
            }
            log::debug!("opened kernel at crank {}", keeper.crank_number()?);
        } else {
            keeper.initialize(&config)?;
            log::info!("initialized kernel state");
        }
        devices.attach(&mut keeper)?;
        let warehouse = VatWarehouse::new(config.max_vats_online);
        Ok(Kernel {
            keeper,
            config,
            registry,
            devices,
            warehouse,
            lifecycle: Vec::new(),
            panicked: None,
            cranking: false,
        })
    }
}

impl Kernel {
    pub fn builder(store: SwingStore) -> KernelBuilder {
        KernelBuilder::new(store)
    }

    pub fn keeper(&self) -> &KernelKeeper {
        &self.keeper
    }

    pub fn store(&self) -> &SwingStore {
        self.keeper.store()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry_mut(&mut self) -> &mut VatRegistry {
        &mut self.registry
    }

    /// Shut every worker down and hand back the store.
    pub fn into_store(mut self) -> SwingStore {
        self.warehouse.evict_all();
        self.keeper.into_store()
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.is_some()
    }

    pub(crate) fn check_usable(&self) -> Result<(), KernelError> {
        if let Some(message) = &self.panicked {
            return Err(KernelError::Panic(message.clone()));
        }
        if self.cranking {
            return Err(KernelError::Reentrant);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    pub fn has_work(&self) -> Result<bool, KernelError> {
        Ok(self.keeper.run_queue_len()? > 0
            || !self.keeper.gc_actions()?.is_empty()
            || !self.keeper.reap_queue()?.is_empty())
    }

    pub fn run_queue_len(&self) -> Result<u64, KernelError> {
        self.keeper.run_queue_len()
    }

    /// Run until the queues are empty.
    pub fn run_until_idle(&mut self) -> Result<RunOutcome, KernelError> {
        self.run(&mut ForeverPolicy)
    }

    /// Flush every change since the last commit to the durable backend.
    pub fn commit(&mut self) -> Result<usize, KernelError> {
        self.check_usable()?;
        Ok(self.keeper.store_mut().commit()?)
    }

    pub fn crank_number(&self) -> Result<u64, KernelError> {
        self.keeper.crank_number()
    }

    pub fn activity_hash(&self) -> Result<Hash, KernelError> {
        Ok(self.keeper.store().activity_hash()?)
    }

    // ---------------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------------

    pub fn vat_id(&self, name: &str) -> Result<VatId, KernelError> {
        self.keeper
            .vat_id_for_name(name)?
            .ok_or_else(|| KernelError::UnknownVat(name.to_string()))
    }

    /// Kernel object for the vat's root export `o+0`.
    pub fn vat_root(&self, vat: VatId) -> Result<Option<KernelSlot>, KernelError> {
        self.keeper.clist_kref(vat, VatSlot::root())
    }

    pub fn device_node(&self, name: &str) -> Result<KernelSlot, KernelError> {
        self.devices
            .node(name)
            .ok_or_else(|| KernelError::UnknownDevice(name.to_string()))
    }

    pub fn is_vat_alive(&self, vat: VatId) -> Result<bool, KernelError> {
        self.keeper.is_vat_alive(vat)
    }

    pub fn incarnation(&self, vat: VatId) -> Result<u64, KernelError> {
        self.keeper.incarnation(vat)
    }

    pub fn drain_lifecycle_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.lifecycle)
    }

    // ---------------------------------------------------------------------
    // Host messages
    // ---------------------------------------------------------------------

    fn check_kref(&self, kref: KernelSlot) -> Result<(), KernelError> {
        let known = match kref {
            KernelSlot::Object(_) => self.keeper.object_exists(kref)?,
            KernelSlot::Promise(_) => self.keeper.promise_state(kref)?.is_some(),
            KernelSlot::Device(_) => self.keeper.has(&format!("{kref}.owner"))?,
        };
        if known {
            Ok(())
        } else {
            Err(KernelError::UnknownKref(kref))
        }
    }

    pub(crate) fn check_krefs(&self, krefs: &[KernelSlot]) -> Result<(), KernelError> {
        krefs.iter().try_for_each(|kref| self.check_kref(*kref))
    }

    /// Queue a message with no result.
    pub fn queue_to_kref(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<(), KernelError> {
        self.check_usable()?;
        self.check_kref(target)?;
        self.check_krefs(args.slots())?;
        self.keeper.enqueue(RunQueueEvent::Send {
            target,
            msg: Message::new(method, args, None),
        })
    }

    /// Queue a message and return the promise for its result. The host
    /// holds a reference to the promise until it reads the resolution.
    pub fn invoke(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<KernelSlot, KernelError> {
        self.check_usable()?;
        self.check_kref(target)?;
        self.check_krefs(args.slots())?;
        let kpid = self.keeper.add_kernel_promise(None)?;
        self.keeper.add_external_ref(kpid)?;
        self.keeper.enqueue(RunQueueEvent::Send {
            target,
            msg: Message::new(method, args, Some(kpid)),
        })?;
        log::debug!("host invoke {target}.{method} -> {kpid}");
        Ok(kpid)
    }

    pub fn kpid_status(&self, kpid: KernelSlot) -> Result<PromiseState, KernelError> {
        self.keeper
            .promise_state(kpid)?
            .ok_or(KernelError::UnknownKref(kpid))
    }

    /// Read a settled promise's resolution. The host's hold on the promise
    /// moves to the references in the data.
    pub fn kpid_resolution(&mut self, kpid: KernelSlot) -> Result<(bool, CapData<KernelSlot>), KernelError> {
        self.check_usable()?;
        let promise = self.keeper.promise(kpid)?.ok_or(KernelError::UnknownKref(kpid))?;
        if !promise.state.is_settled() {
            return Err(KernelError::Unsettled(kpid));
        }
        let data = promise
            .data
            .ok_or_else(|| KernelError::corrupt(format!("{kpid} is settled without data")))?;
        for kref in data.slots() {
            self.keeper.add_external_ref(*kref)?;
        }
        if self.keeper.external_refs()?.contains_key(&kpid) {
            self.keeper.drop_external_ref(kpid)?;
        }
        Ok((promise.state == PromiseState::Rejected, data))
    }

    /// Release one host-held reference.
    pub fn release_kref(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        self.check_usable()?;
        self.keeper.drop_external_ref(kref)
    }

    pub fn pin_object(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        self.check_usable()?;
        self.check_kref(kref)?;
        self.keeper.pin_object(kref)
    }

    // ---------------------------------------------------------------------
    // Options and maintenance
    // ---------------------------------------------------------------------

    /// Schedule bring-out-your-dead for every live vat that has started.
    pub fn reap_all_vats(&mut self) -> Result<(), KernelError> {
        self.check_usable()?;
        for vat in self.keeper.live_vat_ids()? {
            if self.keeper.has(&format!("{vat}.incarnation"))? {
                self.keeper.schedule_reap(vat)?;
            }
        }
        Ok(())
    }

    /// Replace a vat's options at its next crank. The name never changes.
    pub fn change_vat_options(&mut self, vat: VatId, options: VatOptions) -> Result<(), KernelError> {
        self.check_usable()?;
        if !self.keeper.is_vat_alive(vat)? {
            return Err(KernelError::VatTerminated(vat));
        }
        self.keeper.enqueue(RunQueueEvent::ChangeVatOptions { vat, options })
    }

    /// Change a vat's per-crank computron limit at once, ahead of anything
    /// queued. Lets the host resume a run paused on exhaustion.
    pub fn set_computron_limit(&mut self, vat: VatId, limit: Option<u64>) -> Result<(), KernelError> {
        self.check_usable()?;
        if !self.keeper.is_vat_alive(vat)? {
            return Err(KernelError::VatTerminated(vat));
        }
        let options = VatOptions {
            crank_computron_limit: limit,
            ..self.keeper.vat_options(vat)?
        };
        self.keeper.set_vat_options(vat, &options)?;
        log::info!("{vat} computron limit set to {limit:?}");
        Ok(())
    }

    pub fn kernel_options(&self) -> Result<KernelOptions, KernelError> {
        self.keeper.kernel_options()
    }

    pub fn change_kernel_options(&mut self, options: KernelOptions) -> Result<(), KernelError> {
        self.check_usable()?;
        if options.snapshot_interval == 0 {
            return Err(KernelError::Config("snapshot_interval must be positive".into()));
        }
        if options.default_reap_interval == ReapInterval::Deliveries(0) {
            return Err(KernelError::Config("reap interval must be positive".into()));
        }
        self.keeper.set_kernel_options(&options);
        Ok(())
    }

    pub fn stats(&self) -> Result<KernelStats, KernelError> {
        collect_stats(&self.keeper)
    }

    pub fn check_invariants(&self) -> Result<Vec<InvariantViolation>, KernelError> {
        check_invariants(&self.keeper)
    }
}
