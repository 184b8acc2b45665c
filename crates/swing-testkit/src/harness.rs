use anyhow::{Context, Result, bail};
use swing_abi::{CapData, KernelSlot, VatId};
use swing_kernel::{Device, Kernel, KernelConfig, VatOptions, VatRegistry};
use swing_store::{MemBackend, SwingStore};

use crate::fixtures::fixture_registry;

pub fn mem_store() -> SwingStore {
    SwingStore::new(MemBackend::new())
}

/// A kernel over an in-memory store with every fixture bundle registered.
///
/// Helpers panic on kernel errors; use `kernel` directly to observe them.
pub struct TestKernel {
    pub kernel: Kernel,
    config: KernelConfig,
    registry: VatRegistry,
}

impl TestKernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self::with_store(mem_store(), config)
    }

    pub fn with_store(store: SwingStore, config: KernelConfig) -> Self {
        Self::from_parts(store, config, fixture_registry())
    }

    /// A kernel with one device attached. Devices do not survive
    /// [`TestKernel::restart`].
    pub fn with_device(config: KernelConfig, name: &str, device: impl Device + 'static) -> Self {
        let registry = fixture_registry();
        let kernel = Kernel::builder(mem_store())
            .with_config(config.clone())
            .with_registry(registry.clone())
            .with_device(name, device)
            .build()
            .expect("build kernel");
        Self {
            kernel,
            config,
            registry,
        }
    }

    fn from_parts(store: SwingStore, config: KernelConfig, registry: VatRegistry) -> Self {
        let kernel = Kernel::builder(store)
            .with_config(config.clone())
            .with_registry(registry.clone())
            .build()
            .expect("build kernel");
        Self {
            kernel,
            config,
            registry,
        }
    }

    /// Commit, drop every worker, and reopen the kernel over the same store.
    pub fn restart(self) -> Self {
        let registry = self.registry.clone();
        self.restart_with(registry, |_| {})
    }

    /// Restart with different vat code and a chance to edit the store in
    /// between.
    pub fn restart_with(mut self, registry: VatRegistry, edit: impl FnOnce(&mut SwingStore)) -> Self {
        self.kernel.commit().expect("commit before restart");
        log::debug!(
            "restarting test kernel at crank {}",
            self.kernel.crank_number().unwrap_or_default()
        );
        let mut store = self.kernel.into_store();
        edit(&mut store);
        Self::from_parts(store, self.config, registry)
    }

    /// Create a vat with default options and run until it has started.
    pub fn create(&mut self, name: &str, bundle: &str) -> VatId {
        self.create_with(name, bundle, CapData::null(), VatOptions::named(name))
    }

    pub fn create_with(
        &mut self,
        name: &str,
        bundle: &str,
        params: CapData<KernelSlot>,
        options: VatOptions,
    ) -> VatId {
        let vat = self
            .kernel
            .create_vat(name, bundle, params, options)
            .expect("queue vat creation");
        self.run();
        vat
    }

    pub fn root(&self, vat: VatId) -> KernelSlot {
        self.kernel
            .vat_root(vat)
            .expect("read root")
            .unwrap_or_else(|| panic!("{vat} has no root object"))
    }

    /// Send from the host, run to idle, and read the result. Returns
    /// whether the result was rejected, with its data.
    pub fn call(&mut self, target: KernelSlot, method: &str, args: CapData<KernelSlot>) -> (bool, CapData<KernelSlot>) {
        self.try_call(target, method, args)
            .unwrap_or_else(|err| panic!("{target}.{method}: {err:#}"))
    }

    pub fn try_call(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<(bool, CapData<KernelSlot>)> {
        let kpid = self.kernel.invoke(target, method, args).context("invoke")?;
        self.kernel.run_until_idle().context("run")?;
        let status = self.kernel.kpid_status(kpid)?;
        if !status.is_settled() {
            bail!("{kpid} is still {status}");
        }
        Ok(self.kernel.kpid_resolution(kpid)?)
    }

    /// [`TestKernel::call`] that must be fulfilled.
    pub fn call_ok(&mut self, target: KernelSlot, method: &str, args: CapData<KernelSlot>) -> CapData<KernelSlot> {
        let (rejected, data) = self.call(target, method, args);
        assert!(!rejected, "{target}.{method} was rejected: {:?}", data.body());
        data
    }

    pub fn send_only(&mut self, target: KernelSlot, method: &str, args: CapData<KernelSlot>) {
        self.kernel
            .queue_to_kref(target, method, args)
            .expect("queue message");
        self.run();
    }

    pub fn run(&mut self) -> u64 {
        self.kernel.run_until_idle().expect("run until idle").cranks
    }

    pub fn refcount(&self, kref: KernelSlot) -> Option<(u64, u64)> {
        self.kernel.keeper().object_refcount(kref).expect("read refcount")
    }

    pub fn assert_consistent(&self) {
        let violations = self.kernel.check_invariants().expect("check invariants");
        assert!(violations.is_empty(), "invariant violations: {violations:#?}");
    }
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}
