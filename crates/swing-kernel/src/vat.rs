use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use swing_abi::VatBundle;

/// Where a vat's code comes from, persisted under `vN.source`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatSource {
    pub bundle: String,
}

impl VatSource {
    pub fn bundle(name: impl Into<String>) -> Self {
        Self { bundle: name.into() }
    }
}

/// Vat code known to this kernel process, by bundle name.
#[derive(Clone, Default)]
pub struct VatRegistry {
    bundles: BTreeMap<String, Arc<dyn VatBundle>>,
}

impl fmt::Debug for VatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VatRegistry")
            .field("bundles", &self.bundles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, bundle: impl VatBundle + 'static) {
        self.bundles.insert(name.into(), Arc::new(bundle));
    }

    pub fn with(mut self, name: impl Into<String>, bundle: impl VatBundle + 'static) -> Self {
        self.register(name, bundle);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn VatBundle>, KernelError> {
        self.bundles
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::UnknownBundle(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }
}
