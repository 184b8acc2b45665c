//! Devices: synchronous host call-outs reachable through `callNow`.

use crate::error::KernelError;
use crate::keeper::KernelKeeper;
use std::collections::BTreeMap;
use std::fmt;
use swing_abi::{CapData, KernelSlot};

/// Host functionality exposed to vats as a device node.
pub trait Device: Send {
    fn invoke(&mut self, method: &str, args: CapData<KernelSlot>) -> Result<CapData<KernelSlot>, String>;
}

impl<F> Device for F
where
    F: FnMut(&str, CapData<KernelSlot>) -> Result<CapData<KernelSlot>, String> + Send,
{
    fn invoke(&mut self, method: &str, args: CapData<KernelSlot>) -> Result<CapData<KernelSlot>, String> {
        self(method, args)
    }
}

/// Devices registered with the kernel, addressed by their `kdN` node.
#[derive(Default)]
pub struct DeviceTable {
    by_name: BTreeMap<String, Box<dyn Device>>,
    nodes: BTreeMap<KernelSlot, String>,
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.nodes.iter()).finish()
    }
}

impl DeviceTable {
    pub(crate) fn insert(&mut self, name: impl Into<String>, device: Box<dyn Device>) {
        self.by_name.insert(name.into(), device);
    }

    /// Give every registered device a stable kernel slot, reusing the ones
    /// persisted by an earlier run.
    pub(crate) fn attach(&mut self, keeper: &mut KernelKeeper) -> Result<(), KernelError> {
        for name in self.by_name.keys() {
            let key = format!("device.name.{name}");
            let kref = match keeper.get(&key)? {
                Some(raw) => raw.parse()?,
                None => {
                    let kref = KernelSlot::Device(keeper.allocate("kd.nextID")?);
                    keeper.set(key, kref.to_string());
                    keeper.set(format!("{kref}.owner"), name.clone());
                    kref
                }
            };
            self.nodes.insert(kref, name.clone());
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<KernelSlot> {
        self.nodes
            .iter()
            .find(|(_, owner)| owner.as_str() == name)
            .map(|(kref, _)| *kref)
    }

    /// Call a device. The result may only carry data.
    pub(crate) fn invoke(
        &mut self,
        kref: KernelSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<CapData<KernelSlot>, String> {
        let name = self
            .nodes
            .get(&kref)
            .ok_or_else(|| format!("no device behind {kref}"))?;
        let device = self
            .by_name
            .get_mut(name)
            .ok_or_else(|| format!("device '{name}' is not registered"))?;
        let result = device.invoke(method, args)?;
        if !result.slots().is_empty() {
            return Err(format!("device '{name}' returned references from {method}"));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::tests::keeper;

    #[test]
    fn device_nodes_are_stable_across_attach() {
        let mut keeper = keeper();
        let mut table = DeviceTable::default();
        table.insert("clock", Box::new(|_: &str, _: CapData<KernelSlot>| Ok::<_, String>(CapData::int(42))));
        table.attach(&mut keeper).unwrap();
        let node = table.node("clock").unwrap();
        assert_eq!(node, KernelSlot::Device(1));

        let mut again = DeviceTable::default();
        again.insert("clock", Box::new(|_: &str, _: CapData<KernelSlot>| Ok::<_, String>(CapData::int(0))));
        again.attach(&mut keeper).unwrap();
        assert_eq!(again.node("clock"), Some(node));
        assert_eq!(table.invoke(node, "now", CapData::null()).unwrap(), CapData::int(42));
    }

    #[test]
    fn references_in_results_are_refused() {
        let mut keeper = keeper();
        let mut table = DeviceTable::default();
        table.insert(
            "leaky",
            Box::new(|_: &str, _: CapData<KernelSlot>| Ok::<_, String>(CapData::single(KernelSlot::Object(1)))),
        );
        table.attach(&mut keeper).unwrap();
        let node = table.node("leaky").unwrap();
        assert!(table.invoke(node, "get", CapData::null()).is_err());
    }
}
