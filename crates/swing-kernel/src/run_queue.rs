//! The durable run queue and the bring-out-your-dead reap queue.

use crate::config::VatOptions;
use crate::error::KernelError;
use crate::keeper::KernelKeeper;
use crate::vat::VatSource;
use serde::{Deserialize, Serialize};
use swing_abi::{CapData, KernelSlot, Message, Value, VatId};

/// Unit of work for one crank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueEvent {
    Send {
        target: KernelSlot,
        msg: Message<KernelSlot>,
    },
    Notify {
        vat: VatId,
        kpid: KernelSlot,
    },
    DropExports {
        vat: VatId,
        krefs: Vec<KernelSlot>,
    },
    RetireExports {
        vat: VatId,
        krefs: Vec<KernelSlot>,
    },
    RetireImports {
        vat: VatId,
        krefs: Vec<KernelSlot>,
    },
    CreateVat {
        vat: VatId,
        source: VatSource,
        params: CapData<KernelSlot>,
        options: VatOptions,
    },
    UpgradeVat {
        vat: VatId,
        upgrade_id: u64,
        source: VatSource,
        params: CapData<KernelSlot>,
        message: Value,
    },
    TerminateVat {
        vat: VatId,
        reject: bool,
        info: CapData<KernelSlot>,
    },
    BringOutYourDead {
        vat: VatId,
    },
    ChangeVatOptions {
        vat: VatId,
        options: VatOptions,
    },
    NegatedGcAction,
}

impl RunQueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueEvent::Send { .. } => "send",
            RunQueueEvent::Notify { .. } => "notify",
            RunQueueEvent::DropExports { .. } => "dropExports",
            RunQueueEvent::RetireExports { .. } => "retireExports",
            RunQueueEvent::RetireImports { .. } => "retireImports",
            RunQueueEvent::CreateVat { .. } => "createVat",
            RunQueueEvent::UpgradeVat { .. } => "upgradeVat",
            RunQueueEvent::TerminateVat { .. } => "terminateVat",
            RunQueueEvent::BringOutYourDead { .. } => "bringOutYourDead",
            RunQueueEvent::ChangeVatOptions { .. } => "changeVatOptions",
            RunQueueEvent::NegatedGcAction => "negatedGcAction",
        }
    }

    /// Vat the event is addressed to, when known without routing.
    pub fn vat(&self) -> Option<VatId> {
        match self {
            RunQueueEvent::Send { .. } | RunQueueEvent::NegatedGcAction => None,
            RunQueueEvent::Notify { vat, .. }
            | RunQueueEvent::DropExports { vat, .. }
            | RunQueueEvent::RetireExports { vat, .. }
            | RunQueueEvent::RetireImports { vat, .. }
            | RunQueueEvent::CreateVat { vat, .. }
            | RunQueueEvent::UpgradeVat { vat, .. }
            | RunQueueEvent::TerminateVat { vat, .. }
            | RunQueueEvent::BringOutYourDead { vat }
            | RunQueueEvent::ChangeVatOptions { vat, .. } => Some(*vat),
        }
    }

    /// References the event holds while it sits in the queue. GC events
    /// carry krefs but hold nothing.
    pub fn krefs(&self) -> Vec<KernelSlot> {
        match self {
            RunQueueEvent::Send { target, msg } => std::iter::once(*target)
                .chain(msg.args.slots().iter().copied())
                .chain(msg.result)
                .collect(),
            RunQueueEvent::Notify { kpid, .. } => vec![*kpid],
            RunQueueEvent::CreateVat { params, .. } | RunQueueEvent::UpgradeVat { params, .. } => {
                params.slots().to_vec()
            }
            RunQueueEvent::TerminateVat { info, .. } => info.slots().to_vec(),
            _ => Vec::new(),
        }
    }
}

impl KernelKeeper {
    fn run_queue_bounds(&self) -> Result<(u64, u64), KernelError> {
        let bounds: Option<[u64; 2]> = self.get_json("runQueue")?;
        let [head, tail] = bounds.unwrap_or([1, 1]);
        Ok((head, tail))
    }

    /// Append an event, taking the references it holds.
    pub(crate) fn enqueue(&mut self, event: RunQueueEvent) -> Result<(), KernelError> {
        for kref in event.krefs() {
            self.incref(kref)?;
        }
        let (head, tail) = self.run_queue_bounds()?;
        self.set_json(format!("runQueue.{tail}"), &event)?;
        self.set_json("runQueue", &[head, tail + 1])
    }

    /// Pop the oldest event. Its references stay held until [`Self::release_event`].
    pub(crate) fn dequeue(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        if head == tail {
            return Ok(None);
        }
        let key = format!("runQueue.{head}");
        let event = self
            .get_json(&key)?
            .ok_or_else(|| KernelError::corrupt(format!("missing run-queue entry {head}")))?;
        self.delete(&key);
        self.set_json("runQueue", &[head + 1, tail])?;
        Ok(Some(event))
    }

    pub(crate) fn release_event(&mut self, event: &RunQueueEvent) -> Result<(), KernelError> {
        for kref in event.krefs() {
            self.decref(kref)?;
        }
        Ok(())
    }

    pub fn run_queue_len(&self) -> Result<u64, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        Ok(tail - head)
    }

    pub fn run_queue_events(&self) -> Result<Vec<RunQueueEvent>, KernelError> {
        let (head, tail) = self.run_queue_bounds()?;
        (head..tail)
            .map(|pos| {
                self.get_json(&format!("runQueue.{pos}"))?
                    .ok_or_else(|| KernelError::corrupt(format!("missing run-queue entry {pos}")))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Reap queue
    // ---------------------------------------------------------------------

    pub fn reap_queue(&self) -> Result<Vec<VatId>, KernelError> {
        Ok(self.get_json("reapQueue")?.unwrap_or_default())
    }

    pub(crate) fn schedule_reap(&mut self, vat: VatId) -> Result<(), KernelError> {
        let mut queue = self.reap_queue()?;
        if !queue.contains(&vat) {
            queue.push(vat);
            self.set_json("reapQueue", &queue)?;
        }
        Ok(())
    }

    pub(crate) fn next_reap(&mut self) -> Result<Option<VatId>, KernelError> {
        let mut queue = self.reap_queue()?;
        if queue.is_empty() {
            return Ok(None);
        }
        let vat = queue.remove(0);
        self.set_json("reapQueue", &queue)?;
        Ok(Some(vat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::tests::keeper;

    #[test]
    fn queue_is_fifo_and_holds_references() {
        let mut keeper = keeper();
        let kp = keeper.add_kernel_promise(None).unwrap();
        keeper
            .enqueue(RunQueueEvent::Notify { vat: VatId(1), kpid: kp })
            .unwrap();
        keeper
            .enqueue(RunQueueEvent::BringOutYourDead { vat: VatId(2) })
            .unwrap();
        assert_eq!(keeper.run_queue_len().unwrap(), 2);
        assert_eq!(keeper.promise(kp).unwrap().unwrap().refcount, 1);

        let first = keeper.dequeue().unwrap().unwrap();
        assert_eq!(first.kind(), "notify");
        keeper.release_event(&first).unwrap();
        assert_eq!(keeper.promise(kp).unwrap().unwrap().refcount, 0);
        assert_eq!(keeper.dequeue().unwrap().unwrap().vat(), Some(VatId(2)));
        assert_eq!(keeper.dequeue().unwrap(), None);
    }

    #[test]
    fn reap_queue_deduplicates() {
        let mut keeper = keeper();
        keeper.schedule_reap(VatId(3)).unwrap();
        keeper.schedule_reap(VatId(1)).unwrap();
        keeper.schedule_reap(VatId(3)).unwrap();
        assert_eq!(keeper.reap_queue().unwrap(), vec![VatId(3), VatId(1)]);
        assert_eq!(keeper.next_reap().unwrap(), Some(VatId(3)));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RunQueueEvent::Notify {
            vat: VatId(1),
            kpid: KernelSlot::Promise(4),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"notify","vat":"v1","kpid":"kp4"}"#);
    }
}
