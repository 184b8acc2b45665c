//! Deterministic computron accounting.
//!
//! Vat code runs natively, so cost is charged by the kernel from what it
//! can observe: a fixed price per delivery and per syscall plus the
//! canonical encoded size of each payload.

use serde::Serialize;
use swing_abi::{VatDelivery, VatSyscall};

pub const DELIVERY_BASE: u64 = 100;
pub const SYSCALL_BASE: u64 = 10;

fn encoded_len<T: Serialize>(value: &T) -> u64 {
    swing_cbor::to_canonical_cbor(value)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

pub fn delivery_cost(delivery: &VatDelivery) -> u64 {
    DELIVERY_BASE + encoded_len(delivery)
}

pub fn syscall_cost(syscall: &VatSyscall) -> u64 {
    SYSCALL_BASE + encoded_len(syscall)
}

/// Running total for one delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meter {
    used: u64,
}

impl Meter {
    pub fn for_delivery(delivery: &VatDelivery) -> Self {
        Self {
            used: delivery_cost(delivery),
        }
    }

    pub fn charge_syscall(&mut self, syscall: &VatSyscall) {
        self.used = self.used.saturating_add(syscall_cost(syscall));
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn exceeds(&self, limit: Option<u64>) -> bool {
        limit.is_some_and(|limit| self.used > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swing_abi::{CapData, Message, VatSlot};

    #[test]
    fn bigger_payloads_cost_more() {
        let small = VatDelivery::Message {
            target: VatSlot::root(),
            msg: Message::new("m", CapData::int(1), None),
        };
        let big = VatDelivery::Message {
            target: VatSlot::root(),
            msg: Message::new("m", CapData::text("x".repeat(500)), None),
        };
        assert!(delivery_cost(&big) > delivery_cost(&small) + 400);
        assert_eq!(delivery_cost(&small), delivery_cost(&small.clone()));
    }

    #[test]
    fn meter_accumulates_and_checks_limit() {
        let mut meter = Meter::for_delivery(&VatDelivery::BringOutYourDead);
        let start = meter.used();
        meter.charge_syscall(&VatSyscall::VatstoreGet { key: "k".into() });
        assert!(meter.used() > start + SYSCALL_BASE);
        assert!(!meter.exceeds(None));
        assert!(meter.exceeds(Some(start)));
    }
}
