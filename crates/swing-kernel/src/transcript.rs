//! Transcript items and the syscall simulator used to replay them.

use crate::config::ReplayCheck;
use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use swing_abi::{DeliveryStatus, Syscall, SyscallResult, VatDelivery, VatId, VatSyscall};

/// Span-boundary markers recorded alongside real deliveries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PseudoDelivery {
    InitializeWorker { incarnation: u64 },
    SaveSnapshot { snap_pos: u64 },
    LoadSnapshot { snap_pos: u64, hash: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptDelivery {
    Pseudo(PseudoDelivery),
    Vat(VatDelivery),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub s: VatSyscall,
    pub r: SyscallResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    #[serde(flatten)]
    pub status: DeliveryStatus,
    pub computrons: u64,
}

/// One transcript entry: a delivery, the syscalls it made, and how it ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub d: TranscriptDelivery,
    #[serde(default)]
    pub sc: Vec<SyscallRecord>,
    pub r: DeliveryResult,
}

impl TranscriptItem {
    pub fn delivery(delivery: VatDelivery, syscalls: Vec<SyscallRecord>, status: DeliveryStatus, computrons: u64) -> Self {
        Self {
            d: TranscriptDelivery::Vat(delivery),
            sc: syscalls,
            r: DeliveryResult { status, computrons },
        }
    }

    pub fn pseudo(marker: PseudoDelivery) -> Self {
        Self {
            d: TranscriptDelivery::Pseudo(marker),
            sc: Vec::new(),
            r: DeliveryResult {
                status: DeliveryStatus::Ok,
                computrons: 0,
            },
        }
    }

    pub fn encode(&self) -> Result<String, KernelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, KernelError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivergenceKind {
    /// The vat made a syscall the transcript does not have.
    Extra,
    /// The vat made a different syscall than recorded.
    Wrong,
    /// The vat finished without making every recorded syscall.
    Missing,
    /// The delivery ended differently than recorded.
    Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayDivergence {
    pub vat: VatId,
    /// Transcript position of the delivery being replayed.
    pub delivery: u64,
    /// Index of the offending syscall within the delivery.
    pub index: usize,
    pub kind: DivergenceKind,
}

impl fmt::Display for ReplayDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} diverged from its transcript at delivery {} syscall {} ({:?})",
            self.vat, self.delivery, self.index, self.kind
        )
    }
}

/// Answers a replayed delivery's syscalls from the transcript instead of
/// the kernel.
pub struct ReplaySyscall<'a> {
    vat: VatId,
    delivery: u64,
    recorded: &'a [SyscallRecord],
    next: usize,
    pub divergence: Option<ReplayDivergence>,
}

impl<'a> ReplaySyscall<'a> {
    pub fn new(vat: VatId, delivery: u64, recorded: &'a [SyscallRecord]) -> Self {
        Self {
            vat,
            delivery,
            recorded,
            next: 0,
            divergence: None,
        }
    }

    fn diverge(&mut self, index: usize, kind: DivergenceKind) {
        if self.divergence.is_none() {
            self.divergence = Some(ReplayDivergence {
                vat: self.vat,
                delivery: self.delivery,
                index,
                kind,
            });
        }
    }

    /// Finish the delivery, checking that every recorded syscall was made.
    pub fn finish(mut self) -> Option<ReplayDivergence> {
        if self.next < self.recorded.len() {
            self.diverge(self.next, DivergenceKind::Missing);
        }
        self.divergence
    }
}

fn same_syscall(a: &VatSyscall, b: &VatSyscall) -> bool {
    match (swing_cbor::to_canonical_cbor(a), swing_cbor::to_canonical_cbor(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl Syscall for ReplaySyscall<'_> {
    fn call(&mut self, syscall: VatSyscall) -> SyscallResult {
        let index = self.next;
        let Some(record) = self.recorded.get(index) else {
            self.diverge(index, DivergenceKind::Extra);
            return SyscallResult::error("syscall not in transcript");
        };
        self.next += 1;
        if !same_syscall(&record.s, &syscall) {
            self.diverge(index, DivergenceKind::Wrong);
        }
        record.r.clone()
    }
}

/// Apply the configured policy to a divergence.
pub(crate) fn check_divergence(check: ReplayCheck, divergence: Option<ReplayDivergence>) -> Result<(), KernelError> {
    let Some(divergence) = divergence else {
        return Ok(());
    };
    match check {
        ReplayCheck::Strict => Err(KernelError::panic(divergence.to_string())),
        ReplayCheck::Off => {
            log::warn!("{divergence}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str) -> VatSyscall {
        VatSyscall::VatstoreSet {
            key: key.into(),
            value: "1".into(),
        }
    }

    #[test]
    fn items_keep_pseudo_and_real_deliveries_apart() {
        let pseudo = TranscriptItem::pseudo(PseudoDelivery::SaveSnapshot { snap_pos: 7 });
        let raw = pseudo.encode().unwrap();
        assert!(raw.contains(r#""type":"save-snapshot""#));
        assert_eq!(TranscriptItem::decode(&raw).unwrap(), pseudo);

        let real = TranscriptItem::delivery(
            VatDelivery::BringOutYourDead,
            vec![SyscallRecord { s: set("a"), r: SyscallResult::Ok }],
            DeliveryStatus::Ok,
            12,
        );
        let raw = real.encode().unwrap();
        assert!(raw.contains(r#""r":{"status":"ok","computrons":12}"#));
        assert_eq!(TranscriptItem::decode(&raw).unwrap(), real);
    }

    #[test]
    fn replay_supplies_recorded_results() {
        let recorded = vec![SyscallRecord {
            s: VatSyscall::VatstoreGet { key: "k".into() },
            r: SyscallResult::Value { value: Some("v".into()) },
        }];
        let mut sim = ReplaySyscall::new(VatId(1), 3, &recorded);
        let result = sim.call(VatSyscall::VatstoreGet { key: "k".into() });
        assert_eq!(result, SyscallResult::Value { value: Some("v".into()) });
        assert_eq!(sim.finish(), None);
    }

    #[test]
    fn replay_reports_wrong_extra_and_missing() {
        let recorded = vec![SyscallRecord { s: set("a"), r: SyscallResult::Ok }];

        let mut wrong = ReplaySyscall::new(VatId(1), 0, &recorded);
        wrong.call(set("b"));
        assert_eq!(wrong.finish().unwrap().kind, DivergenceKind::Wrong);

        let mut extra = ReplaySyscall::new(VatId(1), 0, &recorded);
        extra.call(set("a"));
        assert!(extra.call(set("a")).is_error());
        let divergence = extra.finish().unwrap();
        assert_eq!((divergence.kind, divergence.index), (DivergenceKind::Extra, 1));

        let missing = ReplaySyscall::new(VatId(1), 0, &recorded);
        assert_eq!(missing.finish().unwrap().kind, DivergenceKind::Missing);
    }

    #[test]
    fn strict_check_panics_and_off_logs() {
        let divergence = ReplayDivergence {
            vat: VatId(2),
            delivery: 4,
            index: 0,
            kind: DivergenceKind::Wrong,
        };
        assert!(matches!(
            check_divergence(ReplayCheck::Strict, Some(divergence.clone())),
            Err(KernelError::Panic(_))
        ));
        assert!(check_divergence(ReplayCheck::Off, Some(divergence)).is_ok());
    }
}
