//! Shared helpers for the integration tests.
//!
//! Each test file compiles this module separately, so some helpers look
//! unused from any single file.

#![allow(dead_code)]

use swing_abi::{CapData, KernelSlot, Value};
use swing_kernel::{CrankDetails, KernelConfig, RunPolicy};

pub fn int(data: &CapData<KernelSlot>) -> i64 {
    data.body()
        .as_int()
        .unwrap_or_else(|| panic!("expected an integer, got {:?}", data.body()))
}

pub fn error_message(data: &CapData<KernelSlot>) -> String {
    match data.body() {
        Value::Error { message } => message.clone(),
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn slot(data: &CapData<KernelSlot>) -> KernelSlot {
    *data
        .single_slot()
        .unwrap_or_else(|| panic!("expected a single reference, got {:?}", data.body()))
}

/// No snapshots and no periodic reaps, so only the cranks a test asks
/// for happen.
pub fn quiet_config() -> KernelConfig {
    KernelConfig {
        snapshot_initial: 10_000,
        snapshot_interval: 10_000,
        default_reap_interval: None,
        ..KernelConfig::default()
    }
}

/// Records the kind of every crank and never stops the run.
#[derive(Debug, Default)]
pub struct Recorder {
    pub kinds: Vec<&'static str>,
}

impl RunPolicy for Recorder {
    fn crank_complete(&mut self, details: &CrankDetails) -> bool {
        self.kinds.push(details.kind);
        true
    }

    fn empty_crank(&mut self, details: &CrankDetails) -> bool {
        self.crank_complete(details)
    }
}
