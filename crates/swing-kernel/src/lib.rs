//! Deterministic vat kernel: c-lists, promise routing, crank scheduling,
//! reference-counting GC, transcripts and vat lifecycle.

pub mod clist;
pub mod config;
pub mod device;
pub mod error;
pub mod gc;
pub mod invariants;
pub mod keeper;
mod kernel;
pub mod lifecycle;
pub mod manager;
pub mod metering;
pub mod policy;
pub mod registry;
pub mod run_queue;
pub mod stats;
pub mod transcript;
pub mod vat;
pub mod warehouse;

pub use clist::ClistEntry;
pub use config::{KernelConfig, ManagerType, ReapInterval, ReplayCheck, VatOptions};
pub use device::Device;
pub use error::{KernelError, SyscallError};
pub use gc::{GcAction, GcActionKind};
pub use invariants::{InvariantViolation, check_invariants};
pub use keeper::{KernelKeeper, KernelOptions, TerminationRecord};
pub use kernel::{Kernel, KernelBuilder};
pub use lifecycle::LifecycleEvent;
pub use manager::VatWorker;
pub use policy::{
    AllOf, ComputronBudgetPolicy, CrankDetails, CrankLimitPolicy, Exhaustion, ForeverPolicy,
    PauseOnExhaustion, RunOutcome, RunPolicy, WallClockPolicy,
};
pub use registry::{KernelPromise, PromiseState};
pub use run_queue::RunQueueEvent;
pub use stats::{DispatchCounters, KernelStats, PromiseCounts, collect_stats};
pub use transcript::{
    DeliveryResult, DivergenceKind, PseudoDelivery, ReplayDivergence, SyscallRecord,
    TranscriptDelivery, TranscriptItem,
};
pub use vat::{VatRegistry, VatSource};
