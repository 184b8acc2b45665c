//! Vocabulary shared by the kernel and vat runtimes: slots, payloads, delivery and syscall envelopes.

mod envelopes;
mod slots;
mod value;

pub use envelopes::{DeliveryStatus, SyscallResult, VatDelivery, VatSyscall};
pub use slots::{Direction, KernelSlot, SlotParseError, VatId, VatSlot};
pub use value::{CapData, MAX_DEPTH, MarshalError, Message, Resolution, Value};

/// Kernel side of a delivery: executes one syscall and answers it.
pub trait Syscall {
    fn call(&mut self, syscall: VatSyscall) -> SyscallResult;
}

/// A running vat as the kernel sees it.
pub trait Dispatch: Send {
    /// Run one delivery to completion, issuing syscalls along the way.
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> DeliveryStatus;

    /// Serialize the complete vat state.
    fn snapshot(&mut self) -> Result<Vec<u8>, String>;
}

/// Vat code: builds fresh instances and restores them from snapshots.
pub trait VatBundle: Send + Sync {
    fn build(&self) -> Result<Box<dyn Dispatch>, String>;

    fn restore(&self, snapshot: &[u8]) -> Result<Box<dyn Dispatch>, String>;
}
