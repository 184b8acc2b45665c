use swing_abi::{KernelSlot, MarshalError, SlotParseError, VatId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] swing_store::StoreError),
    #[error("kernel panic: {0}")]
    Panic(String),
    #[error("corrupt kernel state: {0}")]
    Corrupt(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    SlotParse(#[from] SlotParseError),
    #[error("unknown vat '{0}'")]
    UnknownVat(String),
    #[error("vat name '{0}' is already taken")]
    DuplicateVatName(String),
    #[error("no vat bundle registered as '{0}'")]
    UnknownBundle(String),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("vat {0} has been terminated")]
    VatTerminated(VatId),
    #[error("unknown kernel slot {0}")]
    UnknownKref(KernelSlot),
    #[error("promise {0} is not settled")]
    Unsettled(KernelSlot),
    #[error("vat worker error: {0}")]
    Worker(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("kernel is already running a crank")]
    Reentrant,
    #[error("{0}")]
    Invalid(String),
}

impl KernelError {
    pub fn panic(message: impl Into<String>) -> Self {
        KernelError::Panic(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        KernelError::Corrupt(message.into())
    }

    /// Errors that leave kernel state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Panic(_) | KernelError::Corrupt(_) | KernelError::Store(_)
        )
    }
}

/// Failure of a single syscall.
#[derive(Debug, Error)]
pub enum SyscallError {
    /// The vat broke the protocol; it will be terminated.
    #[error("vat fault: {0}")]
    Fatal(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl SyscallError {
    pub fn fatal(message: impl Into<String>) -> Self {
        SyscallError::Fatal(message.into())
    }
}

impl From<swing_store::StoreError> for SyscallError {
    fn from(err: swing_store::StoreError) -> Self {
        SyscallError::Kernel(err.into())
    }
}

impl From<serde_json::Error> for SyscallError {
    fn from(err: serde_json::Error) -> Self {
        SyscallError::Kernel(err.into())
    }
}
