use crate::{CapData, Message, Resolution, VatSlot};
use serde::{Deserialize, Serialize};

/// A delivery into a vat, expressed in that vat's own slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    Message {
        target: VatSlot,
        msg: Message<VatSlot>,
    },
    Notify {
        resolutions: Vec<Resolution<VatSlot>>,
    },
    DropExports {
        vrefs: Vec<VatSlot>,
    },
    RetireExports {
        vrefs: Vec<VatSlot>,
    },
    RetireImports {
        vrefs: Vec<VatSlot>,
    },
    StartVat {
        params: CapData<VatSlot>,
    },
    StopVat {
        info: CapData<VatSlot>,
    },
    BringOutYourDead,
}

impl VatDelivery {
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::StopVat { .. } => "stopVat",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

/// A request from a vat to the kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VatSlot,
        msg: Message<VatSlot>,
    },
    Subscribe {
        vpid: VatSlot,
    },
    Resolve {
        resolutions: Vec<Resolution<VatSlot>>,
    },
    Exit {
        failure: bool,
        info: CapData<VatSlot>,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreGetNextKey {
        prior: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    DropImports {
        vrefs: Vec<VatSlot>,
    },
    RetireImports {
        vrefs: Vec<VatSlot>,
    },
    RetireExports {
        vrefs: Vec<VatSlot>,
    },
    AbandonExports {
        vrefs: Vec<VatSlot>,
    },
    CallNow {
        target: VatSlot,
        method: String,
        args: CapData<VatSlot>,
    },
}

impl VatSyscall {
    pub fn kind(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
            VatSyscall::AbandonExports { .. } => "abandonExports",
            VatSyscall::CallNow { .. } => "callNow",
        }
    }
}

/// Kernel answer to a syscall.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyscallResult {
    Ok,
    Value { value: Option<String> },
    Data { data: CapData<VatSlot> },
    Error { message: String },
}

impl SyscallResult {
    pub fn error(message: impl Into<String>) -> Self {
        SyscallResult::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyscallResult::Error { .. })
    }
}

/// How a delivery ended, as seen by the vat runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeliveryStatus {
    Ok,
    Error { message: String },
}

impl DeliveryStatus {
    pub fn error(message: impl Into<String>) -> Self {
        DeliveryStatus::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, DeliveryStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscalls_encode_with_type_tags() {
        let call = VatSyscall::Send {
            target: VatSlot::import(1),
            msg: Message::new("ping", CapData::int(3), Some(VatSlot::promise_export(1))),
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.starts_with(r#"{"type":"send","target":"o-1""#));
        let back: VatSyscall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, call);

        let result = serde_json::to_string(&SyscallResult::Value { value: None }).unwrap();
        assert_eq!(result, r#"{"status":"value","value":null}"#);
    }

    #[test]
    fn unit_delivery_has_only_a_tag() {
        let json = serde_json::to_string(&VatDelivery::BringOutYourDead).unwrap();
        assert_eq!(json, r#"{"type":"bringOutYourDead"}"#);
    }
}
