use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotParseError {
    #[error("malformed {kind} '{input}'")]
    Malformed { kind: &'static str, input: String },
    #[error("bad numeric id in '{0}'")]
    BadId(String),
}

fn parse_id(input: &str, digits: &str) -> Result<u64, SlotParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SlotParseError::BadId(input.to_string()));
    }
    digits
        .parse()
        .map_err(|_| SlotParseError::BadId(input.to_string()))
}

/// Identifier of a vat: `vN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VatId(pub u64);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').ok_or_else(|| SlotParseError::Malformed {
            kind: "vat id",
            input: s.to_string(),
        })?;
        parse_id(s, digits).map(VatId)
    }
}

impl From<VatId> for String {
    fn from(id: VatId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for VatId {
    type Error = SlotParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Kernel-global reference: `koN`, `kpN` or `kdN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KernelSlot {
    Object(u64),
    Promise(u64),
    Device(u64),
}

impl KernelSlot {
    pub fn is_object(&self) -> bool {
        matches!(self, KernelSlot::Object(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KernelSlot::Promise(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, KernelSlot::Device(_))
    }

    pub fn id(&self) -> u64 {
        match self {
            KernelSlot::Object(id) | KernelSlot::Promise(id) | KernelSlot::Device(id) => *id,
        }
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSlot::Object(id) => write!(f, "ko{id}"),
            KernelSlot::Promise(id) => write!(f, "kp{id}"),
            KernelSlot::Device(id) => write!(f, "kd{id}"),
        }
    }
}

impl FromStr for KernelSlot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(digits) = s.strip_prefix("ko") {
            parse_id(s, digits).map(KernelSlot::Object)
        } else if let Some(digits) = s.strip_prefix("kp") {
            parse_id(s, digits).map(KernelSlot::Promise)
        } else if let Some(digits) = s.strip_prefix("kd") {
            parse_id(s, digits).map(KernelSlot::Device)
        } else {
            Err(SlotParseError::Malformed {
                kind: "kernel slot",
                input: s.to_string(),
            })
        }
    }
}

impl From<KernelSlot> for String {
    fn from(slot: KernelSlot) -> Self {
        slot.to_string()
    }
}

impl TryFrom<String> for KernelSlot {
    type Error = SlotParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Who allocated a vat slot: the vat itself (`+`) or the kernel (`-`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Export,
    Import,
}

impl Direction {
    fn sign(self) -> char {
        match self {
            Direction::Export => '+',
            Direction::Import => '-',
        }
    }
}

/// Vat-local reference. Only meaningful inside one vat's c-list.
///
/// Exports are `o+N` (or `o+dN` when durable) and `p+N`; kernel-allocated
/// imports are `o-N`, `p-N` and `d-N`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VatSlot {
    Object {
        id: u64,
        dir: Direction,
        durable: bool,
    },
    Promise {
        id: u64,
        dir: Direction,
    },
    Device {
        id: u64,
        dir: Direction,
    },
}

impl VatSlot {
    pub fn export(id: u64) -> Self {
        VatSlot::Object {
            id,
            dir: Direction::Export,
            durable: false,
        }
    }

    pub fn durable_export(id: u64) -> Self {
        VatSlot::Object {
            id,
            dir: Direction::Export,
            durable: true,
        }
    }

    pub fn import(id: u64) -> Self {
        VatSlot::Object {
            id,
            dir: Direction::Import,
            durable: false,
        }
    }

    pub fn promise_export(id: u64) -> Self {
        VatSlot::Promise {
            id,
            dir: Direction::Export,
        }
    }

    pub fn promise_import(id: u64) -> Self {
        VatSlot::Promise {
            id,
            dir: Direction::Import,
        }
    }

    pub fn device_import(id: u64) -> Self {
        VatSlot::Device {
            id,
            dir: Direction::Import,
        }
    }

    /// The root object every vat exports.
    pub fn root() -> Self {
        VatSlot::export(0)
    }

    pub fn direction(&self) -> Direction {
        match self {
            VatSlot::Object { dir, .. } | VatSlot::Promise { dir, .. } | VatSlot::Device { dir, .. } => {
                *dir
            }
        }
    }

    pub fn is_export(&self) -> bool {
        self.direction() == Direction::Export
    }

    pub fn is_import(&self) -> bool {
        self.direction() == Direction::Import
    }

    pub fn is_object(&self) -> bool {
        matches!(self, VatSlot::Object { .. })
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, VatSlot::Promise { .. })
    }

    pub fn is_device(&self) -> bool {
        matches!(self, VatSlot::Device { .. })
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, VatSlot::Object { durable: true, .. })
    }

    pub fn id(&self) -> u64 {
        match self {
            VatSlot::Object { id, .. } | VatSlot::Promise { id, .. } | VatSlot::Device { id, .. } => {
                *id
            }
        }
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VatSlot::Object { id, dir, durable } => {
                let d = if *durable { "d" } else { "" };
                write!(f, "o{}{d}{id}", dir.sign())
            }
            VatSlot::Promise { id, dir } => write!(f, "p{}{id}", dir.sign()),
            VatSlot::Device { id, dir } => write!(f, "d{}{id}", dir.sign()),
        }
    }
}

impl FromStr for VatSlot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SlotParseError::Malformed {
            kind: "vat slot",
            input: s.to_string(),
        };
        let mut chars = s.chars();
        let kind = chars.next().ok_or_else(malformed)?;
        let dir = match chars.next() {
            Some('+') => Direction::Export,
            Some('-') => Direction::Import,
            _ => return Err(malformed()),
        };
        let rest = chars.as_str();
        match kind {
            'o' => {
                let (durable, digits) = match rest.strip_prefix('d') {
                    Some(digits) if dir == Direction::Export => (true, digits),
                    Some(_) => return Err(malformed()),
                    None => (false, rest),
                };
                let id = parse_id(s, digits)?;
                Ok(VatSlot::Object { id, dir, durable })
            }
            'p' => Ok(VatSlot::Promise {
                id: parse_id(s, rest)?,
                dir,
            }),
            'd' => Ok(VatSlot::Device {
                id: parse_id(s, rest)?,
                dir,
            }),
            _ => Err(malformed()),
        }
    }
}

impl From<VatSlot> for String {
    fn from(slot: VatSlot) -> Self {
        slot.to_string()
    }
}

impl TryFrom<String> for VatSlot {
    type Error = SlotParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vat_slots_parse_and_print() {
        for text in ["o+0", "o+d12", "o-3", "p+7", "p-1", "d-2"] {
            let slot: VatSlot = text.parse().unwrap();
            assert_eq!(slot.to_string(), text);
        }
        assert!(VatSlot::durable_export(4).is_durable());
        assert!("o-d3".parse::<VatSlot>().is_err());
        assert!("o+".parse::<VatSlot>().is_err());
        assert!("x+1".parse::<VatSlot>().is_err());
        assert!("o+-1".parse::<VatSlot>().is_err());
    }

    #[test]
    fn kernel_slots_and_vat_ids_parse() {
        assert_eq!("ko12".parse::<KernelSlot>().unwrap(), KernelSlot::Object(12));
        assert_eq!("kp3".parse::<KernelSlot>().unwrap(), KernelSlot::Promise(3));
        assert_eq!("kd1".parse::<KernelSlot>().unwrap(), KernelSlot::Device(1));
        assert!("k1".parse::<KernelSlot>().is_err());
        assert_eq!("v9".parse::<VatId>().unwrap(), VatId(9));
        assert!("vat9".parse::<VatId>().is_err());
    }

    #[test]
    fn slots_serialize_as_strings() {
        let json = serde_json::to_string(&vec![VatSlot::import(2), VatSlot::promise_export(5)]).unwrap();
        assert_eq!(json, r#"["o-2","p+5"]"#);
        let back: Vec<KernelSlot> = serde_json::from_str(r#"["ko1","kp2"]"#).unwrap();
        assert_eq!(back, vec![KernelSlot::Object(1), KernelSlot::Promise(2)]);
        assert!(serde_json::from_str::<VatId>(r#""q1""#).is_err());
    }
}
