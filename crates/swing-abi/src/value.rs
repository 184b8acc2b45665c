use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deepest nesting accepted in a message payload.
pub const MAX_DEPTH: usize = 64;

/// Immutable payload tree carried by messages and resolutions.
///
/// References are never embedded directly; `Slot(i)` points into the
/// accompanying slot table of a [`CapData`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Slot(u32),
    Error { message: String },
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Value::Error {
            message: message.into(),
        }
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_slot(&self) -> Option<u32> {
        match self {
            Value::Slot(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a record, `None` for other shapes.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(field),
            _ => None,
        }
    }

    fn check(&self, slots: usize, depth: usize) -> Result<(), MarshalError> {
        if depth > MAX_DEPTH {
            return Err(MarshalError::TooDeep { max: MAX_DEPTH });
        }
        match self {
            Value::Slot(i) if *i as usize >= slots => Err(MarshalError::SlotOutOfRange {
                index: *i,
                len: slots,
            }),
            Value::List(items) => items.iter().try_for_each(|v| v.check(slots, depth + 1)),
            Value::Record(fields) => fields
                .values()
                .try_for_each(|v| v.check(slots, depth + 1)),
            _ => Ok(()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("slot index {index} out of range for {len} slots")]
    SlotOutOfRange { index: u32, len: usize },
    #[error("payload nested deeper than {max}")]
    TooDeep { max: usize },
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
struct RawCapData<S> {
    body: Value,
    slots: Vec<S>,
}

impl<S> TryFrom<RawCapData<S>> for CapData<S> {
    type Error = MarshalError;

    fn try_from(raw: RawCapData<S>) -> Result<Self, Self::Error> {
        CapData::new(raw.body, raw.slots)
    }
}

/// A validated payload plus the references it points at.
///
/// Construction checks that every `Slot(i)` is in range and that the body
/// is not nested too deeply. The parts cannot be mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "RawCapData<S>",
    bound(deserialize = "S: Deserialize<'de>")
)]
pub struct CapData<S> {
    body: Value,
    slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: Value, slots: Vec<S>) -> Result<Self, MarshalError> {
        body.check(slots.len(), 0)?;
        Ok(Self { body, slots })
    }

    /// Pure data with no references.
    pub fn data(body: Value) -> Result<Self, MarshalError> {
        Self::new(body, Vec::new())
    }

    pub fn null() -> Self {
        Self {
            body: Value::Null,
            slots: Vec::new(),
        }
    }

    pub fn int(n: i64) -> Self {
        Self {
            body: Value::Int(n),
            slots: Vec::new(),
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self {
            body: Value::text(s),
            slots: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            body: Value::error(message),
            slots: Vec::new(),
        }
    }

    /// A body that is exactly one reference.
    pub fn single(slot: S) -> Self {
        Self {
            body: Value::Slot(0),
            slots: vec![slot],
        }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn slots(&self) -> &[S] {
        &self.slots
    }

    /// The reference, if this payload is exactly one reference.
    pub fn single_slot(&self) -> Option<&S> {
        match (&self.body, self.slots.as_slice()) {
            (Value::Slot(0), [slot]) => Some(slot),
            _ => None,
        }
    }

    /// Entry `index` of the slot table.
    pub fn slot_at(&self, index: u32) -> Option<&S> {
        self.slots.get(index as usize)
    }

    pub fn into_parts(self) -> (Value, Vec<S>) {
        (self.body, self.slots)
    }

    pub fn map_slots<T>(self, f: impl FnMut(S) -> T) -> CapData<T> {
        CapData {
            body: self.body,
            slots: self.slots.into_iter().map(f).collect(),
        }
    }

    pub fn try_map_slots<T, E>(self, f: impl FnMut(S) -> Result<T, E>) -> Result<CapData<T>, E> {
        Ok(CapData {
            body: self.body,
            slots: self.slots.into_iter().map(f).collect::<Result<_, _>>()?,
        })
    }
}

/// An eventual send: method name, arguments and an optional result promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct Message<S> {
    pub method: String,
    pub args: CapData<S>,
    #[serde(default)]
    pub result: Option<S>,
}

impl<S> Message<S> {
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }

    pub fn try_map_slots<T, E>(self, mut f: impl FnMut(S) -> Result<T, E>) -> Result<Message<T>, E> {
        let result = self.result.map(&mut f).transpose()?;
        Ok(Message {
            method: self.method,
            args: self.args.try_map_slots(&mut f)?,
            result,
        })
    }
}

/// Settlement of one promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct Resolution<S> {
    pub promise: S,
    pub rejected: bool,
    pub data: CapData<S>,
}

impl<S> Resolution<S> {
    pub fn fulfill(promise: S, data: CapData<S>) -> Self {
        Self {
            promise,
            rejected: false,
            data,
        }
    }

    pub fn reject(promise: S, data: CapData<S>) -> Self {
        Self {
            promise,
            rejected: true,
            data,
        }
    }

    pub fn try_map_slots<T, E>(self, mut f: impl FnMut(S) -> Result<T, E>) -> Result<Resolution<T>, E> {
        Ok(Resolution {
            promise: f(self.promise)?,
            rejected: self.rejected,
            data: self.data.try_map_slots(&mut f)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VatSlot;

    #[test]
    fn capdata_rejects_dangling_slots() {
        let body = Value::List(vec![Value::Slot(0), Value::Slot(1)]);
        assert_eq!(
            CapData::new(body.clone(), vec![VatSlot::import(1)]),
            Err(MarshalError::SlotOutOfRange { index: 1, len: 1 })
        );
        assert!(CapData::new(body, vec![VatSlot::import(1), VatSlot::export(2)]).is_ok());
    }

    #[test]
    fn capdata_rejects_deep_nesting() {
        let mut body = Value::Null;
        for _ in 0..=MAX_DEPTH {
            body = Value::List(vec![body]);
        }
        assert_eq!(
            CapData::<VatSlot>::data(body),
            Err(MarshalError::TooDeep { max: MAX_DEPTH })
        );
    }

    #[test]
    fn deserialization_validates() {
        let ok: CapData<VatSlot> = serde_json::from_str(r#"{"body":{"Slot":0},"slots":["o-4"]}"#).unwrap();
        assert_eq!(ok.single_slot(), Some(&VatSlot::import(4)));
        assert!(serde_json::from_str::<CapData<VatSlot>>(r#"{"body":{"Slot":2},"slots":[]}"#).is_err());
    }

    #[test]
    fn message_maps_args_and_result() {
        let msg = Message::new("foo", CapData::single(1u64), Some(2u64));
        let mapped: Message<String> = msg
            .try_map_slots(|n| Ok::<_, ()>(format!("ko{n}")))
            .unwrap();
        assert_eq!(mapped.args.slots(), ["ko1".to_string()]);
        assert_eq!(mapped.result.as_deref(), Some("ko2"));
    }
}
