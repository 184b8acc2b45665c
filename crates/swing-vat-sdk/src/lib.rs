//! Vat-side runtime: slot bookkeeping, eventual sends, baggage and drop tracking for vats written in Rust.

mod ctx;
mod liveslots;

pub use ctx::VatCtx;
pub use liveslots::{LiveslotsDispatch, SlotTable};
pub use swing_abi::{CapData, Message, Value, VatSlot};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use swing_abi::{Dispatch, MarshalError, VatBundle};

/// Trait implemented by every vat.
///
/// The vat value itself is the vat's heap: it is serialized into snapshots
/// and discarded on upgrade. State that must survive an upgrade belongs in
/// baggage.
pub trait Vat: Serialize + DeserializeOwned + Send + 'static {
    /// Called once per incarnation with the creation parameters.
    fn start(&mut self, ctx: &mut VatCtx<'_>, params: &CapData<VatSlot>) -> Result<(), VatError> {
        let _ = (ctx, params);
        Ok(())
    }

    /// Handle a message sent to one of this vat's exports.
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError>;

    /// A promise this vat subscribed to has settled.
    fn notify(
        &mut self,
        ctx: &mut VatCtx<'_>,
        promise: VatSlot,
        rejected: bool,
        data: &CapData<VatSlot>,
    ) -> Result<(), VatError> {
        let _ = (ctx, promise, rejected, data);
        Ok(())
    }

    /// Shutdown hook of the outgoing incarnation during an upgrade.
    fn stop(&mut self, ctx: &mut VatCtx<'_>) -> Result<(), VatError> {
        let _ = ctx;
        Ok(())
    }

    /// The kernel forgot an export; nothing can reach or recognize it anymore.
    fn export_retired(&mut self, vref: VatSlot) {
        let _ = vref;
    }

    /// The kernel forgot an import this vat only recognized.
    fn import_retired(&mut self, vref: VatSlot) {
        let _ = vref;
    }
}

/// Outcome of handling a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Fulfill the result promise now.
    Value(CapData<VatSlot>),
    /// The vat will settle the result promise later through [`VatCtx::resolve`].
    Pending,
}

impl From<CapData<VatSlot>> for Reply {
    fn from(data: CapData<VatSlot>) -> Self {
        Reply::Value(data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VatError {
    /// Application-level failure; rejects the result promise.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    /// The kernel refused a syscall.
    #[error("syscall {kind} failed: {message}")]
    Syscall { kind: &'static str, message: String },
    /// Unrecoverable; fails the delivery.
    #[error("fatal vat error: {0}")]
    Fatal(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl VatError {
    pub fn rejected(message: impl Into<String>) -> Self {
        VatError::Rejected(message.into())
    }

    /// Whether the error stays inside the vat as a rejected result.
    pub fn is_application(&self) -> bool {
        matches!(self, VatError::Rejected(_) | VatError::Marshal(_))
    }
}

/// A [`VatBundle`] for vats built on this runtime.
pub struct LiveslotsBundle<V> {
    make: Arc<dyn Fn() -> V + Send + Sync>,
    _vat: PhantomData<fn() -> V>,
}

impl<V: Vat> LiveslotsBundle<V> {
    pub fn new(make: impl Fn() -> V + Send + Sync + 'static) -> Self {
        Self {
            make: Arc::new(make),
            _vat: PhantomData,
        }
    }
}

impl<V: Vat + Default> Default for LiveslotsBundle<V> {
    fn default() -> Self {
        Self::new(V::default)
    }
}

impl<V: Vat> VatBundle for LiveslotsBundle<V> {
    fn build(&self) -> Result<Box<dyn Dispatch>, String> {
        Ok(Box::new(LiveslotsDispatch::new((self.make)())))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Box<dyn Dispatch>, String> {
        let dispatch = LiveslotsDispatch::<V>::restore(snapshot).map_err(|err| err.to_string())?;
        Ok(Box::new(dispatch))
    }
}
