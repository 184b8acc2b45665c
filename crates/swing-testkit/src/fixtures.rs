//! Fixture vats. Each is registered in [`fixture_registry`] under the
//! bundle name given in its doc line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use swing_abi::{DeliveryStatus, Dispatch, Syscall, VatBundle, VatDelivery};
use swing_kernel::VatRegistry;
use swing_vat_sdk::{
    CapData, LiveslotsBundle, LiveslotsDispatch, Reply, Value, Vat, VatCtx, VatError, VatSlot,
};

pub const COUNTER: &str = "counter";
pub const NOISY_COUNTER: &str = "noisy-counter";
pub const EXPORTER: &str = "exporter";
pub const HOLDER: &str = "holder";
pub const CALLER: &str = "caller";
pub const DEFERRED: &str = "deferred";
pub const DURABLE_COUNTER: &str = "durable-counter";
pub const DURABLE_COUNTER_V2: &str = "durable-counter-v2";
pub const DEVICE_USER: &str = "device-user";
pub const BROKEN_START: &str = "broken-start";
pub const STASH: &str = "stash";
pub const UNREAPABLE: &str = "unreapable";

/// Every fixture bundle under its well-known name.
pub fn fixture_registry() -> VatRegistry {
    VatRegistry::new()
        .with(COUNTER, LiveslotsBundle::<Counter>::default())
        .with(NOISY_COUNTER, LiveslotsBundle::<NoisyCounter>::default())
        .with(EXPORTER, LiveslotsBundle::<Exporter>::default())
        .with(HOLDER, LiveslotsBundle::<Holder>::default())
        .with(CALLER, LiveslotsBundle::<Caller>::default())
        .with(DEFERRED, LiveslotsBundle::<Deferred>::default())
        .with(DURABLE_COUNTER, LiveslotsBundle::new(|| DurableCounter::new(1)))
        .with(DURABLE_COUNTER_V2, LiveslotsBundle::new(|| DurableCounter::new(2)))
        .with(DEVICE_USER, LiveslotsBundle::<DeviceUser>::default())
        .with(BROKEN_START, LiveslotsBundle::<BrokenStart>::default())
        .with(STASH, LiveslotsBundle::<Stash>::default())
        .with(UNREAPABLE, UnreapableBundle)
}

fn single_arg(args: &CapData<VatSlot>) -> Result<VatSlot, VatError> {
    args.single_slot()
        .copied()
        .ok_or_else(|| VatError::rejected("expected a single reference"))
}

fn unknown(method: &str) -> VatError {
    VatError::rejected(format!("unknown method {method}"))
}

/// `counter`: a plain integer. `start` may carry `{"start": n}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
}

impl Vat for Counter {
    fn start(&mut self, _ctx: &mut VatCtx<'_>, params: &CapData<VatSlot>) -> Result<(), VatError> {
        if let Some(start) = params.body().get("start").and_then(Value::as_int) {
            self.count = start;
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "increment" => {
                self.count += 1;
                Ok(CapData::int(self.count).into())
            }
            "get" => Ok(CapData::int(self.count).into()),
            "fail" => Err(VatError::rejected("counter refused")),
            "crash" => Err(VatError::Fatal("counter crashed".into())),
            "exit" => {
                ctx.exit(false, args.clone())?;
                Ok(CapData::null().into())
            }
            other => Err(unknown(other)),
        }
    }
}

/// `noisy-counter`: state-compatible with [`Counter`] but writes to its
/// vatstore on every increment.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NoisyCounter {
    pub count: i64,
}

impl Vat for NoisyCounter {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        _args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "increment" => {
                self.count += 1;
                ctx.vatstore_set("noise", &self.count.to_string())?;
                Ok(CapData::int(self.count).into())
            }
            "get" => Ok(CapData::int(self.count).into()),
            other => Err(unknown(other)),
        }
    }
}

/// `exporter`: hands out fresh objects and lets go of them on request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Exporter {
    pub made: Vec<VatSlot>,
    pub retired: Vec<VatSlot>,
}

impl Vat for Exporter {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "make" => {
                let vref = ctx.export();
                self.made.push(vref);
                Ok(CapData::single(vref).into())
            }
            "forget" => {
                let vref = single_arg(args)?;
                self.made.retain(|made| *made != vref);
                ctx.release(vref);
                Ok(CapData::null().into())
            }
            "whoami" => Ok(CapData::text(target.to_string()).into()),
            "retired" => Ok(CapData::int(self.retired.len() as i64).into()),
            other => Err(unknown(other)),
        }
    }

    fn export_retired(&mut self, vref: VatSlot) {
        self.retired.push(vref);
    }
}

/// `holder`: keeps references strongly or weakly, and echoes.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Holder {
    pub held: Vec<VatSlot>,
    pub remembered: Vec<VatSlot>,
    pub retired: Vec<VatSlot>,
}

impl Vat for Holder {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "hold" => {
                self.held.push(single_arg(args)?);
                Ok(CapData::null().into())
            }
            "release" => {
                for vref in std::mem::take(&mut self.held) {
                    ctx.release(vref);
                }
                Ok(CapData::null().into())
            }
            "remember" => {
                let vref = single_arg(args)?;
                ctx.weak_set(vref, Value::Bool(true));
                ctx.release(vref);
                self.remembered.push(vref);
                Ok(CapData::null().into())
            }
            "recognizes" => {
                let known = self.remembered.iter().filter(|vref| ctx.weak_has(vref)).count();
                Ok(CapData::int(known as i64).into())
            }
            "forget" => {
                for vref in std::mem::take(&mut self.remembered) {
                    ctx.weak_delete(&vref);
                }
                Ok(CapData::null().into())
            }
            "echo" => Ok(args.clone().into()),
            other => Err(unknown(other)),
        }
    }

    fn import_retired(&mut self, vref: VatSlot) {
        self.retired.push(vref);
    }
}

/// `caller`: sends to other vats and reports what came back.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Caller {
    /// Outstanding sends, keyed by their result promise, with the result
    /// promise of the host request that caused them.
    pub pending: BTreeMap<VatSlot, VatSlot>,
    pub notifications: Vec<(bool, Value)>,
}

impl Vat for Caller {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "relay" => {
                let target = single_arg(args)?;
                let vpid = ctx.send(target, "increment", CapData::null())?;
                match ctx.result() {
                    Some(result) => {
                        self.pending.insert(vpid, result);
                        Ok(Reply::Pending)
                    }
                    None => Ok(CapData::null().into()),
                }
            }
            "forward" => {
                let target = single_arg(args)?;
                let vpid = ctx.send(target, "increment", CapData::null())?;
                Ok(CapData::single(vpid).into())
            }
            "poke" => {
                let target = single_arg(args)?;
                ctx.send_only(target, "increment", CapData::null())?;
                Ok(CapData::null().into())
            }
            "notifications" => Ok(CapData::int(self.notifications.len() as i64).into()),
            other => Err(unknown(other)),
        }
    }

    fn notify(
        &mut self,
        ctx: &mut VatCtx<'_>,
        promise: VatSlot,
        rejected: bool,
        data: &CapData<VatSlot>,
    ) -> Result<(), VatError> {
        self.notifications.push((rejected, data.body().clone()));
        if let Some(result) = self.pending.remove(&promise) {
            if rejected {
                ctx.reject(result, data.clone())?;
            } else {
                ctx.resolve(result, data.clone())?;
            }
        }
        Ok(())
    }
}

/// `deferred`: answers `later` only when told to `fulfill`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Deferred {
    pub waiting: Option<VatSlot>,
    pub pings: i64,
}

impl Vat for Deferred {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "later" => {
                self.waiting = ctx.result();
                Ok(Reply::Pending)
            }
            // settling the same promise twice is a vat fault
            "fulfill" => {
                let vpid = self
                    .waiting
                    .ok_or_else(|| VatError::rejected("nothing is waiting"))?;
                ctx.resolve(vpid, args.clone())?;
                Ok(CapData::null().into())
            }
            "ping" => {
                self.pings += 1;
                Ok(CapData::int(self.pings).into())
            }
            other => Err(unknown(other)),
        }
    }
}

/// `durable-counter` (v1) and `durable-counter-v2`: a heap count that
/// resets on upgrade next to a baggage count that survives it.
#[derive(Debug, Serialize, Deserialize)]
pub struct DurableCounter {
    pub version: i64,
    pub count: i64,
}

impl DurableCounter {
    pub fn new(version: i64) -> Self {
        Self { version, count: 0 }
    }
}

impl Vat for DurableCounter {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        _args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "bump" => {
                self.count += 1;
                let stored = ctx
                    .baggage_get("counter")?
                    .and_then(|value| value.as_int())
                    .unwrap_or(0);
                ctx.baggage_set("counter", &Value::Int(stored + 1))?;
                Ok(CapData::int(stored + 1).into())
            }
            "read" => {
                let stored = ctx.baggage_get("counter")?.unwrap_or(Value::Null);
                let stopped = ctx.baggage_get("stopped")?.unwrap_or(Value::Bool(false));
                let body = Value::record([
                    ("version", Value::Int(self.version)),
                    ("heap", Value::Int(self.count)),
                    ("baggage", stored),
                    ("stopped", stopped),
                ]);
                Ok(CapData::data(body)?.into())
            }
            "makeDurable" => Ok(CapData::single(ctx.export_durable()?).into()),
            "makeEphemeral" => Ok(CapData::single(ctx.export()).into()),
            "ping" => Ok(CapData::text("pong").into()),
            other => Err(unknown(other)),
        }
    }

    fn stop(&mut self, ctx: &mut VatCtx<'_>) -> Result<(), VatError> {
        ctx.baggage_set("stopped", &Value::Bool(true))
    }
}

/// `device-user`: keeps the device node from its parameters and calls it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeviceUser {
    pub device: Option<VatSlot>,
}

impl Vat for DeviceUser {
    fn start(&mut self, _ctx: &mut VatCtx<'_>, params: &CapData<VatSlot>) -> Result<(), VatError> {
        self.device = params.slots().first().copied();
        Ok(())
    }

    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        let device = self
            .device
            .ok_or_else(|| VatError::rejected("no device was provided"))?;
        let data = ctx
            .call_now(device, method, args.clone())
            .map_err(|err| VatError::rejected(err.to_string()))?;
        Ok(data.into())
    }
}

/// `broken-start`: fails every start.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BrokenStart {}

impl Vat for BrokenStart {
    fn start(&mut self, _ctx: &mut VatCtx<'_>, _params: &CapData<VatSlot>) -> Result<(), VatError> {
        Err(VatError::Fatal("refusing to start".into()))
    }

    fn deliver(
        &mut self,
        _ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        _method: &str,
        _args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        Ok(CapData::null().into())
    }
}

/// `stash`: keeps one reference in baggage and another on the heap.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Stash {
    pub held: Vec<VatSlot>,
}

impl Vat for Stash {
    fn deliver(
        &mut self,
        ctx: &mut VatCtx<'_>,
        _target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<Reply, VatError> {
        match method {
            "stash" => {
                let vref = single_arg(args)?;
                ctx.baggage_set_data("kept", &CapData::single(vref))?;
                ctx.release(vref);
                Ok(CapData::null().into())
            }
            "hold" => {
                self.held.push(single_arg(args)?);
                Ok(CapData::null().into())
            }
            // increments whatever counter was stashed
            "poke" => {
                let kept = ctx
                    .baggage_get_data("kept")?
                    .ok_or_else(|| VatError::rejected("nothing is stashed"))?;
                let target = single_arg(&kept)?;
                ctx.send_only(target, "increment", CapData::null())?;
                ctx.release(target);
                Ok(CapData::null().into())
            }
            "unstash" => {
                ctx.baggage_delete("kept")?;
                Ok(CapData::null().into())
            }
            other => Err(unknown(other)),
        }
    }
}

/// `unreapable`: a [`Counter`] whose bring-out-your-dead always fails.
pub struct Unreapable(LiveslotsDispatch<Counter>);

impl Dispatch for Unreapable {
    fn deliver(&mut self, delivery: &VatDelivery, syscall: &mut dyn Syscall) -> DeliveryStatus {
        match delivery {
            VatDelivery::BringOutYourDead => DeliveryStatus::error("reap refused"),
            other => self.0.deliver(other, syscall),
        }
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, String> {
        self.0.snapshot()
    }
}

pub struct UnreapableBundle;

impl VatBundle for UnreapableBundle {
    fn build(&self) -> Result<Box<dyn Dispatch>, String> {
        Ok(Box::new(Unreapable(LiveslotsDispatch::new(Counter::default()))))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Box<dyn Dispatch>, String> {
        let inner = LiveslotsDispatch::<Counter>::restore(snapshot).map_err(|err| err.to_string())?;
        Ok(Box::new(Unreapable(inner)))
    }
}
