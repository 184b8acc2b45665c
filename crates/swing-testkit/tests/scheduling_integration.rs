mod helpers;

use helpers::{Recorder, int, quiet_config};
use swing_abi::{CapData, KernelSlot};
use swing_kernel::{
    ComputronBudgetPolicy, CrankLimitPolicy, KernelError, PauseOnExhaustion, ReapInterval, VatOptions,
};
use swing_testkit::fixtures::{COUNTER, DEVICE_USER, HOLDER};
use swing_testkit::{TestKernel, fixture_registry};

/// A crank limit stops the run with work left over; the next run picks up
/// where it stopped.
#[test]
fn crank_limit_stops_the_run() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let root = tk.root(counter);
    for _ in 0..10 {
        tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();
    }

    let outcome = tk.kernel.run(&mut CrankLimitPolicy::new(3)).unwrap();
    assert_eq!(outcome.cranks, 3);
    assert!(outcome.has_more_work);
    assert_eq!(tk.kernel.run_queue_len().unwrap(), 7);

    assert_eq!(tk.run(), 7);
    assert!(!tk.kernel.has_work().unwrap());
    assert_eq!(int(&tk.call_ok(root, "get", CapData::null())), 10);
}

/// A zero crank limit runs nothing.
#[test]
fn zero_crank_limit_runs_nothing() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let root = tk.root(counter);
    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();

    let outcome = tk.kernel.run(&mut CrankLimitPolicy::new(0)).unwrap();
    assert_eq!(outcome.cranks, 0);
    assert!(outcome.has_more_work);
    assert_eq!(tk.kernel.run_queue_len().unwrap(), 1);
}

/// `step` runs one crank and reports whether more work is waiting.
#[test]
fn step_reports_remaining_work() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let root = tk.root(counter);
    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();
    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();

    assert!(tk.kernel.step().unwrap());
    assert!(!tk.kernel.step().unwrap());
    assert!(!tk.kernel.step().unwrap());
    assert_eq!(int(&tk.call_ok(root, "get", CapData::null())), 2);
}

/// A computron budget smaller than one delivery allows exactly one crank.
#[test]
fn computron_budget_stops_the_run() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let root = tk.root(counter);
    for _ in 0..3 {
        tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();
    }

    let mut policy = ComputronBudgetPolicy::new(1);
    let outcome = tk.kernel.run(&mut policy).unwrap();
    assert_eq!(outcome.cranks, 1);
    assert!(outcome.has_more_work);
    assert_eq!(policy.remaining(), 0);
}

/// A policy can pause the run instead of terminating a vat that ran out
/// of computrons. The message stays queued and goes through once the host
/// raises the limit.
#[test]
fn exhaustion_can_pause_the_run() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let root = tk.root(counter);
    tk.kernel.set_computron_limit(counter, Some(50)).unwrap();
    let crank = tk.kernel.crank_number().unwrap();
    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();

    let outcome = tk.kernel.run(&mut PauseOnExhaustion).unwrap();
    assert_eq!(outcome.cranks, 0);
    assert_eq!(outcome.paused, Some(counter));
    assert!(outcome.has_more_work);
    assert!(tk.kernel.is_vat_alive(counter).unwrap());
    assert_eq!(tk.kernel.run_queue_len().unwrap(), 1);
    assert_eq!(tk.kernel.crank_number().unwrap(), crank);

    tk.kernel.set_computron_limit(counter, None).unwrap();
    let outcome = tk.kernel.run(&mut PauseOnExhaustion).unwrap();
    assert_eq!(outcome.cranks, 1);
    assert_eq!(outcome.paused, None);
    assert_eq!(int(&tk.call_ok(root, "get", CapData::null())), 1);
    tk.assert_consistent();
}

/// Creation is reported to the policy through its own hook.
#[test]
fn vat_creation_reaches_the_policy() {
    let mut tk = TestKernel::with_config(quiet_config());
    tk.kernel
        .create_vat("counter", COUNTER, CapData::null(), VatOptions::named("counter"))
        .unwrap();
    let mut recorder = Recorder::default();
    tk.kernel.run(&mut recorder).unwrap();
    assert_eq!(recorder.kinds, vec!["createVat"]);
}

/// A vat with a reap interval is reaped as soon as it has seen that many
/// deliveries; creation counts as one.
#[test]
fn reap_interval_schedules_bring_out_your_dead() {
    let mut tk = TestKernel::with_config(quiet_config());
    let options = VatOptions::named("counter").with_reap_interval(ReapInterval::Deliveries(2));
    let counter = tk.create_with("counter", COUNTER, CapData::null(), options);
    let root = tk.root(counter);

    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();
    let mut recorder = Recorder::default();
    tk.kernel.run(&mut recorder).unwrap();
    assert_eq!(recorder.kinds, vec!["send", "bringOutYourDead"]);

    tk.kernel.queue_to_kref(root, "increment", CapData::null()).unwrap();
    let mut recorder = Recorder::default();
    tk.kernel.run(&mut recorder).unwrap();
    assert_eq!(recorder.kinds, vec!["send"]);
}

/// Vats reach host devices through the device node handed to them.
#[test]
fn device_calls_are_synchronous() {
    let clock = |method: &str, _args: CapData<KernelSlot>| -> Result<CapData<KernelSlot>, String> {
        match method {
            "now" => Ok(CapData::int(42)),
            other => Err(format!("clock has no method {other}")),
        }
    };
    let mut tk = TestKernel::with_device(quiet_config(), "clock", clock);
    let node = tk.kernel.device_node("clock").unwrap();
    assert!(matches!(tk.kernel.device_node("nope"), Err(KernelError::UnknownDevice(_))));

    let user = tk.create_with("user", DEVICE_USER, CapData::single(node), VatOptions::named("user"));
    let root = tk.root(user);
    assert_eq!(int(&tk.call_ok(root, "now", CapData::null())), 42);

    let (rejected, data) = tk.call(root, "later", CapData::null());
    assert!(rejected);
    assert!(helpers::error_message(&data).contains("clock has no method later"));
    assert!(tk.kernel.is_vat_alive(user).unwrap());
}

/// Corrupted reference counts are caught when they are next changed, and
/// the kernel refuses further work.
#[test]
fn refcount_underflow_panics_the_kernel() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let holder = tk.create("holder", HOLDER);
    let counter_root = tk.root(counter);
    let holder_root = tk.root(holder);
    tk.call_ok(holder_root, "hold", CapData::single(counter_root));

    let key = format!("{counter_root}.refCount");
    let mut tk = tk.restart_with(fixture_registry(), |store| store.set(key, "0,0"));
    tk.call_ok(holder_root, "release", CapData::null());
    tk.kernel.reap_all_vats().unwrap();

    let err = tk.kernel.run_until_idle().unwrap_err();
    assert!(matches!(err, KernelError::Panic(ref message) if message.contains("underflow")));
    assert!(tk.kernel.is_panicked());
    assert!(matches!(
        tk.kernel.invoke(counter_root, "get", CapData::null()),
        Err(KernelError::Panic(_))
    ));
    assert!(tk.kernel.commit().is_err());
}
