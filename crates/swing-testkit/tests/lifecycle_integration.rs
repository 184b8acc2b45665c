mod helpers;

use helpers::{error_message, int, quiet_config, slot};
use swing_abi::{CapData, Value};
use swing_kernel::{KernelError, LifecycleEvent, TerminationRecord, VatOptions};
use swing_testkit::TestKernel;
use swing_testkit::fixtures::{
    BROKEN_START, COUNTER, DEFERRED, DURABLE_COUNTER, DURABLE_COUNTER_V2, EXPORTER, STASH,
};

/// An upgrade keeps baggage and durable exports, resets the heap, and
/// abandons ephemeral exports.
#[test]
fn upgrade_keeps_baggage_and_durable_exports() {
    let mut tk = TestKernel::new();
    let vat = tk.create("store", DURABLE_COUNTER);
    let root = tk.root(vat);
    tk.call_ok(root, "bump", CapData::null());
    assert_eq!(int(&tk.call_ok(root, "bump", CapData::null())), 2);
    let durable = slot(&tk.call_ok(root, "makeDurable", CapData::null()));
    let ephemeral = slot(&tk.call_ok(root, "makeEphemeral", CapData::null()));
    tk.kernel.drain_lifecycle_events();

    let upgrade_id = tk
        .kernel
        .upgrade_vat(vat, DURABLE_COUNTER_V2, CapData::null(), Value::text("to v2"))
        .unwrap();
    tk.run();

    assert_eq!(
        tk.kernel.drain_lifecycle_events(),
        vec![LifecycleEvent::VatUpgraded {
            vat,
            upgrade_id,
            incarnation: 1
        }]
    );
    assert_eq!(tk.kernel.incarnation(vat).unwrap(), 1);
    let state = tk.call_ok(root, "read", CapData::null());
    assert_eq!(state.body().get("version"), Some(&Value::Int(2)));
    assert_eq!(state.body().get("heap"), Some(&Value::Int(0)));
    assert_eq!(state.body().get("baggage"), Some(&Value::Int(2)));
    assert_eq!(state.body().get("stopped"), Some(&Value::Bool(true)));

    let pong = tk.call_ok(durable, "ping", CapData::null());
    assert_eq!(pong.body().as_text(), Some("pong"));
    let (rejected, data) = tk.call(ephemeral, "ping", CapData::null());
    assert!(rejected);
    assert_eq!(error_message(&data), "vat terminated");
    tk.assert_consistent();
}

/// Imports named in baggage survive an upgrade and stay usable; imports
/// only the heap held are dropped when the old incarnation stops.
#[test]
fn upgrade_keeps_imports_that_baggage_refers_to() {
    let mut tk = TestKernel::with_config(quiet_config());
    let counter = tk.create("counter", COUNTER);
    let exporter = tk.create("exporter", EXPORTER);
    let stash = tk.create("stash", STASH);
    let counter_root = tk.root(counter);
    let exporter_root = tk.root(exporter);
    let stash_root = tk.root(stash);

    let loose = slot(&tk.call_ok(exporter_root, "make", CapData::null()));
    tk.call_ok(stash_root, "hold", CapData::single(loose));
    tk.call_ok(stash_root, "stash", CapData::single(counter_root));
    tk.call_ok(exporter_root, "forget", CapData::single(loose));
    tk.kernel.release_kref(loose).unwrap();
    tk.run();
    assert_eq!(tk.refcount(loose), Some((1, 1)));

    tk.kernel
        .upgrade_vat(stash, STASH, CapData::null(), Value::Null)
        .unwrap();
    tk.run();

    let entry = tk
        .kernel
        .keeper()
        .clist_entry(stash, counter_root)
        .unwrap()
        .expect("stashed import survives");
    assert!(entry.reachable);
    assert_eq!(tk.kernel.keeper().clist_entry(stash, loose).unwrap(), None);
    assert!(!tk.kernel.keeper().object_exists(loose).unwrap());
    assert_eq!(int(&tk.call_ok(exporter_root, "retired", CapData::null())), 1);

    tk.call_ok(stash_root, "poke", CapData::null());
    assert_eq!(int(&tk.call_ok(counter_root, "get", CapData::null())), 1);
    tk.assert_consistent();

    tk.call_ok(stash_root, "unstash", CapData::null());
    tk.kernel.reap_all_vats().unwrap();
    tk.run();
    assert_eq!(tk.kernel.keeper().clist_entry(stash, counter_root).unwrap(), None);
    tk.assert_consistent();
}

/// Promises the old incarnation was deciding are rejected with an
/// upgrade record.
#[test]
fn upgrade_rejects_pending_results() {
    let mut tk = TestKernel::with_config(quiet_config());
    let vat = tk.create("deferred", DEFERRED);
    let root = tk.root(vat);
    tk.call_ok(root, "ping", CapData::null());
    let later = tk.kernel.invoke(root, "later", CapData::null()).unwrap();
    tk.run();

    tk.kernel
        .upgrade_vat(vat, DEFERRED, CapData::null(), Value::text("bye"))
        .unwrap();
    tk.run();

    let (rejected, data) = tk.kernel.kpid_resolution(later).unwrap();
    assert!(rejected);
    assert_eq!(data.body().get("name"), Some(&Value::text("vatUpgraded")));
    assert_eq!(data.body().get("upgradeMessage"), Some(&Value::text("bye")));
    assert_eq!(data.body().get("incarnationNumber"), Some(&Value::Int(0)));
    assert_eq!(int(&tk.call_ok(root, "ping", CapData::null())), 1);
    tk.assert_consistent();
}

/// A new incarnation that fails to start takes the vat down with it.
#[test]
fn failed_upgrade_terminates_the_vat() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    let root = tk.root(vat);
    tk.call_ok(root, "increment", CapData::null());
    tk.kernel.drain_lifecycle_events();

    let upgrade_id = tk
        .kernel
        .upgrade_vat(vat, BROKEN_START, CapData::null(), Value::Null)
        .unwrap();
    tk.run();

    let events = tk.kernel.drain_lifecycle_events();
    assert!(events.iter().any(|event| matches!(
        event,
        LifecycleEvent::VatUpgradeFailed { vat: failed, upgrade_id: id, .. } if *failed == vat && *id == upgrade_id
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        LifecycleEvent::VatTerminated { vat: dead, reject: true, .. } if *dead == vat
    )));
    assert!(!tk.kernel.is_vat_alive(vat).unwrap());
    assert_eq!(tk.kernel.incarnation(vat).unwrap(), 0);
}

/// Upgrades are refused for unknown bundles and dead vats.
#[test]
fn upgrade_requests_are_validated() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    assert!(matches!(
        tk.kernel.upgrade_vat(vat, "missing", CapData::null(), Value::Null),
        Err(KernelError::UnknownBundle(_))
    ));
    tk.kernel.terminate_vat(vat, CapData::null()).unwrap();
    tk.run();
    assert!(matches!(
        tk.kernel.upgrade_vat(vat, COUNTER, CapData::null(), Value::Null),
        Err(KernelError::VatTerminated(_))
    ));
}

/// Termination rejects what the vat was deciding, records why, freezes
/// its c-list, and splats later sends.
#[test]
fn terminate_rejects_decided_promises() {
    let mut tk = TestKernel::with_config(quiet_config());
    let vat = tk.create("deferred", DEFERRED);
    let root = tk.root(vat);
    let later = tk.kernel.invoke(root, "later", CapData::null()).unwrap();
    tk.run();

    tk.kernel.terminate_vat(vat, CapData::text("shutdown")).unwrap();
    tk.run();

    let (rejected, data) = tk.kernel.kpid_resolution(later).unwrap();
    assert!(rejected);
    assert_eq!(data.body(), &Value::text("shutdown"));
    assert_eq!(
        tk.kernel.keeper().termination_record(vat).unwrap(),
        Some(TerminationRecord {
            reject: true,
            info: Value::text("shutdown"),
        })
    );
    assert!(tk.kernel.keeper().terminated_vats().unwrap().contains(&vat));
    let frozen = tk.kernel.store().prefixed(&format!("{vat}.frozen.")).unwrap();
    assert!(frozen.iter().any(|(key, vref)| key.ends_with(&root.to_string()) && vref == "o+0"));
    assert!(tk.kernel.keeper().clist_entries(vat).unwrap().is_empty());

    let (rejected, data) = tk.call(root, "ping", CapData::null());
    assert!(rejected);
    assert_eq!(error_message(&data), "vat terminated");
    tk.assert_consistent();
}

/// A vat can end itself; the request that triggered it still completes.
#[test]
fn vat_exit_is_recorded() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    let root = tk.root(vat);

    let data = tk.call_ok(root, "exit", CapData::text("done"));
    assert_eq!(data.body(), &Value::Null);
    assert!(!tk.kernel.is_vat_alive(vat).unwrap());
    assert_eq!(
        tk.kernel.keeper().termination_record(vat).unwrap(),
        Some(TerminationRecord {
            reject: false,
            info: Value::text("done"),
        })
    );
    assert!(tk.kernel.drain_lifecycle_events().contains(&LifecycleEvent::VatTerminated {
        vat,
        reject: false,
        info: Value::text("done"),
    }));
}

/// A fatal delivery error terminates the vat and rejects the request.
#[test]
fn crash_terminates_the_vat() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    let root = tk.root(vat);

    let (rejected, data) = tk.call(root, "crash", CapData::null());
    assert!(rejected);
    assert_eq!(error_message(&data), "vat terminated");
    let record = tk.kernel.keeper().termination_record(vat).unwrap().unwrap();
    assert!(matches!(record.info, Value::Error { ref message } if message.contains("counter crashed")));
    assert!(!tk.kernel.is_panicked());
}

/// Losing a critical vat panics the kernel for good.
#[test]
fn critical_vat_failure_panics_the_kernel() {
    let mut tk = TestKernel::new();
    let options = VatOptions::named("boss").critical();
    let vat = tk.create_with("boss", COUNTER, CapData::null(), options);
    let root = tk.root(vat);

    tk.kernel.invoke(root, "crash", CapData::null()).unwrap();
    let err = tk.kernel.run_until_idle().unwrap_err();
    assert!(matches!(err, KernelError::Panic(ref message) if message.contains("critical")));
    assert!(tk.kernel.is_panicked());
    assert!(matches!(
        tk.kernel.invoke(root, "get", CapData::null()),
        Err(KernelError::Panic(_))
    ));
    assert!(matches!(tk.kernel.commit(), Err(KernelError::Panic(_))));
}

/// A vat whose start fails is reported and never comes alive.
#[test]
fn failed_start_is_reported() {
    let mut tk = TestKernel::new();
    let vat = tk.create("broken", BROKEN_START);
    assert!(!tk.kernel.is_vat_alive(vat).unwrap());
    let events = tk.kernel.drain_lifecycle_events();
    assert!(events.iter().any(|event| matches!(
        event,
        LifecycleEvent::VatCreateFailed { vat: failed, error } if *failed == vat && error.contains("refusing to start")
    )));
    assert!(!events.iter().any(|event| matches!(event, LifecycleEvent::VatCreated { .. })));
}

/// Names are unique and bundles must be registered.
#[test]
fn create_requests_are_validated() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    assert_eq!(tk.kernel.vat_id("counter").unwrap(), vat);
    assert!(matches!(
        tk.kernel
            .create_vat("counter", COUNTER, CapData::null(), VatOptions::default()),
        Err(KernelError::DuplicateVatName(_))
    ));
    assert!(matches!(
        tk.kernel
            .create_vat("other", "missing", CapData::null(), VatOptions::default()),
        Err(KernelError::UnknownBundle(_))
    ));
    assert!(matches!(tk.kernel.vat_id("nobody"), Err(KernelError::UnknownVat(_))));
}

/// Start parameters reach the new vat.
#[test]
fn start_parameters_are_delivered() {
    let mut tk = TestKernel::new();
    let params = CapData::data(Value::record([("start", Value::Int(40))])).unwrap();
    let vat = tk.create_with("counter", COUNTER, params, VatOptions::named("counter"));
    let root = tk.root(vat);
    assert_eq!(int(&tk.call_ok(root, "increment", CapData::null())), 41);
}

/// A crank that spends more than the vat's computron limit is undone and
/// the vat terminated.
#[test]
fn metering_overrun_terminates_the_vat() {
    let mut tk = TestKernel::new();
    let vat = tk.create("counter", COUNTER);
    let root = tk.root(vat);
    tk.call_ok(root, "increment", CapData::null());

    tk.kernel
        .change_vat_options(vat, VatOptions::named("ignored").with_computron_limit(50))
        .unwrap();
    tk.run();
    let options = tk.kernel.keeper().vat_options(vat).unwrap();
    assert_eq!(options.name, "counter");
    assert_eq!(options.crank_computron_limit, Some(50));

    let (rejected, data) = tk.call(root, "increment", CapData::null());
    assert!(rejected);
    assert_eq!(error_message(&data), "vat terminated");
    let record = tk.kernel.keeper().termination_record(vat).unwrap().unwrap();
    assert!(matches!(record.info, Value::Error { ref message } if message.contains("computron limit")));
}
