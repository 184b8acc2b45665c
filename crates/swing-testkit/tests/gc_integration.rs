mod helpers;

use helpers::{int, quiet_config, slot};
use swing_abi::{
    CapData, DeliveryStatus, Message, Syscall, SyscallResult, VatDelivery, VatSlot, VatSyscall,
};
use swing_testkit::TestKernel;
use swing_testkit::fixtures::{EXPORTER, Exporter, HOLDER};
use swing_vat_sdk::LiveslotsDispatch;

/// An object imported by one vat is dropped, retired at its exporter and
/// deleted once the importer lets go.
#[test]
fn released_import_is_dropped_and_retired_at_the_exporter() {
    let mut tk = TestKernel::with_config(quiet_config());
    let exporter = tk.create("exporter", EXPORTER);
    let holder = tk.create("holder", HOLDER);
    let exporter_root = tk.root(exporter);
    let holder_root = tk.root(holder);

    let obj = slot(&tk.call_ok(exporter_root, "make", CapData::null()));
    tk.call_ok(holder_root, "hold", CapData::single(obj));
    tk.call_ok(exporter_root, "forget", CapData::single(obj));
    tk.kernel.release_kref(obj).unwrap();
    tk.run();
    assert_eq!(tk.refcount(obj), Some((1, 1)));
    tk.assert_consistent();

    tk.call_ok(holder_root, "release", CapData::null());
    tk.kernel.reap_all_vats().unwrap();
    tk.run();

    assert_eq!(tk.refcount(obj), None);
    assert!(!tk.kernel.keeper().object_exists(obj).unwrap());
    assert_eq!(tk.kernel.keeper().clist_entry(exporter, obj).unwrap(), None);
    assert_eq!(tk.kernel.keeper().clist_entry(holder, obj).unwrap(), None);
    assert_eq!(int(&tk.call_ok(exporter_root, "retired", CapData::null())), 1);
    let stats = tk.kernel.stats().unwrap();
    assert_eq!(stats.dispatch.by_kind["dropExports"], 1);
    assert_eq!(stats.dispatch.by_kind["retireExports"], 1);
    tk.assert_consistent();
}

/// A weakly held import stays recognizable after it is dropped, and goes
/// away once the exporter retires it.
#[test]
fn weakly_held_import_keeps_the_object_recognizable() {
    let mut tk = TestKernel::with_config(quiet_config());
    let exporter = tk.create("exporter", EXPORTER);
    let holder = tk.create("holder", HOLDER);
    let exporter_root = tk.root(exporter);
    let holder_root = tk.root(holder);

    let obj = slot(&tk.call_ok(exporter_root, "make", CapData::null()));
    tk.call_ok(holder_root, "remember", CapData::single(obj));
    tk.call_ok(exporter_root, "forget", CapData::single(obj));
    tk.kernel.release_kref(obj).unwrap();
    tk.kernel.reap_all_vats().unwrap();
    tk.run();

    assert_eq!(tk.refcount(obj), Some((0, 1)));
    let entry = tk.kernel.keeper().clist_entry(exporter, obj).unwrap().unwrap();
    assert!(!entry.reachable);
    assert_eq!(int(&tk.call_ok(holder_root, "recognizes", CapData::null())), 1);
    tk.assert_consistent();

    tk.call_ok(holder_root, "forget", CapData::null());
    tk.kernel.reap_all_vats().unwrap();
    tk.run();

    assert!(!tk.kernel.keeper().object_exists(obj).unwrap());
    assert_eq!(tk.kernel.keeper().clist_entry(holder, obj).unwrap(), None);
    assert_eq!(int(&tk.call_ok(holder_root, "recognizes", CapData::null())), 0);
    tk.assert_consistent();
}

/// Vat roots are pinned and survive a full reap with no other holders.
#[test]
fn pinned_roots_survive_reaping() {
    let mut tk = TestKernel::with_config(quiet_config());
    let exporter = tk.create("exporter", EXPORTER);
    let root = tk.root(exporter);
    assert_eq!(tk.kernel.keeper().pinned_objects().unwrap(), vec![root]);

    tk.kernel.reap_all_vats().unwrap();
    tk.run();
    assert_eq!(tk.refcount(root), Some((1, 1)));
    let whoami = tk.call_ok(root, "whoami", CapData::null());
    assert_eq!(whoami.body().as_text(), Some("o+0"));
}

/// Answers every syscall as if the kernel had nothing stored.
struct Blank;

impl Syscall for Blank {
    fn call(&mut self, syscall: VatSyscall) -> SyscallResult {
        match syscall {
            VatSyscall::VatstoreGet { .. } | VatSyscall::VatstoreGetNextKey { .. } => {
                SyscallResult::Value { value: None }
            }
            _ => SyscallResult::Ok,
        }
    }
}

/// Repeated dropExports and retireExports leave the vat unchanged.
#[test]
fn repeated_gc_deliveries_are_idempotent() {
    let mut dispatch = LiveslotsDispatch::new(Exporter::default());
    let start = VatDelivery::StartVat {
        params: CapData::null(),
    };
    assert_eq!(dispatch.deliver_to(&start), DeliveryStatus::Ok);
    let make = VatDelivery::Message {
        target: VatSlot::root(),
        msg: Message::new("make", CapData::null(), Some(VatSlot::promise_import(1))),
    };
    assert_eq!(dispatch.deliver_to(&make), DeliveryStatus::Ok);
    let made = VatSlot::export(1);

    let drop = VatDelivery::DropExports { vrefs: vec![made] };
    assert_eq!(dispatch.deliver_to(&drop), DeliveryStatus::Ok);
    let once = dispatch.image();
    assert_eq!(dispatch.deliver_to(&drop), DeliveryStatus::Ok);
    assert_eq!(dispatch.image(), once);

    let retire = VatDelivery::RetireExports { vrefs: vec![made] };
    assert_eq!(dispatch.deliver_to(&retire), DeliveryStatus::Ok);
    let once = dispatch.image();
    assert_eq!(dispatch.deliver_to(&retire), DeliveryStatus::Ok);
    assert_eq!(dispatch.image(), once);
    assert_eq!(dispatch.vat().retired, vec![made]);
    assert!(!dispatch.slots().is_export(&made));
}

trait DriveDispatch {
    fn deliver_to(&mut self, delivery: &VatDelivery) -> DeliveryStatus;
    fn image(&mut self) -> Vec<u8>;
}

impl DriveDispatch for LiveslotsDispatch<Exporter> {
    fn deliver_to(&mut self, delivery: &VatDelivery) -> DeliveryStatus {
        swing_abi::Dispatch::deliver(self, delivery, &mut Blank)
    }

    fn image(&mut self) -> Vec<u8> {
        swing_abi::Dispatch::snapshot(self).expect("snapshot")
    }
}
