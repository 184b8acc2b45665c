use std::path::{Path, PathBuf};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use swing_abi::CapData;
use swing_kernel::KernelConfig;
use swing_store::{SqliteBackend, SwingStore};
use swing_testkit::TestKernel;
use swing_testkit::fixtures::COUNTER;
use tempfile::TempDir;

/// A committed kernel with one counter vat that has taken a snapshot.
/// Returns the database path and the counter's root object.
fn seed(tmp: &TempDir) -> (PathBuf, String) {
    let path = tmp.path().join("kernel.sqlite");
    let store = SwingStore::new(SqliteBackend::open(&path).expect("open db"));
    let mut tk = TestKernel::with_store(store, KernelConfig::default());
    let vat = tk.create("counter", COUNTER);
    let root = tk.root(vat);
    for _ in 0..4 {
        tk.call_ok(root, "increment", CapData::null());
    }
    tk.kernel.commit().expect("commit");
    (path, root.to_string())
}

fn swing(db: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin!("swing"));
    cmd.arg("--db").arg(db).env_remove("SWING_DB");
    cmd
}

fn json_output(db: &Path, args: &[&str]) -> serde_json::Value {
    let assert = swing(db).args(args).arg("--json").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    serde_json::from_str(&output).expect("json")
}

#[test]
fn dump_reads_single_keys_and_prefixes() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, root) = seed(&tmp);

    let json = json_output(&db, &["dump", "vat.name.counter"]);
    assert_eq!(json["data"], "v1");

    let json = json_output(&db, &["dump", "--prefix", "v1.c."]);
    let clist = json["data"].as_object().expect("object");
    assert!(clist.keys().any(|key| key.ends_with(&root)));

    swing(&db)
        .args(["dump", "no.such.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn stats_and_vats_describe_the_kernel() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, _) = seed(&tmp);

    let json = json_output(&db, &["stats"]);
    assert_eq!(json["data"]["vats"].as_u64(), Some(1));
    assert!(json["data"]["crankNumber"].as_u64().unwrap_or_default() >= 5);
    assert_eq!(json["data"]["runQueueLength"].as_u64(), Some(0));

    let json = json_output(&db, &["vats"]);
    let rows = json["data"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "v1");
    assert_eq!(rows[0]["name"], "counter");
    assert_eq!(rows[0]["bundle"], COUNTER);
    assert_eq!(rows[0]["alive"], true);
    assert!(rows[0].get("terminated").is_none());
}

#[test]
fn snapshots_can_be_listed_and_extracted() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, _) = seed(&tmp);

    let json = json_output(&db, &["snapshots", "list", "--vat", "counter"]);
    let records = json["data"].as_array().expect("records");
    let current = records
        .iter()
        .find(|record| record["in_use"] == true)
        .expect("in-use snapshot");
    assert_eq!(current["vat_id"], "v1");
    let pos = current["snap_pos"].as_u64().expect("position").to_string();

    let out = tmp.path().join("v1.snapshot");
    let json = json_output(&db, &["snapshots", "extract", "v1", &pos, "--out", out.to_str().unwrap()]);
    let written = std::fs::read(&out).expect("snapshot file");
    assert_eq!(json["data"]["bytes"].as_u64(), Some(written.len() as u64));
    assert_eq!(current["uncompressed_size"].as_u64(), Some(written.len() as u64));

    swing(&db)
        .args(["snapshots", "extract", "v1", "9999", "--out"])
        .arg(tmp.path().join("missing.snapshot"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no snapshot"));
}

#[test]
fn transcript_prune_drops_superseded_items() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, _) = seed(&tmp);

    let json = json_output(&db, &["transcript", "spans", "counter"]);
    let spans = json["data"].as_array().expect("spans");
    assert!(spans.len() >= 2);
    assert_eq!(spans.iter().filter(|span| span["is_current"] == true).count(), 1);

    let json = json_output(&db, &["transcript", "prune", "--snapshots"]);
    assert_eq!(json["data"]["vats"].as_u64(), Some(1));
    assert!(json["data"]["items"].as_u64().unwrap_or_default() > 0);
    assert_eq!(json["data"]["snapshots"].as_u64(), Some(0));

    let json = json_output(&db, &["transcript", "prune"]);
    assert_eq!(json["data"]["items"].as_u64(), Some(0));

    let json = json_output(&db, &["check"]);
    assert_eq!(json["data"], "ok");
}

#[test]
fn replace_bundle_rewrites_the_vat_source() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, _) = seed(&tmp);

    let json = json_output(&db, &["replace-bundle", "counter", "noisy-counter"]);
    assert_eq!(json["data"]["vat"], "v1");
    assert_eq!(json["data"]["previous"], COUNTER);
    assert_eq!(json["data"]["bundle"], "noisy-counter");

    let json = json_output(&db, &["vats"]);
    assert_eq!(json["data"][0]["bundle"], "noisy-counter");

    swing(&db)
        .args(["replace-bundle", "nobody", "counter"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown vat"));
}

#[test]
fn check_reports_tampered_refcounts() {
    let tmp = TempDir::new().expect("tmpdir");
    let (db, root) = seed(&tmp);
    let json = json_output(&db, &["check"]);
    assert_eq!(json["data"], "ok");

    let mut store = SwingStore::new(SqliteBackend::open(&db).expect("open db"));
    store.set(format!("{root}.refCount"), "7,7");
    store.commit().expect("commit");

    let assert = swing(&db)
        .args(["check", "--json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invariant violation"));
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&output).expect("json");
    assert!(!json["data"].as_array().expect("violations").is_empty());
}

#[test]
fn missing_database_is_an_error() {
    let tmp = TempDir::new().expect("tmpdir");
    let db = tmp.path().join("absent.sqlite");

    swing(&db)
        .arg("stats")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
    assert!(!db.exists(), "the CLI must not create a database");
}
