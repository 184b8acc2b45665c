#[test]
fn help_mentions_global_flags_and_commands() {
    let output = std::process::Command::new(assert_cmd::cargo::cargo_bin!("swing"))
        .arg("--help")
        .output()
        .expect("run help");
    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);

    for needle in ["--db", "--json", "--pretty", "snapshots", "transcript", "replace-bundle", "check"] {
        assert!(text.contains(needle), "help output should contain '{needle}'");
    }
}

#[test]
fn transcript_help_lists_prune_options() {
    let output = std::process::Command::new(assert_cmd::cargo::cargo_bin!("swing"))
        .args(["transcript", "prune", "--help"])
        .output()
        .expect("run help");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in ["--vat", "--snapshots"] {
        assert!(text.contains(needle), "prune help should contain '{needle}'");
    }
}
