use predicates::prelude::*;
use std::fs;

fn nodeprobe() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("nodeprobe");
    cmd.env("RUST_LOG", "info");
    cmd
}

#[test]
fn empty_source_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("nodes.txt");
    fs::write(&source, "\n# nothing here\n").unwrap();
    let output = tmp.path().join("out.txt");

    nodeprobe()
        .args(["run", "--source"])
        .arg(&source)
        .arg("--output")
        .arg(&output)
        .arg("--work-dir")
        .arg(tmp.path().join("work"))
        .assert()
        .success()
        .stderr(predicate::str::contains("no nodes collected"));

    assert!(!output.exists());
}

#[test]
fn unreachable_sources_degrade_to_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let output = tmp.path().join("out.txt");

    nodeprobe()
        .arg("--source")
        .arg(tmp.path().join("missing.txt"))
        .arg("--output")
        .arg(&output)
        .arg("--work-dir")
        .arg(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("skipping source"));

    assert!(!output.exists());
}

#[test]
fn missing_engine_fails_every_node_and_keeps_previous_output() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("nodes.txt");
    fs::write(
        &source,
        "trojan://pw@a.example:443#A\nvless://id@b.example:443?type=ws\nvmess://%%%\n",
    )
    .unwrap();
    let output = tmp.path().join("out.txt");
    fs::write(&output, "previous\n").unwrap();
    let work = tmp.path().join("work");

    nodeprobe()
        .arg("--source")
        .arg(&source)
        .arg("--output")
        .arg(&output)
        .arg("--work-dir")
        .arg(&work)
        .arg("--engine-bin")
        .arg(tmp.path().join("no-such-xray"))
        .assert()
        .success()
        .stderr(predicate::str::contains("run finished"))
        .stderr(predicate::str::contains("process_start_failed=2"))
        .stderr(predicate::str::contains("decode_failed=1"));

    assert_eq!(fs::read_to_string(&output).unwrap(), "previous\n");
    assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
}

#[test]
fn inspect_prints_engine_config() {
    nodeprobe()
        .args(["inspect", "trojan://secret@t.example.com:8443#Tokyo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# trojan t.example.com:8443 (Tokyo)"))
        .stdout(predicate::str::contains("\"protocol\": \"socks\""))
        .stdout(predicate::str::contains("\"password\": \"secret\""));
}

#[test]
fn inspect_rejects_garbage() {
    nodeprobe()
        .args(["inspect", "vmess://not base64 at all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("decode node"));
}

#[test]
fn rejects_out_of_range_concurrency() {
    nodeprobe()
        .args(["--concurrency", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1..=64"));
}

#[cfg(unix)]
#[test]
fn default_engine_is_the_one_in_the_working_directory() {
    use std::os::unix::fs::PermissionsExt as _;

    let tmp = tempfile::tempdir().unwrap();
    let engine = tmp.path().join("xray");
    fs::write(&engine, "#!/bin/sh\necho \"$@\" > \"$0.args\"\nexit 3\n").unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(tmp.path().join("nodes.txt"), "trojan://pw@a.example:443#A\n").unwrap();

    nodeprobe()
        .current_dir(tmp.path())
        .env("PATH", "/usr/bin:/bin")
        .args(["--source", "nodes.txt", "--work-dir", "work"])
        .assert()
        .success()
        .stderr(predicate::str::contains("engine binary not found").not())
        .stderr(predicate::str::contains("process_start_failed=1"));

    let args = fs::read_to_string(tmp.path().join("xray.args")).unwrap();
    assert!(args.starts_with("run -c "), "engine args: {args}");
    assert!(!tmp.path().join("out.txt").exists());
}
