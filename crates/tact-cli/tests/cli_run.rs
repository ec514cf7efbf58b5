// End-to-end runs of the tact binary against real shells; Unix only.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

use std::path::Path;
use std::process::{Command, Output};

fn write_config(dir: &Path, config: &str) {
    std::fs::write(dir.join("tact.config.json"), config).unwrap();
}

fn write_test_file(dir: &Path, name: &str, body: &str) {
    let tests = dir.join("tests");
    std::fs::create_dir_all(&tests).unwrap();
    std::fs::write(tests.join(name), body).unwrap();
}

fn run_tact(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tact"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to launch tact")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn passing_test_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "prompt.tact",
        "use shell=bash env.PS1=\"tact> \"\n\
         test \"shows a prompt\" {\n  expect \"tact> \" timeout=10000\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(&output),
        stderr(&output)
    );
    assert!(stdout(&output).contains("shows a prompt"));
    assert!(stdout(&output).contains("1 passed"));
}

#[test]
fn hanging_test_times_out_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 500, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "hang.tact",
        "use shell=bash\ntest \"hangs forever\" {\n  sleep 60000\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(1));
    let text = stdout(&output);
    assert!(text.contains("500 ms"), "stdout: {text}");
    assert!(text.contains("1 failed"), "stdout: {text}");
}

#[test]
fn failing_then_passing_test_is_flaky_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"{"timeout": 15000, "retries": 2, "expect": {"timeout": 1500}, "workers": 1}"#,
    );
    // First attempt: no marker file, the echo never runs, the expect times
    // out. The attempt leaves the marker behind, so the retry passes. The
    // probed string is built with arithmetic so the echoed command line
    // itself cannot satisfy the expectation.
    write_test_file(
        dir.path(),
        "flaky.tact",
        "use shell=bash env.PS1=\"> \"\n\
         test \"settles on retry\" {\n\
           expect \"> \" timeout=10000\n\
           write \"test -f marker && echo RETRY-$((1+1))-PASS; touch marker\\r\"\n\
           expect \"RETRY-2-PASS\"\n\
         }\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(&output),
        stderr(&output)
    );
    let text = stdout(&output);
    assert!(text.contains("flaky"), "stdout: {text}");
    assert!(text.contains("1 flaky"), "stdout: {text}");
}

#[test]
fn only_annotation_gates_the_selection() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "gated.tact",
        "use shell=bash env.PS1=\"> \"\n\
         test \"not this one\" {\n  expect \"> \" timeout=10000\n}\n\
         test.only \"just this one\" {\n  expect \"> \" timeout=10000\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("running 1 tests"), "stdout: {text}");
    assert!(text.contains("just this one"), "stdout: {text}");
    assert!(!text.contains("not this one"), "stdout: {text}");
}

#[test]
fn snapshot_written_then_matched_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "snap.tact",
        "use shell=bash env.PS1=\"> \"\n\
         test \"stable screen\" {\n\
           expect \"> \" timeout=10000\n\
           write \"echo S-$((2+3))-done\\r\"\n\
           expect \"S-5-done\"\n\
           sleep 500\n\
           snapshot\n\
         }\n",
    );

    let first = run_tact(dir.path(), &["--update-snapshot"]);
    assert!(
        first.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(&first),
        stderr(&first)
    );
    let snapshot_file = dir.path().join("tests/__snapshots__/snap.snap.json");
    assert!(snapshot_file.is_file());
    let stored = std::fs::read_to_string(&snapshot_file).unwrap();
    assert!(stored.contains("S-5-done"));

    let second = run_tact(dir.path(), &[]);
    assert!(
        second.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(&second),
        stderr(&second)
    );
}

#[test]
fn global_timeout_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1, "global_timeout": 100}"#);
    write_test_file(
        dir.path(),
        "slow.tact",
        "use shell=bash\ntest \"sleeps long\" {\n  sleep 10000\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("global timeout (100 ms) exceeded"),
        "stderr: {}",
        stderr(&output)
    );
}

#[test]
fn invalid_filter_regex_is_a_fatal_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "any.tact",
        "use shell=bash\ntest \"t\" { sleep 1 }\n",
    );

    let output = run_tact(dir.path(), &["[broken"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("invalid test filter"),
        "stderr: {}",
        stderr(&output)
    );
}

#[test]
fn filters_restrict_runs_to_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "alpha.tact",
        "use shell=bash env.PS1=\"> \"\ntest \"in alpha\" {\n  expect \"> \" timeout=10000\n}\n",
    );
    write_test_file(
        dir.path(),
        "beta.tact",
        "use shell=bash env.PS1=\"> \"\ntest \"in beta\" {\n  expect \"> \" timeout=10000\n}\n",
    );

    let output = run_tact(dir.path(), &["alpha"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("in alpha"), "stdout: {text}");
    assert!(!text.contains("in beta"), "stdout: {text}");
}

#[test]
fn skipped_tests_are_reported_without_running() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1}"#);
    write_test_file(
        dir.path(),
        "skip.tact",
        "use shell=bash env.PS1=\"> \"\n\
         test.skip \"left out\" {\n  expect \"never\" timeout=100\n}\n\
         test \"runs\" {\n  expect \"> \" timeout=10000\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("1 passed"), "stdout: {text}");
    assert!(text.contains("1 skipped"), "stdout: {text}");
}

#[test]
fn fail_annotation_inverts_the_expectation() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), r#"{"timeout": 15000, "workers": 1, "expect": {"timeout": 800}}"#);
    write_test_file(
        dir.path(),
        "inverted.tact",
        "use shell=bash env.PS1=\"> \"\n\
         test.fail \"expected to fail\" {\n  expect \"this never shows up\"\n}\n",
    );

    let output = run_tact(dir.path(), &[]);
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(&output),
        stderr(&output)
    );
    assert!(stdout(&output).contains("1 passed"));
}
