// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! End-to-end specs for the `kahlod` binary (§5 "SUPPLEMENTED FEATURES"):
//! the CLI surface and the stdin-framed `serve` loop, run against a real
//! child process via `assert_cmd`.

use std::io::Write;
use std::process::Stdio;

use assert_cmd::Command;
use tempfile::TempDir;

fn kahlod() -> Command {
    Command::cargo_bin("kahlod").expect("kahlod binary is built")
}

fn data_dir() -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_string_lossy().into_owned();
    (dir, path)
}

#[test]
fn config_show_prints_spec_defaults_as_json() {
    let (_dir, data_dir) = data_dir();
    let assert = kahlod()
        .env("KAHLO_DATA_DIR", &data_dir)
        .env_remove("KAHLO_CONFIG")
        .args(["config", "show"])
        .assert()
        .success();

    let output = assert.get_output();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON on stdout");
    assert_eq!(json["data_dir"], data_dir);
    assert_eq!(json["limits"]["target_artifact_budget_bytes"], 524_288_000);
    assert_eq!(json["limits"]["artifact_inline_threshold_bytes"], 32_768);
    assert_eq!(json["limits"]["job_retention_secs"], 3600);
    assert_eq!(json["timeouts"]["snapshot_ms"], 10_000);
    assert_eq!(json["reload"]["watch"], false);
}

#[test]
fn config_show_honors_kahlo_config_file_override() {
    let (_dir, data_dir) = data_dir();
    let config_dir = tempfile::tempdir().expect("tempdir");
    let config_path = config_dir.path().join("kahlo.toml");
    std::fs::write(&config_path, "[limits]\njob_retention_secs = 60\n").expect("write config");

    let assert = kahlod()
        .env("KAHLO_DATA_DIR", &data_dir)
        .env("KAHLO_CONFIG", &config_path)
        .args(["config", "show"])
        .assert()
        .success();

    let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).expect("valid JSON");
    assert_eq!(json["limits"]["job_retention_secs"], 60);
    assert_eq!(json["limits"]["target_artifact_budget_bytes"], 524_288_000);
}

#[test]
fn serve_responds_to_devices_list_with_an_ok_envelope() {
    let (_dir, data_dir) = data_dir();
    let mut child = kahlod()
        .env("KAHLO_DATA_DIR", &data_dir)
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("kahlod serve spawns");

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        writeln!(stdin, r#"{{"tool": "devices.list", "params": {{}}}}"#).expect("write request line");
    }

    let output = child.wait_with_output().expect("process exits after stdin closes");
    let first_line = std::str::from_utf8(&output.stdout).expect("utf8 stdout").lines().next().expect("one response line").to_string();
    let response: serde_json::Value = serde_json::from_str(&first_line).expect("valid JSON response");
    assert_eq!(response["ok"], true);
    assert!(response["devices"].is_array());
}

#[test]
fn serve_rejects_malformed_request_line_without_crashing() {
    let (_dir, data_dir) = data_dir();
    let mut child = kahlod()
        .env("KAHLO_DATA_DIR", &data_dir)
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("kahlod serve spawns");

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        writeln!(stdin, "not json").expect("write request line");
    }

    let output = child.wait_with_output().expect("process exits");
    assert!(output.status.success());
    let first_line = std::str::from_utf8(&output.stdout).expect("utf8 stdout").lines().next().expect("one response line").to_string();
    let response: serde_json::Value = serde_json::from_str(&first_line).expect("valid JSON response");
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "INVALID_ARGUMENT");
}

#[test]
fn serve_reports_not_implemented_for_adb_exec() {
    let (_dir, data_dir) = data_dir();
    let mut child = kahlod()
        .env("KAHLO_DATA_DIR", &data_dir)
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("kahlod serve spawns");

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        writeln!(stdin, r#"{{"tool": "adb.exec", "params": {{}}}}"#).expect("write request line");
    }

    let output = child.wait_with_output().expect("process exits");
    let first_line = std::str::from_utf8(&output.stdout).expect("utf8 stdout").lines().next().expect("one response line").to_string();
    let response: serde_json::Value = serde_json::from_str(&first_line).expect("valid JSON response");
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "NOT_IMPLEMENTED");
}
