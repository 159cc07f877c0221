//! End-to-end runs of the `provisio` binary: built-in drivers through self
//! re-invocation, an external wrapper plugin, and the bounded `exec` command.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::{Duration, Instant};

use provisio_core::{
    LifecyclePhase, ProcessLauncher, ProvisionRequest, Sequencer, SequencerOptions,
};
use provisio_plugin::{ControllerOptions, PluginResolver};
use provisio_state::{DriverCategory, MemoryRecordStore, RecordStatus, RecordStore};
use tokio_util::sync::CancellationToken;

const BIN: &str = env!("CARGO_BIN_EXE_provisio");

fn provisio(args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .env_remove("PROVISIO_BUILTIN_PLUGIN")
        .env("PROVISIO_HEALTH_INTERVAL_SECS", "0")
        .output()
        .expect("failed to run provisio")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Install an external plugin that serves the built-in shell driver.
fn install_wrapper(root: &Path, name: &str, version: &str) {
    let path = PluginResolver::new(root).conventional_path(&provisio_plugin::PluginIdentity::new(
        name, version, 0,
    ));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        format!("#!/bin/sh\nexec \"{BIN}\" serve-plugin --driver shell\n"),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn builtin_driver_runs_full_machine_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("installed");

    let resolver = PluginResolver::new(dir.path())
        .with_builtin(["shell"])
        .with_self_exe(BIN);
    let launcher = Arc::new(ProcessLauncher::new(resolver, ControllerOptions::default()));
    let store = Arc::new(MemoryRecordStore::new());
    let driver = store
        .register_driver("shell", "0.1.0", DriverCategory::Machine)
        .await
        .unwrap();

    let request = ProvisionRequest::new("web-1")
        .param("host", "10.0.0.7")
        .param("create_command", "echo created $PROVISIO_RECORD_ID")
        .param("install_command", format!("touch {}", marker.display()))
        .param("health_command", "true");
    let options = SequencerOptions {
        health_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let outcome = Sequencer::new(store.clone(), launcher, options, CancellationToken::new())
        .create_machine(driver.id, request)
        .await
        .unwrap();

    assert_eq!(outcome.phases, LifecyclePhase::ALL.to_vec());
    assert!(marker.exists(), "install command did not run");
    let machine = store.get_machine(outcome.record_id).await.unwrap();
    assert_eq!(machine.status, RecordStatus::Ready);
    assert_eq!(machine.host.as_deref(), Some("10.0.0.7"));
}

#[tokio::test]
async fn failing_install_leaves_failed_record() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PluginResolver::new(dir.path())
        .with_builtin(["shell"])
        .with_self_exe(BIN);
    let launcher = Arc::new(ProcessLauncher::new(resolver, ControllerOptions::default()));
    let store = Arc::new(MemoryRecordStore::new());
    let driver = store
        .register_driver("shell", "0.1.0", DriverCategory::Machine)
        .await
        .unwrap();

    let request =
        ProvisionRequest::new("db-1").param("install_command", "echo no agent >&2; exit 4");
    let err = Sequencer::new(
        store.clone(),
        launcher,
        SequencerOptions::default(),
        CancellationToken::new(),
    )
    .create_machine(driver.id, request)
    .await
    .unwrap_err();

    assert_eq!(err.phase(), Some(LifecyclePhase::AgentInstalled));
    assert!(err.to_string().contains("install machine robot"), "{err}");

    let machines = store.list_machines().await.unwrap();
    assert_eq!(machines.len(), 1);
    assert!(matches!(machines[0].status, RecordStatus::Failed { .. }));
}

#[test]
fn cli_provisions_machine_with_builtin_driver() {
    let out = provisio(&[
        "machine",
        "create",
        "--driver",
        "shell",
        "--name",
        "web-1",
        "-p",
        "host=10.1.2.3",
        "-p",
        "create_command=echo booting",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("ready"), "{text}");
    assert!(text.contains("10.1.2.3"), "{text}");
    assert!(text.contains("init -> reported -> created"), "{text}");
}

#[test]
fn cli_provisions_chain_as_json() {
    let out = provisio(&[
        "--json",
        "chain",
        "create",
        "--driver",
        "shell-chain",
        "--name",
        "ledger",
        "-p",
        "install_command=true",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["record"]["name"], "ledger");
    assert_eq!(value["record"]["status"]["state"], "ready");
    assert_eq!(value["phases"].as_array().unwrap().len(), 6);
}

#[test]
fn cli_uses_external_wrapper_plugin() {
    let dir = tempfile::tempdir().unwrap();
    install_wrapper(dir.path(), "ext", "1.0");
    let root = dir.path().to_str().unwrap();

    let out = provisio(&[
        "--plugin-root",
        root,
        "--register",
        "ext:1.0:machine",
        "machine",
        "create",
        "--driver",
        "ext",
        "--name",
        "edge",
        "-p",
        "host=10.9.9.9",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("10.9.9.9"));
}

#[test]
fn cli_reports_missing_external_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    let out = provisio(&[
        "--plugin-root",
        root,
        "--register",
        "ghost:2.0:machine",
        "machine",
        "create",
        "--driver",
        "ghost",
        "--name",
        "m",
    ]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("start machine plugin"), "{err}");
    assert!(err.contains("plugins/ghost/2.0/plugin"), "{err}");
}

#[test]
fn cli_reports_failing_phase() {
    let out = provisio(&[
        "machine",
        "create",
        "--driver",
        "shell",
        "--name",
        "bad",
        "-p",
        "install_command=exit 4",
    ]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("install machine robot"));
}

#[test]
fn cli_rejects_driver_of_wrong_category() {
    let out = provisio(&["chain", "create", "--driver", "shell", "--name", "c"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("machine"));
}

#[test]
fn cli_lists_builtin_drivers() {
    let out = provisio(&["drivers"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("shell@"), "{text}");
    assert!(text.contains("shell-chain@"), "{text}");
}

#[test]
fn cli_exec_prints_output() {
    let out = provisio(&["exec", "--timeout", "5", "--", "echo", "hello"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "hello");
}

#[test]
fn cli_exec_enforces_deadline() {
    let started = Instant::now();
    let out = provisio(&["exec", "--timeout", "1", "--", "sleep", "10"]);
    assert!(!out.status.success());
    assert!(started.elapsed() < Duration::from_secs(8));
}
