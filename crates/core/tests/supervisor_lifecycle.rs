//! Integration tests for the process supervisor against real child processes.
#![cfg(unix)]

mod common;

use apc_core::supervisor::{
    OutputLine, ProcessHandlers, ProcessSupervisor, SpawnOptions, SupervisorError,
    SupervisorSettings,
};
use common::test_supervisor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn shell(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn test_output_and_exit_code() {
    let supervisor = test_supervisor();
    let mut handle = supervisor
        .spawn("job-1", "sh", &shell("echo hello; echo oops >&2; exit 7"), SpawnOptions::default())
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Some(line) = handle.output.recv().await {
        lines.push(line);
    }
    assert!(lines.contains(&OutputLine::Stdout("hello".to_string())));
    assert!(lines.contains(&OutputLine::Stderr("oops".to_string())));

    let exit = handle.wait().await;
    assert_eq!(exit.code, Some(7));
    assert!(!exit.success());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let supervisor = test_supervisor();
    let mut handle = supervisor
        .spawn("job-1", "sh", &shell("echo ready; sleep 30"), SpawnOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.output.recv().await, Some(OutputLine::Stdout("ready".to_string())));
    assert!(supervisor.is_running("job-1"));

    let started = Instant::now();
    assert!(supervisor.stop_process("job-1", false).await);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!supervisor.is_running("job-1"));
    assert!(supervisor.running_ids().is_empty());

    // Unknown and already stopped ids are fine.
    assert!(supervisor.stop_process("job-1", false).await);
    assert!(supervisor.stop_process("never-started", true).await);
}

#[tokio::test]
async fn test_max_runtime_force_stops() {
    let supervisor = test_supervisor();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let options = SpawnOptions {
        max_runtime: Some(Duration::from_millis(100)),
        handlers: ProcessHandlers {
            on_timeout: Some(Arc::new(move |_: &str| flag.store(true, Ordering::SeqCst))),
            on_stuck: None,
        },
        ..Default::default()
    };

    let started = Instant::now();
    let mut handle = supervisor.spawn("slow", "sh", &shell("sleep 30"), options).await.unwrap();
    let exit = handle.wait().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(fired.load(Ordering::SeqCst));
    assert!(!exit.success());
    assert!(!supervisor.is_running("slow"));
}

#[tokio::test]
async fn test_pause_and_resume_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(SupervisorSettings {
        grace_period: Duration::from_millis(500),
        snapshot_dir: Some(temp_dir.path().to_path_buf()),
        ..SupervisorSettings::default()
    });
    let options = SpawnOptions {
        cwd: Some(temp_dir.path().to_path_buf()),
        metadata: [("workflow_id".to_string(), "wf-1".to_string())].into(),
        ..Default::default()
    };
    let mut handle = supervisor
        .spawn("agent-1", "sh", &shell("echo started; sleep 30"), options)
        .await
        .unwrap();
    assert_eq!(handle.output.recv().await, Some(OutputLine::Stdout("started".to_string())));

    assert!(supervisor.pause_process("agent-1").await.unwrap());
    assert!(!supervisor.is_running("agent-1"));
    assert_eq!(supervisor.paused_ids(), vec!["agent-1"]);
    assert!(temp_dir.path().join("agent-1.json").exists());
    assert!(!supervisor.pause_process("agent-1").await.unwrap());

    let mut resumed = supervisor
        .resume_process("agent-1", ProcessHandlers::default())
        .await
        .unwrap();
    assert_eq!(resumed.output.recv().await, Some(OutputLine::Stdout("started".to_string())));
    let state = supervisor.get_process("agent-1").unwrap();
    assert_eq!(state.metadata.get("workflow_id").map(String::as_str), Some("wf-1"));
    assert!(!temp_dir.path().join("agent-1.json").exists());

    // The snapshot is consumed by the first resume.
    let again = supervisor.resume_process("agent-1", ProcessHandlers::default()).await;
    assert!(matches!(again, Err(SupervisorError::SnapshotNotFound(_))));

    supervisor.stop_all().await;
    assert!(supervisor.running_ids().is_empty());
}

#[tokio::test]
async fn test_resume_keeps_runtime_budget() {
    let temp_dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(SupervisorSettings {
        grace_period: Duration::from_millis(500),
        snapshot_dir: Some(temp_dir.path().to_path_buf()),
        ..SupervisorSettings::default()
    });
    let options = SpawnOptions {
        max_runtime: Some(Duration::from_millis(1500)),
        health_check_interval: Some(Duration::from_secs(7)),
        ..Default::default()
    };
    let mut handle = supervisor
        .spawn("budgeted", "sh", &shell("echo started; sleep 30"), options)
        .await
        .unwrap();
    assert_eq!(handle.output.recv().await, Some(OutputLine::Stdout("started".to_string())));
    assert!(supervisor.pause_process("budgeted").await.unwrap());

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(temp_dir.path().join("budgeted.json")).unwrap())
            .unwrap();
    assert_eq!(saved["max_runtime_ms"], 1500);
    assert_eq!(saved["health_check_interval_ms"], 7000);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let handlers = ProcessHandlers {
        on_timeout: Some(Arc::new(move |_: &str| flag.store(true, Ordering::SeqCst))),
        on_stuck: None,
    };
    let started = Instant::now();
    let mut resumed = supervisor.resume_process("budgeted", handlers).await.unwrap();
    let exit = resumed.wait().await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(fired.load(Ordering::SeqCst));
    assert!(!exit.success());
    assert!(!supervisor.is_running("budgeted"));
}

#[test]
fn test_runtime_shutdown_kills_children() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pid = runtime.block_on(async {
        let supervisor = test_supervisor();
        let handle = supervisor
            .spawn("left-behind", "sleep", &["30".to_string()], SpawnOptions::default())
            .await
            .unwrap();
        handle.pid.unwrap()
    });
    drop(runtime);

    // Killed but possibly not yet reaped: gone or a zombie both count.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let ps = std::process::Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .unwrap();
        let stat = String::from_utf8_lossy(&ps.stdout).trim().to_string();
        if stat.is_empty() || stat.starts_with('Z') {
            break;
        }
        assert!(Instant::now() < deadline, "pid {pid} still alive ({stat})");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test]
async fn test_spawn_missing_command() {
    let supervisor = test_supervisor();
    let result = supervisor
        .spawn("x", "definitely-not-a-real-command-apc", &[], SpawnOptions::default())
        .await;
    assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    assert!(!supervisor.is_running("x"));
}
