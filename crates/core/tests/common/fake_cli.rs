//! Fake agent CLIs.
//!
//! A fake CLI is a shell script run through `sh`, so the tests exercise the
//! real supervisor, stdin prompt delivery and stream parsing without any
//! agent installed.

use apc_core::agents::{AgentSettings, BackendKind, CliBackend, CliProfile, RetryPolicy};
use apc_core::supervisor::{ProcessSupervisor, SupervisorSettings};
use std::path::Path;
use std::time::Duration;

/// Supervisor with short grace periods.
#[allow(dead_code)]
pub fn test_supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorSettings {
        grace_period: Duration::from_millis(500),
        kill_wait: Duration::from_millis(500),
        ..SupervisorSettings::default()
    })
}

/// Write `body` as a script in `dir` and return a backend that runs it.
///
/// The script receives the prompt on stdin. Retries are disabled.
#[allow(dead_code)]
pub fn fake_cli(dir: &Path, body: &str, supervisor: ProcessSupervisor) -> CliBackend {
    let script = dir.join("fake_agent.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();

    // Profiles describe real CLIs with static arguments.
    let script: &'static str = Box::leak(script.to_string_lossy().into_owned().into_boxed_str());
    let args: &'static [&'static str] = Box::leak(vec![script].into_boxed_slice());
    let profile = CliProfile {
        kind: BackendKind::Claude,
        program: "sh",
        args,
        model_flag: "--model",
        default_models: ["", "", ""],
        install_command: None,
        install_hint: "fake CLI",
        orphan_signature: "fake_agent.sh",
        mcp_config: None,
    };
    let settings = AgentSettings {
        heartbeat_interval: Duration::from_millis(200),
        idle_threshold: Duration::from_secs(30),
        ..AgentSettings::default()
    };
    CliBackend::new(profile, supervisor, settings).with_retry(RetryPolicy::none())
}

/// A stream-json assistant line carrying `text` as the cumulative message.
#[allow(dead_code)]
pub fn assistant_line(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": { "content": [{ "type": "text", "text": text }] }
    })
    .to_string()
}

/// A stream-json result line.
#[allow(dead_code)]
pub fn result_line(text: &str) -> String {
    serde_json::json!({ "type": "result", "result": text }).to_string()
}

/// Script lines printing each of `lines` verbatim.
#[allow(dead_code)]
pub fn print_lines(lines: &[String]) -> String {
    let mut script = String::from("cat <<'JSON'\n");
    for line in lines {
        script.push_str(line);
        script.push('\n');
    }
    script.push_str("JSON\n");
    script
}
