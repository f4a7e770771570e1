//! Test fixtures for creating sample configurations.

use std::path::Path;
use tempfile::TempDir;

/// Create a temporary project with a complete `.apc/` directory.
///
/// This creates:
/// - `.apc/config.toml` with a small engineer pool
/// - `.apc/roles/engineer.md`
/// - `.apc/workflows/implement.yaml` (plan, build, verify with a loop back)
/// - `.apc/workflows/hotfix.yaml` (a single phase declaring a conflict)
///
/// Returns a TempDir that must be kept alive for the test duration.
#[allow(dead_code)]
pub fn create_test_project() -> std::io::Result<TempDir> {
    let temp_dir = tempfile::tempdir()?;
    write_project(temp_dir.path())?;
    Ok(temp_dir)
}

#[allow(dead_code)]
pub fn write_project(root: &Path) -> std::io::Result<()> {
    let apc = root.join(".apc");
    std::fs::create_dir_all(apc.join("roles"))?;
    std::fs::create_dir_all(apc.join("workflows"))?;

    std::fs::write(
        apc.join("config.toml"),
        r#"backend = "mock"
state_dir = ".apc/state"

[engine]
max_loop_iterations = 2
continuation_tail_chars = 500

[pool.roles]
engineer = ["Alex", "Betty", "Cleo"]
"#,
    )?;

    std::fs::write(
        apc.join("roles/engineer.md"),
        r#"---
name: engineer
description: Implements tasks
tier: mid
timeout_secs: 60
---
You are an engineer working on {{task}}."#,
    )?;

    std::fs::write(
        apc.join("workflows/implement.yaml"),
        r#"name: implement
description: Plan, build and verify a task
phases:
  - name: plan
    prompt: "Plan {{task}}"
  - name: build
    prompt: "Build {{task}}"
  - name: verify
    prompt: "Verify {{task}}"
    until: VERIFIED
    loop-back-to: build
"#,
    )?;

    std::fs::write(
        apc.join("workflows/hotfix.yaml"),
        r#"name: hotfix
phases:
  - name: fix
    prompt: "Hotfix {{task}} now"
    declare-conflict: true
"#,
    )?;
    Ok(())
}
