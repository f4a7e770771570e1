//! Workflow models: YAML definitions, conflict declarations and the durable
//! record written when a workflow is paused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use ts_rs::TS;

/// Progress of the phase a workflow was in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum PhaseProgress {
    NotStarted,
    InProgress,
    Completed,
}

/// Why a workflow was paused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequest,
    Conflict,
    Error,
    Timeout,
    Shutdown,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserRequest => "user_request",
            Self::Conflict => "conflict",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Where in its phase list a workflow stands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct PhasePosition {
    /// Zero-based phase index.
    pub index: usize,

    /// Name of the phase at `index`.
    pub name: String,

    pub progress: PhaseProgress,
}

/// Narrative handed to a fresh agent run so it can pick up paused work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default, TS)]
pub struct ContinuationContext {
    pub what_was_done: String,
    pub what_remains: String,

    /// Prompt prepended, once, to the next agent invocation after resume.
    pub prompt: String,
}

/// Durable record of a paused workflow, keyed by (session_id, workflow_id).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SavedWorkflowState {
    pub workflow_id: String,
    pub workflow_type: String,
    pub session_id: String,
    pub phase: PhasePosition,

    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub modified_files: BTreeSet<String>,

    /// Agent run that was interrupted, if one was active.
    #[serde(default)]
    pub agent_run_id: Option<String>,

    #[serde(default)]
    pub partial_output: Option<String>,

    pub continuation: ContinuationContext,

    /// Loop-back transitions already taken, so the guard survives resume.
    #[serde(default)]
    pub loop_iterations: u32,

    pub paused_at: DateTime<Utc>,
    pub pause_reason: PauseReason,

    #[serde(default)]
    pub conflicting_workflow_id: Option<String>,
}

/// Task scope a workflow claims exclusively.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(tag = "kind", content = "tasks", rename_all = "snake_case")]
pub enum ConflictScope {
    /// Every task.
    All,

    /// Only the listed task ids.
    Tasks(BTreeSet<String>),
}

impl ConflictScope {
    /// Scope covering a single task.
    pub fn task(task_id: impl Into<String>) -> Self {
        Self::Tasks(BTreeSet::from([task_id.into()]))
    }

    /// Whether this scope covers `task_id`.
    pub fn covers(&self, task_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tasks(tasks) => tasks.contains(task_id),
        }
    }
}

/// What other workflows should do when they fall inside a conflict scope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, TS)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    PauseOthers,
}

/// A conflict declared by one workflow. Authoritative until cleared.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ConflictDeclaration {
    pub workflow_id: String,
    pub scope: ConflictScope,
    #[serde(default)]
    pub policy: ConflictPolicy,
}

/// A workflow definition loaded from `.apc/workflows/*.yaml`.
///
/// # Example
///
/// ```yaml
/// name: implement-task
/// phases:
///   - name: plan
///     role: planner
///     prompt: "Write a plan for {{task}}"
///     plan-file: docs/plan.md
///   - name: gather
///     parallel: ["api", "storage"]
///     prompt: "Research {{preset}} for {{task}}"
///   - name: implement
///     declare-conflict: true
///     prompt: "Implement {{task}}"
///   - name: verify
///     prompt: "Verify {{task}}; print VERIFIED when it passes"
///     until: VERIFIED
///     loop-back-to: implement
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub phases: Vec<PhaseDefinition>,
}

/// One phase of a [`WorkflowDefinition`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct PhaseDefinition {
    pub name: String,

    /// Pool role to borrow an agent from. Defaults to `engineer`.
    #[serde(default)]
    pub role: Option<String>,

    /// Prompt template; `{{task}}`, `{{phase}}` and `{{preset}}` are replaced.
    pub prompt: String,

    /// Presets run concurrently, one agent each, awaited together.
    #[serde(default)]
    pub parallel: Vec<String>,

    /// Declare a conflict on the workflow's task before running.
    #[serde(default)]
    pub declare_conflict: bool,

    /// Marker that must appear in the output for the phase to pass.
    #[serde(default)]
    pub until: Option<String>,

    /// Phase to re-enter when `until` is not met.
    #[serde(default)]
    pub loop_back_to: Option<String>,

    /// Markdown file, relative to the working directory, receiving the plan
    /// section of the agent's answer.
    #[serde(default)]
    pub plan_file: Option<String>,
}
