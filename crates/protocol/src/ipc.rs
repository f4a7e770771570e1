//! Inter-process communication protocol.
//!
//! This module defines the message types exchanged between the coordinator
//! and whatever front-end drives it (CLI, webview).
//!
//! The protocol follows an Operation/Event pattern:
//! - `Op`: Commands sent from a front-end to the coordinator
//! - `Event`: Status updates sent from the coordinator to front-ends

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::workflow_models::{ConflictScope, PauseReason};

/// Operations sent from a front-end to the coordinator.
///
/// Uses tagged enum serialization for TypeScript compatibility:
/// ```json
/// {
///   "type": "startWorkflow",
///   "payload": {
///     "workflow_type": "implement-task",
///     "session_id": "s-1",
///     "task_id": "T3"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Op {
    /// Launch a new workflow of a registered type.
    StartWorkflow {
        workflow_type: String,
        session_id: String,
        task_id: Option<String>,
    },

    /// Pause a running workflow on user request.
    PauseWorkflow { workflow_id: String },

    /// Resume a paused workflow from its saved state.
    ResumeWorkflow {
        session_id: String,
        workflow_id: String,
    },

    /// Cancel a workflow without saving state.
    CancelWorkflow { workflow_id: String },

    /// Pause everything and stop.
    Shutdown,
}

/// Events sent from the coordinator to front-ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A workflow was launched.
    WorkflowStarted {
        workflow_id: String,
        workflow_type: String,
    },

    /// A phase began executing.
    PhaseStarted {
        workflow_id: String,
        phase_index: usize,
        phase_name: String,
    },

    /// A phase finished successfully.
    PhaseCompleted {
        workflow_id: String,
        phase_index: usize,
        phase_name: String,
    },

    /// Free-form progress text from a phase or agent run.
    WorkflowProgress { workflow_id: String, message: String },

    /// A workflow was paused and its state persisted.
    WorkflowPaused {
        workflow_id: String,
        phase_index: usize,
        reason: PauseReason,
        conflicting_workflow_id: Option<String>,
    },

    /// A workflow was restored from saved state.
    WorkflowResumed {
        workflow_id: String,
        phase_index: usize,
    },

    /// A workflow ran its last phase.
    WorkflowCompleted { workflow_id: String },

    /// A workflow failed or was cancelled.
    WorkflowError { workflow_id: String, error: String },

    /// A workflow declared a conflict scope.
    ConflictDeclared {
        workflow_id: String,
        scope: ConflictScope,
    },

    /// A workflow cleared all its conflicts.
    ConflictsCleared { workflow_id: String },
}

impl Event {
    /// The workflow this event is about.
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::PhaseStarted { workflow_id, .. }
            | Self::PhaseCompleted { workflow_id, .. }
            | Self::WorkflowProgress { workflow_id, .. }
            | Self::WorkflowPaused { workflow_id, .. }
            | Self::WorkflowResumed { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id }
            | Self::WorkflowError { workflow_id, .. }
            | Self::ConflictDeclared { workflow_id, .. }
            | Self::ConflictsCleared { workflow_id } => workflow_id,
        }
    }
}
