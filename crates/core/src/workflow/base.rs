//! Base `Workflow` trait and the conflict coordination seam.

use crate::agents::AgentError;
use crate::workflow::context::PhaseContext;
use crate::workflow::pause::PauseError;
use crate::workflow::pool::PoolError;
use apc_protocol::workflow_models::ConflictDeclaration;
use async_trait::async_trait;
use thiserror::Error;

/// What the engine does after a phase returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Continue with the next phase.
    Next,
    /// Re-enter an earlier phase. Counts against the loop guard.
    LoopBack(usize),
    /// Skip the remaining phases.
    Finish,
}

#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("Unknown phase index {0}")]
    UnknownPhase(usize),
    #[error("Agent run failed in phase '{phase}': {error}")]
    AgentFailed { phase: String, error: AgentError },
    #[error("Phase '{phase}' finished without reporting '{marker}'")]
    ConditionNotMet { phase: String, marker: String },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),
    #[error("Workflow {0} is already running")]
    AlreadyRunning(String),
    #[error(transparent)]
    Pause(#[from] PauseError),
}

/// A sequence of named phases driven by the workflow engine.
///
/// The engine owns the phase index: it calls `execute_phase` with the index
/// to run and advances, loops back or finishes according to the returned
/// [`PhaseOutcome`]. Implementations must tolerate being recreated and
/// resumed at any index.
#[async_trait]
pub trait Workflow: Send {
    /// Registry key used to recreate the workflow on resume.
    fn workflow_type(&self) -> &str;

    fn phase_names(&self) -> Vec<String>;

    /// Task this workflow works on; conflicts are matched against it.
    fn task_id(&self) -> Option<&str>;

    async fn execute_phase(
        &mut self,
        index: usize,
        ctx: &PhaseContext,
    ) -> Result<PhaseOutcome, PhaseError>;
}

/// Enforces conflict declarations across workflows.
///
/// A workflow only signals; the coordinator finds the workflows inside the
/// declared scope and pauses them.
#[async_trait]
pub trait ConflictCoordinator: Send + Sync {
    /// Record a declaration and pause the workflows it covers. Returns the
    /// ids of the workflows that were paused.
    async fn declare(&self, declaration: ConflictDeclaration) -> Result<Vec<String>, CoordinatorError>;

    /// Drop every declaration of `workflow_id`. Returns the ids of workflows
    /// no longer blocked by anything.
    async fn clear(&self, workflow_id: &str) -> Result<Vec<String>, CoordinatorError>;
}
