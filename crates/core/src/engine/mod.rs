//! Workflow execution engine.
//!
//! The WorkflowEngine drives one workflow's phases strictly in order, owns the
//! phase index and the loop-back guard, and turns pause and cancel signals
//! into saved state or stopped runs.

use crate::agents::StopReason;
use crate::workflow::{
    ConflictCoordinator, PauseError, PauseRequest, PhaseContext, PhaseError, PhaseOutcome,
    Workflow, WorkflowPauseManager, WorkflowServices,
};
use apc_protocol::ipc::Event;
use apc_protocol::workflow_models::{PauseReason, PhasePosition, PhaseProgress, SavedWorkflowState};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to pause workflow: {0}")]
    Pause(#[from] PauseError),
    #[error("Saved state does not match workflow: {0}")]
    InvalidState(String),
}

/// Signal sent to a running workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkflowControl {
    #[default]
    Run,
    Pause {
        reason: PauseReason,
        conflicting_workflow_id: Option<String>,
    },
    Cancel,
}

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed,
    Paused(Box<SavedWorkflowState>),
    Failed(String),
    Cancelled,
}

/// Identity and control channel of one workflow run.
pub struct WorkflowLaunch {
    pub workflow_id: String,
    pub session_id: String,
    pub conflicts: Option<Arc<dyn ConflictCoordinator>>,
    pub control: watch::Receiver<WorkflowControl>,
}

impl WorkflowLaunch {
    /// A launch with no coordinator. The returned sender controls the run.
    pub fn standalone(
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> (Self, watch::Sender<WorkflowControl>) {
        let (tx, rx) = watch::channel(WorkflowControl::Run);
        let launch = Self {
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            conflicts: None,
            control: rx,
        };
        (launch, tx)
    }

    pub fn with_conflicts(mut self, conflicts: Arc<dyn ConflictCoordinator>) -> Self {
        self.conflicts = Some(conflicts);
        self
    }
}

/// Where execution starts.
struct StartPoint {
    index: usize,
    loop_iterations: u32,
    continuation: Option<String>,
    modified_files: BTreeSet<String>,
}

enum Step {
    Finished(Result<PhaseOutcome, PhaseError>),
    Paused(SavedWorkflowState),
    Cancelled,
}

/// Drives workflows phase by phase.
pub struct WorkflowEngine {
    services: WorkflowServices,
    pause_manager: Arc<WorkflowPauseManager>,
    max_loop_iterations: u32,
}

impl WorkflowEngine {
    /// Create a new WorkflowEngine.
    ///
    /// # Arguments
    ///
    /// * `services` - Runner, pool, roles and event channel shared by all workflows
    /// * `pause_manager` - Persists paused workflows
    /// * `max_loop_iterations` - Loop-back transitions allowed per workflow
    pub fn new(
        services: WorkflowServices,
        pause_manager: Arc<WorkflowPauseManager>,
        max_loop_iterations: u32,
    ) -> Self {
        Self {
            services,
            pause_manager,
            max_loop_iterations,
        }
    }

    pub fn services(&self) -> &WorkflowServices {
        &self.services
    }

    pub fn pause_manager(&self) -> &Arc<WorkflowPauseManager> {
        &self.pause_manager
    }

    /// Run a workflow from its first phase.
    ///
    /// # Returns
    ///
    /// The outcome once the workflow completes, fails, pauses or is cancelled.
    ///
    /// # Errors
    ///
    /// Only when a pause cannot be persisted; the workflow's runs are
    /// cancelled in that case.
    pub async fn run(
        &self,
        workflow: Box<dyn Workflow>,
        launch: WorkflowLaunch,
    ) -> Result<WorkflowOutcome, EngineError> {
        self.emit(Event::WorkflowStarted {
            workflow_id: launch.workflow_id.clone(),
            workflow_type: workflow.workflow_type().to_string(),
        })
        .await;
        let start = StartPoint {
            index: 0,
            loop_iterations: 0,
            continuation: None,
            modified_files: BTreeSet::new(),
        };
        self.drive(workflow, launch, start).await
    }

    /// Continue a workflow from a saved state, at the saved phase index.
    ///
    /// The saved continuation prompt is prepended to the next agent run only.
    pub async fn resume(
        &self,
        workflow: Box<dyn Workflow>,
        launch: WorkflowLaunch,
        saved: SavedWorkflowState,
    ) -> Result<WorkflowOutcome, EngineError> {
        if saved.workflow_type != workflow.workflow_type() {
            return Err(EngineError::InvalidState(format!(
                "saved type '{}' but workflow is '{}'",
                saved.workflow_type,
                workflow.workflow_type()
            )));
        }
        let phase_count = workflow.phase_names().len();
        if saved.phase.index >= phase_count {
            return Err(EngineError::InvalidState(format!(
                "phase index {} out of range ({phase_count} phases)",
                saved.phase.index
            )));
        }

        self.emit(Event::WorkflowResumed {
            workflow_id: launch.workflow_id.clone(),
            phase_index: saved.phase.index,
        })
        .await;
        let start = StartPoint {
            index: saved.phase.index,
            loop_iterations: saved.loop_iterations,
            continuation: Some(saved.continuation.prompt),
            modified_files: saved.modified_files,
        };
        self.drive(workflow, launch, start).await
    }

    async fn drive(
        &self,
        mut workflow: Box<dyn Workflow>,
        launch: WorkflowLaunch,
        start: StartPoint,
    ) -> Result<WorkflowOutcome, EngineError> {
        let workflow_type = workflow.workflow_type().to_string();
        let task_id = workflow.task_id().map(str::to_string);
        let phases = workflow.phase_names();
        let WorkflowLaunch {
            workflow_id,
            session_id,
            conflicts,
            mut control,
        } = launch;

        let ctx = PhaseContext::new(
            self.services.clone(),
            workflow_id.clone(),
            session_id.clone(),
            task_id.clone(),
            conflicts,
        );
        ctx.set_continuation(start.continuation);
        ctx.extend_modified_files(start.modified_files);

        let mut index = start.index;
        let mut loop_iterations = start.loop_iterations;
        let pause_request = |index: usize,
                             loop_iterations: u32,
                             progress: PhaseProgress,
                             reason: PauseReason,
                             conflicting_workflow_id: Option<String>| PauseRequest {
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.clone(),
            session_id: session_id.clone(),
            phase: PhasePosition {
                index,
                name: phases.get(index).cloned().unwrap_or_default(),
                progress,
            },
            task_id: task_id.clone(),
            modified_files: ctx.modified_files(),
            agent_run_ids: ctx.current_run_ids(),
            reason,
            conflicting_workflow_id,
            loop_iterations,
        };

        let outcome = loop {
            let Some(phase_name) = phases.get(index).cloned() else {
                break WorkflowOutcome::Completed;
            };

            let signal = control.borrow_and_update().clone();
            match signal {
                WorkflowControl::Run => {}
                WorkflowControl::Pause {
                    reason,
                    conflicting_workflow_id,
                } => {
                    let request = pause_request(
                        index,
                        loop_iterations,
                        PhaseProgress::NotStarted,
                        reason,
                        conflicting_workflow_id,
                    );
                    let saved = self.pause_manager.pause(request).await?;
                    break WorkflowOutcome::Paused(Box::new(saved));
                }
                WorkflowControl::Cancel => break WorkflowOutcome::Cancelled,
            }

            ctx.enter_phase(index, &phase_name);
            info!(workflow_id = %workflow_id, phase = %phase_name, index, "Phase started");
            self.emit(Event::PhaseStarted {
                workflow_id: workflow_id.clone(),
                phase_index: index,
                phase_name: phase_name.clone(),
            })
            .await;

            let step = {
                let phase = workflow.execute_phase(index, &ctx);
                tokio::pin!(phase);
                tokio::select! {
                    biased;
                    signal = next_signal(&mut control) => match signal {
                        WorkflowControl::Pause { reason, conflicting_workflow_id } => {
                            let request = pause_request(
                                index,
                                loop_iterations,
                                PhaseProgress::InProgress,
                                reason,
                                conflicting_workflow_id,
                            );
                            match self.pause_manager.pause(request).await {
                                Ok(saved) => Step::Paused(saved),
                                Err(e) => {
                                    error!(workflow_id = %workflow_id, error = %e, "Pause could not be persisted");
                                    ctx.stop_current_runs(StopReason::Cancelled).await;
                                    return Err(e.into());
                                }
                            }
                        }
                        WorkflowControl::Cancel | WorkflowControl::Run => {
                            ctx.stop_current_runs(StopReason::Cancelled).await;
                            Step::Cancelled
                        }
                    },
                    result = &mut phase => Step::Finished(result),
                }
            };

            match step {
                Step::Paused(saved) => break WorkflowOutcome::Paused(Box::new(saved)),
                Step::Cancelled => break WorkflowOutcome::Cancelled,
                Step::Finished(Err(e)) => {
                    warn!(workflow_id = %workflow_id, phase = %phase_name, error = %e, "Phase failed");
                    break WorkflowOutcome::Failed(e.to_string());
                }
                Step::Finished(Ok(outcome)) => {
                    self.emit(Event::PhaseCompleted {
                        workflow_id: workflow_id.clone(),
                        phase_index: index,
                        phase_name: phase_name.clone(),
                    })
                    .await;
                    match outcome {
                        PhaseOutcome::Next => index += 1,
                        PhaseOutcome::Finish => break WorkflowOutcome::Completed,
                        PhaseOutcome::LoopBack(target) => {
                            if target >= phases.len() {
                                break WorkflowOutcome::Failed(
                                    PhaseError::UnknownPhase(target).to_string(),
                                );
                            }
                            loop_iterations += 1;
                            if loop_iterations > self.max_loop_iterations {
                                break WorkflowOutcome::Failed(format!(
                                    "loop limit of {} iterations reached in phase '{phase_name}'",
                                    self.max_loop_iterations
                                ));
                            }
                            debug!(workflow_id = %workflow_id, from = index, to = target, loop_iterations, "Looping back");
                            index = target;
                        }
                    }
                }
            }
        };

        self.finish(&ctx, &outcome).await;
        Ok(outcome)
    }

    /// Emit the terminal event and release conflicts. A paused workflow keeps
    /// its conflicts until it resumes and finishes.
    async fn finish(&self, ctx: &PhaseContext, outcome: &WorkflowOutcome) {
        let workflow_id = ctx.workflow_id().to_string();
        let event = match outcome {
            WorkflowOutcome::Completed => {
                info!(workflow_id = %workflow_id, "Workflow completed");
                Event::WorkflowCompleted {
                    workflow_id: workflow_id.clone(),
                }
            }
            WorkflowOutcome::Paused(saved) => Event::WorkflowPaused {
                workflow_id: workflow_id.clone(),
                phase_index: saved.phase.index,
                reason: saved.pause_reason,
                conflicting_workflow_id: saved.conflicting_workflow_id.clone(),
            },
            WorkflowOutcome::Failed(error) => Event::WorkflowError {
                workflow_id: workflow_id.clone(),
                error: error.clone(),
            },
            WorkflowOutcome::Cancelled => Event::WorkflowError {
                workflow_id: workflow_id.clone(),
                error: "cancelled".to_string(),
            },
        };
        self.emit(event).await;

        if !matches!(outcome, WorkflowOutcome::Paused(_)) {
            if let Err(e) = ctx.clear_conflicts().await {
                warn!(workflow_id = %workflow_id, error = %e, "Failed to clear conflicts");
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(events) = &self.services.events {
            let _ = events.send(event).await;
        }
    }
}

/// Resolves with the first control value other than `Run`. Never resolves
/// once the sender is gone.
async fn next_signal(control: &mut watch::Receiver<WorkflowControl>) -> WorkflowControl {
    loop {
        {
            let current = control.borrow_and_update();
            if *current != WorkflowControl::Run {
                return current.clone();
            }
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
