//! Pausing and resuming workflows.
//!
//! A pause captures the interrupted run's partial output, turns it into a
//! continuation narrative, persists a [`SavedWorkflowState`] and only then
//! stops the agent. Resuming loads that record and deletes it, so a
//! saved state is consumed exactly once.

use crate::agents::{AgentRunner, StopReason};
use crate::workflow::progress::{build_continuation_prompt, summarize_progress, tail_slice};
use crate::workflow::store::{SessionStore, StoreError};
use apc_protocol::workflow_models::{
    ContinuationContext, PauseReason, PhasePosition, PhaseProgress, SavedWorkflowState,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PauseError {
    #[error("No session store configured; cannot persist paused workflow {0}")]
    NoStore(String),
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
    #[error("Saved state for {workflow_id} is invalid: {source}")]
    Serialization {
        workflow_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("No paused workflow {workflow_id} in session {session_id}")]
    NotFound {
        session_id: String,
        workflow_id: String,
    },
}

/// Everything the pause manager needs to know about the workflow it pauses.
#[derive(Debug, Clone)]
pub struct PauseRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub session_id: String,
    pub phase: PhasePosition,
    pub task_id: Option<String>,
    pub modified_files: BTreeSet<String>,
    /// Agent runs in flight for the current phase.
    pub agent_run_ids: Vec<String>,
    pub reason: PauseReason,
    pub conflicting_workflow_id: Option<String>,
    pub loop_iterations: u32,
}

pub struct WorkflowPauseManager {
    runner: Arc<AgentRunner>,
    store: Option<Arc<dyn SessionStore>>,
    tail_chars: usize,
}

impl WorkflowPauseManager {
    /// # Arguments
    ///
    /// * `runner` - Used to read partial output and stop interrupted runs
    /// * `store` - Durable store for paused workflows; pausing fails without one
    /// * `tail_chars` - How much raw output to quote in continuation prompts
    pub fn new(
        runner: Arc<AgentRunner>,
        store: Option<Arc<dyn SessionStore>>,
        tail_chars: usize,
    ) -> Self {
        Self {
            runner,
            store,
            tail_chars,
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self, workflow_id: &str) -> Result<&Arc<dyn SessionStore>, PauseError> {
        self.store
            .as_ref()
            .ok_or_else(|| PauseError::NoStore(workflow_id.to_string()))
    }

    /// Pause a workflow and persist its state.
    ///
    /// # Behavior
    ///
    /// 1. Capture the partial output of every in-flight run
    /// 2. Summarize the output into what was done and what remains
    /// 3. Build the continuation prompt
    /// 4. Persist the state under `(session_id, workflow_id)`
    /// 5. Stop the runs with [`StopReason::Paused`]
    ///
    /// # Errors
    ///
    /// Fails before touching any run when no store is configured or the
    /// store rejects the write; the runs keep going in both cases.
    pub async fn pause(&self, request: PauseRequest) -> Result<SavedWorkflowState, PauseError> {
        let store = self.store(&request.workflow_id)?;

        let mut partial = String::new();
        let mut interrupted_run = None;
        for run_id in &request.agent_run_ids {
            let Some(output) = self.runner.partial_output(run_id) else {
                continue;
            };
            if output.trim().is_empty() {
                continue;
            }
            if !partial.is_empty() {
                partial.push_str("\n\n");
            }
            partial.push_str(&output);
            interrupted_run.get_or_insert_with(|| run_id.clone());
        }

        let run_ids = request.agent_run_ids.clone();
        let state = self.build_state(request, partial, interrupted_run);
        let value = serde_json::to_value(&state).map_err(|source| PauseError::Serialization {
            workflow_id: state.workflow_id.clone(),
            source,
        })?;
        store.save(&state.session_id, &state.workflow_id, &value).await?;

        for run_id in &run_ids {
            if !self.runner.stop(run_id, StopReason::Paused).await {
                debug!(run_id = %run_id, "Run already finished before pause");
            }
        }

        info!(
            workflow_id = %state.workflow_id,
            phase = %state.phase.name,
            phase_index = state.phase.index,
            reason = %state.pause_reason,
            conflicting = ?state.conflicting_workflow_id,
            "Workflow paused"
        );
        Ok(state)
    }

    fn build_state(
        &self,
        request: PauseRequest,
        partial: String,
        interrupted_run: Option<String>,
    ) -> SavedWorkflowState {
        let summary = summarize_progress(&partial);
        let mut modified_files = request.modified_files;
        modified_files.extend(summary.modified_files.iter().cloned());

        let continuation = if request.phase.progress == PhaseProgress::InProgress {
            let tail = tail_slice(&partial, self.tail_chars);
            ContinuationContext {
                what_was_done: summary.what_was_done(),
                what_remains: summary.what_remains(&request.phase.name),
                prompt: build_continuation_prompt(&request.phase.name, &summary, &modified_files, tail),
            }
        } else {
            ContinuationContext::default()
        };

        SavedWorkflowState {
            workflow_id: request.workflow_id,
            workflow_type: request.workflow_type,
            session_id: request.session_id,
            phase: request.phase,
            task_id: request.task_id,
            modified_files,
            agent_run_id: interrupted_run.or_else(|| request.agent_run_ids.first().cloned()),
            partial_output: (!partial.is_empty()).then_some(partial),
            continuation,
            loop_iterations: request.loop_iterations,
            paused_at: Utc::now(),
            pause_reason: request.reason,
            conflicting_workflow_id: request.conflicting_workflow_id,
        }
    }

    /// Load and delete a paused workflow's state.
    pub async fn resume(
        &self,
        session_id: &str,
        workflow_id: &str,
    ) -> Result<SavedWorkflowState, PauseError> {
        let state = self.load(session_id, workflow_id).await?.ok_or_else(|| {
            PauseError::NotFound {
                session_id: session_id.to_string(),
                workflow_id: workflow_id.to_string(),
            }
        })?;
        self.store(workflow_id)?.delete(session_id, workflow_id).await?;
        info!(workflow_id, phase_index = state.phase.index, "Workflow state restored");
        Ok(state)
    }

    /// Read a paused workflow's state without consuming it.
    pub async fn load(
        &self,
        session_id: &str,
        workflow_id: &str,
    ) -> Result<Option<SavedWorkflowState>, PauseError> {
        let store = self.store(workflow_id)?;
        let Some(value) = store.load(session_id, workflow_id).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| PauseError::Serialization {
                workflow_id: workflow_id.to_string(),
                source,
            })
    }

    /// Paused workflows of a session. Unreadable records are skipped.
    pub async fn list_paused(&self, session_id: &str) -> Result<Vec<SavedWorkflowState>, PauseError> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut paused = Vec::new();
        for key in store.list(session_id).await? {
            match self.load(session_id, &key).await {
                Ok(Some(state)) => paused.push(state),
                Ok(None) => {}
                Err(e) => warn!(session_id, key = %key, error = %e, "Skipping unreadable paused workflow"),
            }
        }
        Ok(paused)
    }

    /// Drop a paused workflow's state. Returns `true` if it existed.
    pub async fn discard(&self, session_id: &str, workflow_id: &str) -> Result<bool, PauseError> {
        Ok(self.store(workflow_id)?.delete(session_id, workflow_id).await?)
    }
}
