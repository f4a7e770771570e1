//! Per-workflow context handed to every phase.
//!
//! The context is the only way a phase reaches shared services: it borrows
//! pooled agents, runs prompts through the [`AgentRunner`], declares
//! conflicts and reports progress. It also tracks the runs in flight so the
//! engine can capture and stop them when the workflow pauses.

use crate::agents::log_file::next_session_log;
use crate::agents::{AgentError, AgentRunResult, AgentRunner, RunOptions, StopReason};
use crate::config::RoleRegistry;
use crate::supervisor::snapshot::sanitize_id;
use crate::workflow::base::{ConflictCoordinator, PhaseError};
use crate::workflow::pool::{AgentLease, AgentPool};
use apc_protocol::ipc::Event;
use apc_protocol::workflow_models::{ConflictDeclaration, ConflictPolicy, ConflictScope};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Services shared by every workflow the engine drives.
#[derive(Clone)]
pub struct WorkflowServices {
    pub runner: Arc<AgentRunner>,
    pub pool: AgentPool,
    pub roles: Arc<RoleRegistry>,
    pub events: Option<mpsc::Sender<Event>>,
    /// Working directory of agent runs.
    pub workdir: PathBuf,
    /// Directory of per-agent session logs. No transcripts when `None`.
    pub log_dir: Option<PathBuf>,
}

impl WorkflowServices {
    pub fn new(runner: Arc<AgentRunner>, pool: AgentPool, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            pool,
            roles: Arc::new(RoleRegistry::default()),
            events: None,
            workdir: workdir.into(),
            log_dir: None,
        }
    }

    pub fn with_roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = Arc::new(roles);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }
}

struct ContextInner {
    workflow_id: String,
    session_id: String,
    task_id: Option<String>,
    services: WorkflowServices,
    conflicts: Option<Arc<dyn ConflictCoordinator>>,
    phase: Mutex<(usize, String)>,
    continuation: Mutex<Option<String>>,
    modified_files: Mutex<BTreeSet<String>>,
    current_runs: Mutex<Vec<String>>,
    run_counter: AtomicU64,
}

/// Handle given to [`Workflow::execute_phase`](crate::workflow::Workflow::execute_phase).
#[derive(Clone)]
pub struct PhaseContext {
    inner: Arc<ContextInner>,
}

impl PhaseContext {
    pub fn new(
        services: WorkflowServices,
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        task_id: Option<String>,
        conflicts: Option<Arc<dyn ConflictCoordinator>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                workflow_id: workflow_id.into(),
                session_id: session_id.into(),
                task_id,
                services,
                conflicts,
                phase: Mutex::new((0, String::new())),
                continuation: Mutex::new(None),
                modified_files: Mutex::new(BTreeSet::new()),
                current_runs: Mutex::new(Vec::new()),
                run_counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn task_id(&self) -> Option<&str> {
        self.inner.task_id.as_deref()
    }

    pub fn phase_index(&self) -> usize {
        self.inner.phase.lock().0
    }

    pub fn phase_name(&self) -> String {
        self.inner.phase.lock().1.clone()
    }

    pub fn workdir(&self) -> &Path {
        &self.inner.services.workdir
    }

    pub fn runner(&self) -> &Arc<AgentRunner> {
        &self.inner.services.runner
    }

    pub fn pool(&self) -> &AgentPool {
        &self.inner.services.pool
    }

    /// Borrow a pooled agent of `role`, waiting if all are busy.
    pub async fn acquire_agent(&self, role: &str) -> Result<AgentLease, PhaseError> {
        if self.pool().available(role).is_empty() {
            self.report_progress(format!("Waiting for a free {role} agent"))
                .await;
        }
        let lease = self.pool().acquire(role, self.workflow_id()).await?;
        debug!(workflow_id = %self.workflow_id(), agent = %lease.name(), role, "Agent assigned");
        Ok(lease)
    }

    /// Run `prompt` as the leased agent.
    ///
    /// The role's template is rendered in front of the prompt, and the
    /// continuation prompt of a resumed workflow goes in front of that, once.
    pub async fn run_agent(&self, lease: &AgentLease, prompt: &str) -> Result<AgentRunResult, PhaseError> {
        self.run_agent_with(lease, prompt, None).await
    }

    /// Like [`run_agent`](Self::run_agent), writing the answer's plan section
    /// to `plan_file` (relative to the working directory).
    pub async fn run_agent_with(
        &self,
        lease: &AgentLease,
        prompt: &str,
        plan_file: Option<&Path>,
    ) -> Result<AgentRunResult, PhaseError> {
        let (phase_index, phase) = self.inner.phase.lock().clone();
        let role = self.inner.services.roles.resolve(lease.role());
        let n = self.inner.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let run_id = sanitize_id(&format!("{}_{phase}_{n}", self.workflow_id()));

        let mut full_prompt = String::new();
        if let Some(continuation) = self.take_continuation() {
            full_prompt.push_str(&continuation);
            full_prompt.push_str("\n\n---\n\n");
        }
        let preamble = role.render(self.task_id().unwrap_or_default(), &phase);
        if !preamble.is_empty() {
            full_prompt.push_str(&preamble);
            full_prompt.push_str("\n\n");
        }
        full_prompt.push_str(prompt);

        let mut options = RunOptions::new(run_id.clone(), full_prompt, self.workdir())
            .with_tier(role.tier)
            .with_metadata("workflow_id", self.workflow_id())
            .with_metadata("phase", phase.as_str())
            .with_metadata("agent", lease.name())
            .with_metadata("role", lease.role());
        if let Some(secs) = role.timeout_secs {
            options = options.with_timeout(std::time::Duration::from_secs(secs));
        }
        if let Some(plan_file) = plan_file {
            options = options.with_plan_file(self.workdir().join(plan_file));
        }
        if let Some(log_dir) = &self.inner.services.log_dir {
            match next_session_log(log_dir, lease.name()).await {
                Ok(path) => options = options.with_log_file(path),
                Err(e) => warn!(run_id = %run_id, error = %e, "No session log for run"),
            }
        }
        if let Some(events) = self.inner.services.events.clone() {
            let workflow_id = self.workflow_id().to_string();
            let agent = lease.name().to_string();
            options = options.on_progress(move |message| {
                let _ = events.try_send(Event::WorkflowProgress {
                    workflow_id: workflow_id.clone(),
                    message: format!("{agent}: {message}"),
                });
            });
        }

        let _slot = RunSlot::register(&self.inner, &run_id);
        debug!(run_id = %run_id, phase_index, agent = %lease.name(), "Starting agent run");
        let result = self.runner().run(options).await;
        if result.success {
            return Ok(result);
        }
        let error = result.error.unwrap_or_else(|| AgentError::ExitFailure {
            code: result.exit_code,
            message: "run failed without an error".to_string(),
        });
        Err(PhaseError::AgentFailed { phase, error })
    }

    /// Run several prompts concurrently, one pooled agent each, and wait for
    /// all of them.
    ///
    /// Each job is `(label, prompt)`. Results come back in job order; the
    /// first failure is returned after every run has finished.
    pub async fn run_parallel(
        &self,
        role: &str,
        jobs: Vec<(String, String)>,
    ) -> Result<Vec<(String, AgentRunResult)>, PhaseError> {
        let runs = jobs.into_iter().map(|(label, prompt)| async move {
            let lease = self.acquire_agent(role).await?;
            let result = self.run_agent(&lease, &prompt).await?;
            Ok::<_, PhaseError>((label, result))
        });

        let mut results = Vec::new();
        let mut first_error = None;
        for outcome in futures::future::join_all(runs).await {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Claim `scope` exclusively; workflows inside it are paused by the
    /// coordinator. Returns the ids of paused workflows.
    pub async fn declare_conflict(&self, scope: ConflictScope) -> Result<Vec<String>, PhaseError> {
        let declaration = ConflictDeclaration {
            workflow_id: self.workflow_id().to_string(),
            scope: scope.clone(),
            policy: ConflictPolicy::PauseOthers,
        };
        self.emit(Event::ConflictDeclared {
            workflow_id: self.workflow_id().to_string(),
            scope,
        })
        .await;

        let Some(conflicts) = &self.inner.conflicts else {
            debug!(workflow_id = %self.workflow_id(), "No conflict coordinator; declaration not enforced");
            return Ok(Vec::new());
        };
        let paused = conflicts.declare(declaration).await?;
        if !paused.is_empty() {
            self.report_progress(format!("Paused conflicting workflows: {}", paused.join(", ")))
                .await;
        }
        Ok(paused)
    }

    /// Drop every conflict this workflow declared.
    pub async fn clear_conflicts(&self) -> Result<Vec<String>, PhaseError> {
        let Some(conflicts) = &self.inner.conflicts else {
            return Ok(Vec::new());
        };
        let unblocked = conflicts.clear(self.workflow_id()).await?;
        self.emit(Event::ConflictsCleared {
            workflow_id: self.workflow_id().to_string(),
        })
        .await;
        Ok(unblocked)
    }

    pub async fn report_progress(&self, message: impl Into<String>) {
        self.emit(Event::WorkflowProgress {
            workflow_id: self.workflow_id().to_string(),
            message: message.into(),
        })
        .await;
    }

    pub fn add_modified_file(&self, path: impl Into<String>) {
        self.inner.modified_files.lock().insert(path.into());
    }

    pub fn modified_files(&self) -> BTreeSet<String> {
        self.inner.modified_files.lock().clone()
    }

    /// Agent runs currently in flight for this workflow.
    pub fn current_run_ids(&self) -> Vec<String> {
        self.inner.current_runs.lock().clone()
    }

    /// Whether a continuation prompt is still waiting for the next run.
    pub fn has_continuation(&self) -> bool {
        self.inner.continuation.lock().is_some()
    }

    pub(crate) async fn emit(&self, event: Event) {
        if let Some(events) = &self.inner.services.events {
            let _ = events.send(event).await;
        }
    }

    pub(crate) fn enter_phase(&self, index: usize, name: &str) {
        *self.inner.phase.lock() = (index, name.to_string());
    }

    pub(crate) fn set_continuation(&self, prompt: Option<String>) {
        *self.inner.continuation.lock() = prompt.filter(|p| !p.trim().is_empty());
    }

    pub(crate) fn extend_modified_files(&self, files: impl IntoIterator<Item = String>) {
        self.inner.modified_files.lock().extend(files);
    }

    pub(crate) async fn stop_current_runs(&self, reason: StopReason) {
        for run_id in self.current_run_ids() {
            self.runner().stop(&run_id, reason).await;
        }
    }

    fn take_continuation(&self) -> Option<String> {
        self.inner.continuation.lock().take()
    }
}

/// Keeps a run id in the in-flight list for the duration of one run.
struct RunSlot<'a> {
    inner: &'a ContextInner,
    run_id: String,
}

impl<'a> RunSlot<'a> {
    fn register(inner: &'a ContextInner, run_id: &str) -> Self {
        inner.current_runs.lock().push(run_id.to_string());
        Self {
            inner,
            run_id: run_id.to_string(),
        }
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.inner.current_runs.lock().retain(|id| id != &self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockBackend, MockResponse};
    use apc_protocol::agent_models::RoleConfig;
    use std::collections::BTreeMap;

    fn services(backend: Arc<MockBackend>) -> WorkflowServices {
        let pool = AgentPool::new(&BTreeMap::from([(
            "engineer".to_string(),
            vec!["Alex".to_string(), "Betty".to_string()],
        )]));
        let mut engineer = RoleConfig::new("engineer");
        engineer.prompt_template = "You work on {{task}} in {{phase}}.".to_string();
        WorkflowServices::new(Arc::new(AgentRunner::new(backend)), pool, ".")
            .with_roles(RoleRegistry::new(vec![engineer]))
    }

    #[tokio::test]
    async fn test_run_agent_renders_role_and_uses_continuation_once() {
        let backend = Arc::new(MockBackend::new());
        let ctx = PhaseContext::new(services(backend.clone()), "wf-1", "s-1", Some("T3".to_string()), None);
        ctx.enter_phase(1, "implement");
        ctx.set_continuation(Some("## Resuming paused work".to_string()));

        let lease = ctx.acquire_agent("engineer").await.unwrap();
        ctx.run_agent(&lease, "Implement it").await.unwrap();
        ctx.run_agent(&lease, "Again").await.unwrap();

        let prompts = backend.prompts();
        assert_eq!(
            prompts[0],
            "## Resuming paused work\n\n---\n\nYou work on T3 in implement.\n\nImplement it"
        );
        assert_eq!(prompts[1], "You work on T3 in implement.\n\nAgain");
        assert_eq!(backend.run_ids(), vec!["wf-1_implement_1", "wf-1_implement_2"]);
        assert!(!ctx.has_continuation());
        assert!(ctx.current_run_ids().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_phase_error() {
        let backend = Arc::new(MockBackend::new().with_default(MockResponse::failure(
            AgentError::Reported("boom".to_string()),
        )));
        let ctx = PhaseContext::new(services(backend), "wf-1", "s-1", None, None);
        ctx.enter_phase(0, "plan");

        let lease = ctx.acquire_agent("engineer").await.unwrap();
        match ctx.run_agent(&lease, "Plan").await {
            Err(PhaseError::AgentFailed { phase, error }) => {
                assert_eq!(phase, "plan");
                assert_eq!(error, AgentError::Reported("boom".to_string()));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_parallel_uses_one_agent_per_job() {
        let backend = Arc::new(
            MockBackend::new()
                .with_rule("api", vec![MockResponse::success("api notes")])
                .with_rule("storage", vec![MockResponse::success("storage notes")]),
        );
        let ctx = PhaseContext::new(services(backend), "wf-1", "s-1", None, None);
        ctx.enter_phase(0, "gather");

        let results = ctx
            .run_parallel(
                "engineer",
                vec![
                    ("api".to_string(), "Research api".to_string()),
                    ("storage".to_string(), "Research storage".to_string()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "api");
        assert_eq!(results[0].1.output, "api notes");
        assert_eq!(results[1].1.output, "storage notes");
        assert_eq!(ctx.pool().available("engineer").len(), 2);
    }

    #[tokio::test]
    async fn test_events_and_conflicts_without_coordinator() {
        let (tx, mut rx) = mpsc::channel(16);
        let services = services(Arc::new(MockBackend::new())).with_events(tx);
        let ctx = PhaseContext::new(services, "wf-1", "s-1", Some("T3".to_string()), None);

        let paused = ctx.declare_conflict(ConflictScope::task("T3")).await.unwrap();
        assert!(paused.is_empty());
        ctx.report_progress("halfway").await;

        assert_eq!(
            rx.recv().await,
            Some(Event::ConflictDeclared {
                workflow_id: "wf-1".to_string(),
                scope: ConflictScope::task("T3"),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(Event::WorkflowProgress {
                workflow_id: "wf-1".to_string(),
                message: "halfway".to_string(),
            })
        );
    }

    #[test]
    fn test_modified_files() {
        let ctx = PhaseContext::new(services(Arc::new(MockBackend::new())), "wf-1", "s-1", None, None);
        ctx.add_modified_file("b.rs");
        ctx.extend_modified_files(["a.rs".to_string(), "b.rs".to_string()]);
        assert_eq!(ctx.modified_files().into_iter().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
    }
}
