//! Coordinator for all workflows of a daemon.
//!
//! The WorkflowCoordinator is the central orchestrator: it launches workflows
//! on the engine, routes pause/resume/cancel requests to them, and enforces
//! conflict declarations by pausing every workflow whose task falls inside a
//! declared scope and resuming it once nothing blocks it anymore.

use crate::engine::{WorkflowControl, WorkflowEngine, WorkflowLaunch, WorkflowOutcome};
use crate::workflow::{ConflictCoordinator, CoordinatorError, Workflow, WorkflowRegistry};
use apc_protocol::ipc::Op;
use apc_protocol::workflow_models::{ConflictDeclaration, ConflictScope, PauseReason, SavedWorkflowState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a workflow as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    /// A pause was requested; the engine is saving state.
    Pausing,
    Paused,
    Completed,
    Failed(String),
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow is still executing on the engine.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Pausing)
    }
}

struct LiveWorkflow {
    control: watch::Sender<WorkflowControl>,
    session_id: String,
    task_id: Option<String>,
}

struct Blocked {
    session_id: String,
    blockers: HashSet<String>,
}

#[derive(Default)]
struct CoordinatorState {
    live: HashMap<String, LiveWorkflow>,
    /// declarer -> scopes it holds
    declarations: HashMap<String, Vec<ConflictScope>>,
    /// paused by conflict -> declarers still blocking it
    blocked: HashMap<String, Blocked>,
    status: HashMap<String, watch::Sender<WorkflowStatus>>,
}

impl CoordinatorState {
    fn set_status(&mut self, workflow_id: &str, status: WorkflowStatus) {
        match self.status.get(workflow_id) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => {
                let (tx, _) = watch::channel(status);
                self.status.insert(workflow_id.to_string(), tx);
            }
        }
    }

    /// First declarer other than `workflow_id` whose scope covers `task_id`.
    fn blocking_declarer(&self, workflow_id: &str, task_id: Option<&str>) -> Option<String> {
        self.declarations
            .iter()
            .filter(|(declarer, _)| declarer.as_str() != workflow_id)
            .find(|(_, scopes)| scopes.iter().any(|scope| covers(scope, task_id)))
            .map(|(declarer, _)| declarer.clone())
    }
}

/// A workflow without a task is only inside the wildcard scope.
fn covers(scope: &ConflictScope, task_id: Option<&str>) -> bool {
    match task_id {
        Some(task) => scope.covers(task),
        None => matches!(scope, ConflictScope::All),
    }
}

struct CoordinatorInner {
    engine: Arc<WorkflowEngine>,
    registry: WorkflowRegistry,
    state: Mutex<CoordinatorState>,
}

/// Registry of live workflows. Cloning shares the same registry.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl WorkflowCoordinator {
    /// Create a new WorkflowCoordinator.
    ///
    /// # Arguments
    ///
    /// * `engine` - The engine that executes workflows
    /// * `registry` - Workflow types that can be started and resumed
    pub fn new(engine: Arc<WorkflowEngine>, registry: WorkflowRegistry) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                registry,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.inner.engine
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    /// Start a workflow in the background and return its id.
    ///
    /// A workflow whose task is inside an active conflict scope starts
    /// paused and resumes when the conflict is cleared.
    pub async fn start(
        &self,
        workflow_type: &str,
        session_id: &str,
        task_id: Option<String>,
    ) -> Result<String, CoordinatorError> {
        let workflow = self
            .inner
            .registry
            .create(workflow_type, task_id.clone())
            .ok_or_else(|| CoordinatorError::UnknownWorkflowType(workflow_type.to_string()))?;
        let short = Uuid::new_v4().simple().to_string();
        let workflow_id = format!("{workflow_type}-{}", &short[..8]);

        let initial = {
            let mut state = self.inner.state.lock();
            match state.blocking_declarer(&workflow_id, task_id.as_deref()) {
                Some(declarer) => {
                    info!(workflow_id = %workflow_id, blocker = %declarer, "Starting workflow paused by conflict");
                    state.blocked.insert(
                        workflow_id.clone(),
                        Blocked {
                            session_id: session_id.to_string(),
                            blockers: HashSet::from([declarer.clone()]),
                        },
                    );
                    WorkflowControl::Pause {
                        reason: PauseReason::Conflict,
                        conflicting_workflow_id: Some(declarer),
                    }
                }
                None => WorkflowControl::Run,
            }
        };

        self.launch(&workflow_id, session_id, task_id, workflow, None, initial);
        Ok(workflow_id)
    }

    fn launch(
        &self,
        workflow_id: &str,
        session_id: &str,
        task_id: Option<String>,
        workflow: Box<dyn Workflow>,
        saved: Option<SavedWorkflowState>,
        initial: WorkflowControl,
    ) {
        let (control_tx, control_rx) = watch::channel(initial);
        {
            let mut state = self.inner.state.lock();
            state.live.insert(
                workflow_id.to_string(),
                LiveWorkflow {
                    control: control_tx,
                    session_id: session_id.to_string(),
                    task_id,
                },
            );
            state.set_status(workflow_id, WorkflowStatus::Running);
        }

        let coordinator = self.clone();
        let conflicts: Arc<dyn ConflictCoordinator> = Arc::new(self.clone());
        let launch = WorkflowLaunch {
            workflow_id: workflow_id.to_string(),
            session_id: session_id.to_string(),
            conflicts: Some(conflicts),
            control: control_rx,
        };
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            let engine = Arc::clone(&coordinator.inner.engine);
            let result = match saved {
                Some(saved) => engine.resume(workflow, launch, saved).await,
                None => engine.run(workflow, launch).await,
            };
            let status = match result {
                Ok(WorkflowOutcome::Completed) => WorkflowStatus::Completed,
                Ok(WorkflowOutcome::Paused(_)) => WorkflowStatus::Paused,
                Ok(WorkflowOutcome::Failed(error)) => WorkflowStatus::Failed(error),
                Ok(WorkflowOutcome::Cancelled) => WorkflowStatus::Cancelled,
                Err(e) => WorkflowStatus::Failed(e.to_string()),
            };
            coordinator.on_finished(&workflow_id, status).await;
        });
    }

    async fn on_finished(&self, workflow_id: &str, status: WorkflowStatus) {
        let resume_session = {
            let mut state = self.inner.state.lock();
            state.live.remove(workflow_id);
            let paused = status == WorkflowStatus::Paused;
            if !paused {
                state.declarations.remove(workflow_id);
                state.blocked.remove(workflow_id);
            }
            state.set_status(workflow_id, status.clone());

            // Every blocker cleared while the pause was being saved.
            let unblocked = paused
                && state
                    .blocked
                    .get(workflow_id)
                    .is_some_and(|b| b.blockers.is_empty());
            if unblocked {
                state.blocked.remove(workflow_id).map(|b| b.session_id)
            } else {
                None
            }
        };
        debug!(workflow_id, ?status, "Workflow left the engine");

        if let Some(session_id) = resume_session {
            if let Err(e) = self.resume(&session_id, workflow_id).await {
                warn!(workflow_id, error = %e, "Failed to resume unblocked workflow");
            }
        }
    }

    /// Ask a running workflow to pause and save its state.
    pub fn pause(&self, workflow_id: &str, reason: PauseReason) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.lock();
        let live = state
            .live
            .get(workflow_id)
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(workflow_id.to_string()))?;
        live.control.send_replace(WorkflowControl::Pause {
            reason,
            conflicting_workflow_id: None,
        });
        state.set_status(workflow_id, WorkflowStatus::Pausing);
        info!(workflow_id, %reason, "Pause requested");
        Ok(())
    }

    /// Resume a paused workflow from its saved state.
    ///
    /// The saved state is consumed; the workflow continues at the phase it
    /// was paused in.
    pub async fn resume(&self, session_id: &str, workflow_id: &str) -> Result<(), CoordinatorError> {
        if self.inner.state.lock().live.contains_key(workflow_id) {
            return Err(CoordinatorError::AlreadyRunning(workflow_id.to_string()));
        }

        let pause_manager = self.inner.engine.pause_manager();
        let Some(peek) = pause_manager.load(session_id, workflow_id).await? else {
            return Err(CoordinatorError::UnknownWorkflow(workflow_id.to_string()));
        };
        if !self.inner.registry.contains(&peek.workflow_type) {
            return Err(CoordinatorError::UnknownWorkflowType(peek.workflow_type));
        }

        let saved = pause_manager.resume(session_id, workflow_id).await?;
        let workflow = self
            .inner
            .registry
            .create(&saved.workflow_type, saved.task_id.clone())
            .ok_or_else(|| CoordinatorError::UnknownWorkflowType(saved.workflow_type.clone()))?;
        self.inner.state.lock().blocked.remove(workflow_id);

        info!(workflow_id, phase_index = saved.phase.index, "Resuming workflow");
        let task_id = saved.task_id.clone();
        self.launch(workflow_id, session_id, task_id, workflow, Some(saved), WorkflowControl::Run);
        Ok(())
    }

    /// Stop a workflow without saving state.
    pub fn cancel(&self, workflow_id: &str) -> Result<(), CoordinatorError> {
        let state = self.inner.state.lock();
        let live = state
            .live
            .get(workflow_id)
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(workflow_id.to_string()))?;
        live.control.send_replace(WorkflowControl::Cancel);
        info!(workflow_id, "Cancel requested");
        Ok(())
    }

    /// Pause every live workflow with reason `shutdown` and wait until all
    /// of them have left the engine. Returns the ids that were asked to pause.
    pub async fn shutdown(&self) -> Vec<String> {
        let ids = self.live_ids();
        for id in &ids {
            if let Err(e) = self.pause(id, PauseReason::Shutdown) {
                debug!(workflow_id = %id, error = %e, "Workflow finished before shutdown");
            }
        }
        for id in &ids {
            self.wait(id).await;
        }
        info!(count = ids.len(), "Coordinator shut down");
        ids
    }

    /// Apply an operation received from a front-end.
    pub async fn handle_op(&self, op: Op) -> Result<Option<String>, CoordinatorError> {
        match op {
            Op::StartWorkflow {
                workflow_type,
                session_id,
                task_id,
            } => self.start(&workflow_type, &session_id, task_id).await.map(Some),
            Op::PauseWorkflow { workflow_id } => {
                self.pause(&workflow_id, PauseReason::UserRequest)?;
                Ok(None)
            }
            Op::ResumeWorkflow {
                session_id,
                workflow_id,
            } => {
                self.resume(&session_id, &workflow_id).await?;
                Ok(None)
            }
            Op::CancelWorkflow { workflow_id } => {
                self.cancel(&workflow_id)?;
                Ok(None)
            }
            Op::Shutdown => {
                self.shutdown().await;
                Ok(None)
            }
        }
    }

    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.inner
            .state
            .lock()
            .status
            .get(workflow_id)
            .map(|tx| tx.borrow().clone())
    }

    /// Ids of workflows currently on the engine, sorted.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Declarers currently blocking a paused workflow.
    pub fn blockers(&self, workflow_id: &str) -> Vec<String> {
        let mut blockers: Vec<String> = self
            .inner
            .state
            .lock()
            .blocked
            .get(workflow_id)
            .map(|b| b.blockers.iter().cloned().collect())
            .unwrap_or_default();
        blockers.sort();
        blockers
    }

    /// Wait until the workflow's status satisfies `predicate`. `None` for an
    /// unknown workflow.
    pub async fn wait_for(
        &self,
        workflow_id: &str,
        predicate: impl Fn(&WorkflowStatus) -> bool,
    ) -> Option<WorkflowStatus> {
        let mut rx = self.inner.state.lock().status.get(workflow_id)?.subscribe();
        let status = rx.wait_for(predicate).await.ok()?.clone();
        Some(status)
    }

    /// Wait until the workflow leaves the engine.
    pub async fn wait(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.wait_for(workflow_id, |s| !s.is_active()).await
    }
}

#[async_trait]
impl ConflictCoordinator for WorkflowCoordinator {
    async fn declare(&self, declaration: ConflictDeclaration) -> Result<Vec<String>, CoordinatorError> {
        let declarer = declaration.workflow_id;
        let (paused, mut waits) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state
                .declarations
                .entry(declarer.clone())
                .or_default()
                .push(declaration.scope.clone());

            let mut paused = Vec::new();
            let mut waits = Vec::new();
            for (id, live) in &state.live {
                if *id == declarer || !covers(&declaration.scope, live.task_id.as_deref()) {
                    continue;
                }
                state
                    .blocked
                    .entry(id.clone())
                    .or_insert_with(|| Blocked {
                        session_id: live.session_id.clone(),
                        blockers: HashSet::new(),
                    })
                    .blockers
                    .insert(declarer.clone());

                if *live.control.borrow() == WorkflowControl::Run {
                    live.control.send_replace(WorkflowControl::Pause {
                        reason: PauseReason::Conflict,
                        conflicting_workflow_id: Some(declarer.clone()),
                    });
                    paused.push(id.clone());
                }
                if let Some(tx) = state.status.get(id) {
                    waits.push(tx.subscribe());
                }
            }
            for id in &paused {
                state.set_status(id, WorkflowStatus::Pausing);
            }
            (paused, waits)
        };

        info!(declarer = %declarer, scope = ?declaration.scope, paused = ?paused, "Conflict declared");
        for rx in &mut waits {
            let _ = rx.wait_for(|s| !s.is_active()).await;
        }
        Ok(paused)
    }

    async fn clear(&self, workflow_id: &str) -> Result<Vec<String>, CoordinatorError> {
        let ready = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.declarations.remove(workflow_id);

            let mut ready = Vec::new();
            for (id, blocked) in state.blocked.iter_mut() {
                if blocked.blockers.remove(workflow_id)
                    && blocked.blockers.is_empty()
                    && !state.live.contains_key(id)
                {
                    ready.push((id.clone(), blocked.session_id.clone()));
                }
            }
            for (id, _) in &ready {
                state.blocked.remove(id);
            }
            ready
        };

        let mut resumed = Vec::new();
        for (id, session_id) in ready {
            match self.resume(&session_id, &id).await {
                Ok(()) => resumed.push(id),
                Err(e) => warn!(workflow_id = %id, error = %e, "Failed to resume after conflict cleared"),
            }
        }
        if !resumed.is_empty() {
            info!(declarer = workflow_id, resumed = ?resumed, "Conflicts cleared");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRunner, MockBackend, MockResponse};
    use crate::workflow::{
        AgentPool, MemoryStore, SessionStore, WorkflowPauseManager, WorkflowServices,
    };
    use apc_protocol::config_models::PoolConfig;
    use apc_protocol::workflow_models::{PhaseDefinition, WorkflowDefinition};
    use std::time::Duration;

    fn phase(name: &str, prompt: &str) -> PhaseDefinition {
        PhaseDefinition {
            name: name.to_string(),
            role: None,
            prompt: prompt.to_string(),
            parallel: Vec::new(),
            declare_conflict: false,
            until: None,
            loop_back_to: None,
            plan_file: None,
        }
    }

    fn coordinator(backend: MockBackend) -> (WorkflowCoordinator, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let runner = Arc::new(AgentRunner::new(backend.clone()));
        let services = WorkflowServices::new(
            Arc::clone(&runner),
            AgentPool::from_config(&PoolConfig::default()),
            ".",
        );
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let pause_manager = Arc::new(WorkflowPauseManager::new(runner, Some(store), 1_000));
        let engine = Arc::new(WorkflowEngine::new(services, pause_manager, 5));

        let mut fix = phase("fix", "Fix {{task}} first");
        fix.declare_conflict = true;
        let registry = WorkflowRegistry::from_definitions([
            WorkflowDefinition {
                name: "implement".to_string(),
                description: String::new(),
                phases: vec![phase("plan", "Plan {{task}}"), phase("build", "Build {{task}}")],
            },
            WorkflowDefinition {
                name: "hotfix".to_string(),
                description: String::new(),
                phases: vec![fix],
            },
        ]);
        (WorkflowCoordinator::new(engine, registry), backend)
    }

    #[tokio::test]
    async fn test_start_and_complete() {
        let (coordinator, backend) = coordinator(MockBackend::new());
        let id = coordinator.start("implement", "s-1", Some("T1".to_string())).await.unwrap();

        assert!(id.starts_with("implement-"));
        assert_eq!(coordinator.wait(&id).await, Some(WorkflowStatus::Completed));
        assert_eq!(backend.prompts(), vec!["Plan T1", "Build T1"]);
        assert!(coordinator.live_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let (coordinator, _backend) = coordinator(MockBackend::new());
        let result = coordinator.start("missing", "s-1", None).await;
        assert!(matches!(result, Err(CoordinatorError::UnknownWorkflowType(_))));
        assert!(matches!(
            coordinator.pause("nope", PauseReason::UserRequest),
            Err(CoordinatorError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_user_pause_and_resume() {
        let backend = MockBackend::new().with_rule(
            "Build",
            vec![
                MockResponse::success("✅ half").with_delay(Duration::from_secs(30)),
                MockResponse::success("done"),
            ],
        );
        let (coordinator, backend) = coordinator(backend);
        let id = coordinator.start("implement", "s-1", Some("T1".to_string())).await.unwrap();
        while backend.prompts().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        coordinator.pause(&id, PauseReason::UserRequest).unwrap();
        assert_eq!(coordinator.wait(&id).await, Some(WorkflowStatus::Paused));
        assert!(matches!(
            coordinator.resume("s-1", "unknown").await,
            Err(CoordinatorError::UnknownWorkflow(_))
        ));

        coordinator.resume("s-1", &id).await.unwrap();
        assert_eq!(coordinator.wait(&id).await, Some(WorkflowStatus::Completed));
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[2].contains("- half"));
    }

    #[tokio::test]
    async fn test_cancel() {
        let backend = MockBackend::new()
            .with_default(MockResponse::success("slow").with_delay(Duration::from_secs(30)));
        let (coordinator, backend) = coordinator(backend);
        let id = coordinator.start("implement", "s-1", None).await.unwrap();
        while backend.prompts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        coordinator.cancel(&id).unwrap();
        assert_eq!(coordinator.wait(&id).await, Some(WorkflowStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_conflict_pauses_and_resumes() {
        let backend = MockBackend::new()
            .with_rule(
                "Build T3",
                vec![
                    MockResponse::success("✅ started").with_delay(Duration::from_secs(30)),
                    MockResponse::success("built"),
                ],
            )
            .with_rule(
                "Fix T3",
                vec![MockResponse::success("fixed").with_delay(Duration::from_millis(500))],
            );
        let (coordinator, backend) = coordinator(backend);

        let w2 = coordinator.start("implement", "s-1", Some("T3".to_string())).await.unwrap();
        while !backend.prompts().iter().any(|p| p == "Build T3") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let w1 = coordinator.start("hotfix", "s-1", Some("T3".to_string())).await.unwrap();
        assert_eq!(
            coordinator.wait_for(&w2, |s| *s == WorkflowStatus::Paused).await,
            Some(WorkflowStatus::Paused)
        );
        assert_eq!(coordinator.blockers(&w2), vec![w1.clone()]);

        let saved = coordinator
            .engine()
            .pause_manager()
            .load("s-1", &w2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.pause_reason, PauseReason::Conflict);
        assert_eq!(saved.conflicting_workflow_id.as_deref(), Some(w1.as_str()));
        assert_eq!(saved.phase.index, 1);

        assert_eq!(coordinator.wait(&w1).await, Some(WorkflowStatus::Completed));
        assert_eq!(
            coordinator.wait_for(&w2, |s| *s == WorkflowStatus::Completed).await,
            Some(WorkflowStatus::Completed)
        );
        assert!(coordinator.blockers(&w2).is_empty());
        let resumed_prompt = backend
            .prompts()
            .into_iter()
            .find(|p| p.starts_with("## Resuming paused work"))
            .unwrap();
        assert!(resumed_prompt.ends_with("Build T3"));
    }

    #[tokio::test]
    async fn test_start_inside_declared_scope_waits() {
        let backend = MockBackend::new().with_rule(
            "Fix T3",
            vec![MockResponse::success("fixed").with_delay(Duration::from_millis(300))],
        );
        let (coordinator, backend) = coordinator(backend);

        let w1 = coordinator.start("hotfix", "s-1", Some("T3".to_string())).await.unwrap();
        while backend.prompts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let w2 = coordinator.start("implement", "s-1", Some("T3".to_string())).await.unwrap();
        let other = coordinator.start("implement", "s-1", Some("T9".to_string())).await.unwrap();

        assert_eq!(coordinator.wait(&other).await, Some(WorkflowStatus::Completed));
        assert_eq!(coordinator.wait(&w1).await, Some(WorkflowStatus::Completed));
        assert_eq!(
            coordinator.wait_for(&w2, |s| *s == WorkflowStatus::Completed).await,
            Some(WorkflowStatus::Completed)
        );
        let prompts = backend.prompts();
        let fix_at = prompts.iter().position(|p| p == "Fix T3 first").unwrap();
        let plan_at = prompts.iter().position(|p| p == "Plan T3").unwrap();
        assert!(fix_at < plan_at);
    }

    #[tokio::test]
    async fn test_shutdown_pauses_everything() {
        let backend = MockBackend::new()
            .with_default(MockResponse::success("slow").with_delay(Duration::from_secs(30)));
        let (coordinator, backend) = coordinator(backend);
        let a = coordinator.start("implement", "s-1", Some("T1".to_string())).await.unwrap();
        let b = coordinator.start("implement", "s-1", Some("T2".to_string())).await.unwrap();
        while backend.prompts().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        coordinator.handle_op(Op::Shutdown).await.unwrap();
        assert!(coordinator.live_ids().is_empty());
        assert_eq!(coordinator.status(&a), Some(WorkflowStatus::Paused));
        assert_eq!(coordinator.status(&b), Some(WorkflowStatus::Paused));

        let saved = coordinator.engine().pause_manager().list_paused("s-1").await.unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|s| s.pause_reason == PauseReason::Shutdown));
    }
}
