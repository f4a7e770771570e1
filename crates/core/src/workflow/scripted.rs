//! Workflows defined in `.apc/workflows/*.yaml`, and the registry that maps
//! workflow types to constructors.

use crate::workflow::base::{PhaseError, PhaseOutcome, Workflow};
use crate::workflow::context::PhaseContext;
use crate::workflow::progress::summarize_progress;
use apc_protocol::config_models::DEFAULT_ROLE;
use apc_protocol::workflow_models::{ConflictScope, WorkflowDefinition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Executes a [`WorkflowDefinition`] phase by phase.
///
/// Per phase: optionally declare a conflict on the task, borrow one agent
/// (or one per parallel preset), run the rendered prompt, and check the
/// `until` marker, looping back to `loop-back-to` when it is missing.
pub struct ScriptedWorkflow {
    definition: Arc<WorkflowDefinition>,
    task_id: Option<String>,
}

impl ScriptedWorkflow {
    pub fn new(definition: Arc<WorkflowDefinition>, task_id: Option<String>) -> Self {
        Self {
            definition,
            task_id,
        }
    }

    fn index_of(&self, phase: &str) -> Option<usize> {
        self.definition.phases.iter().position(|p| p.name == phase)
    }
}

fn render(template: &str, task: &str, phase: &str, preset: &str) -> String {
    template
        .replace("{{task}}", task)
        .replace("{{phase}}", phase)
        .replace("{{preset}}", preset)
}

#[async_trait]
impl Workflow for ScriptedWorkflow {
    fn workflow_type(&self) -> &str {
        &self.definition.name
    }

    fn phase_names(&self) -> Vec<String> {
        self.definition.phases.iter().map(|p| p.name.clone()).collect()
    }

    fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    async fn execute_phase(
        &mut self,
        index: usize,
        ctx: &PhaseContext,
    ) -> Result<PhaseOutcome, PhaseError> {
        let definition = Arc::clone(&self.definition);
        let phase = definition
            .phases
            .get(index)
            .ok_or(PhaseError::UnknownPhase(index))?;
        let role = phase.role.as_deref().unwrap_or(DEFAULT_ROLE);
        let task = self.task_id.as_deref().unwrap_or_default();

        if phase.declare_conflict {
            let scope = self
                .task_id
                .as_ref()
                .map_or(ConflictScope::All, |task| ConflictScope::task(task.clone()));
            ctx.declare_conflict(scope).await?;
        }

        let outputs: Vec<String> = if phase.parallel.is_empty() {
            let lease = ctx.acquire_agent(role).await?;
            let prompt = render(&phase.prompt, task, &phase.name, "");
            let plan_file = phase.plan_file.as_deref().map(Path::new);
            vec![ctx.run_agent_with(&lease, &prompt, plan_file).await?.output]
        } else {
            let jobs = phase
                .parallel
                .iter()
                .map(|preset| (preset.clone(), render(&phase.prompt, task, &phase.name, preset)))
                .collect();
            ctx.run_parallel(role, jobs)
                .await?
                .into_iter()
                .map(|(_, result)| result.output)
                .collect()
        };

        for output in &outputs {
            ctx.extend_modified_files(summarize_progress(output).modified_files);
        }

        let Some(marker) = &phase.until else {
            return Ok(PhaseOutcome::Next);
        };
        if outputs.iter().any(|output| output.contains(marker.as_str())) {
            return Ok(PhaseOutcome::Next);
        }
        match phase.loop_back_to.as_deref().and_then(|target| self.index_of(target)) {
            Some(target) => {
                ctx.report_progress(format!(
                    "'{marker}' not reported in '{}', returning to '{}'",
                    phase.name, definition.phases[target].name
                ))
                .await;
                Ok(PhaseOutcome::LoopBack(target))
            }
            None => Err(PhaseError::ConditionNotMet {
                phase: phase.name.clone(),
                marker: marker.clone(),
            }),
        }
    }
}

/// Builds a workflow for a task.
pub type WorkflowFactory = Arc<dyn Fn(Option<String>) -> Box<dyn Workflow> + Send + Sync>;

/// Workflow types known to the coordinator. Paused workflows are recreated
/// from here on resume.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one [`ScriptedWorkflow`] type per definition.
    pub fn from_definitions(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register_definition(definition);
        }
        registry
    }

    pub fn register(
        &mut self,
        workflow_type: impl Into<String>,
        factory: impl Fn(Option<String>) -> Box<dyn Workflow> + Send + Sync + 'static,
    ) {
        self.factories.insert(workflow_type.into(), Arc::new(factory));
    }

    pub fn register_definition(&mut self, definition: WorkflowDefinition) {
        let name = definition.name.clone();
        let definition = Arc::new(definition);
        self.register(name, move |task_id| {
            Box::new(ScriptedWorkflow::new(Arc::clone(&definition), task_id))
        });
    }

    pub fn create(&self, workflow_type: &str, task_id: Option<String>) -> Option<Box<dyn Workflow>> {
        self.factories.get(workflow_type).map(|factory| factory(task_id))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRunner, MockBackend, MockResponse};
    use crate::workflow::base::{ConflictCoordinator, CoordinatorError};
    use crate::workflow::context::WorkflowServices;
    use crate::workflow::pool::AgentPool;
    use apc_protocol::config_models::PoolConfig;
    use apc_protocol::workflow_models::{ConflictDeclaration, PhaseDefinition};
    use parking_lot::Mutex;

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

    fn definition(phases: Vec<PhaseDefinition>) -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "implement-task".to_string(),
            description: String::new(),
            phases,
        })
    }

    fn context(backend: MockBackend, conflicts: Option<Arc<dyn ConflictCoordinator>>) -> PhaseContext {
        let services = WorkflowServices::new(
            Arc::new(AgentRunner::new(Arc::new(backend))),
            AgentPool::from_config(&PoolConfig::default()),
            ".",
        );
        PhaseContext::new(services, "wf-1", "s-1", Some("T3".to_string()), conflicts)
    }

    #[derive(Default)]
    struct RecordingCoordinator {
        declared: Mutex<Vec<ConflictDeclaration>>,
    }

    #[async_trait]
    impl ConflictCoordinator for RecordingCoordinator {
        async fn declare(&self, declaration: ConflictDeclaration) -> Result<Vec<String>, CoordinatorError> {
            self.declared.lock().push(declaration);
            Ok(vec!["wf-2".to_string()])
        }

        async fn clear(&self, _workflow_id: &str) -> Result<Vec<String>, CoordinatorError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_phase_renders_prompt_and_collects_files() {
        let backend = MockBackend::new().with_default(MockResponse::success(
            "Done: handler\nFiles modified:\n- src/api.rs\n",
        ));
        let ctx = context(backend, None);
        let mut workflow = ScriptedWorkflow::new(
            definition(vec![phase("implement", "Implement {{task}} ({{phase}})")]),
            Some("T3".to_string()),
        );
        ctx.enter_phase(0, "implement");

        let outcome = workflow.execute_phase(0, &ctx).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Next);
        assert!(ctx.modified_files().contains("src/api.rs"));
        assert!(matches!(
            workflow.execute_phase(5, &ctx).await,
            Err(PhaseError::UnknownPhase(5))
        ));
    }

    #[tokio::test]
    async fn test_until_marker_loops_back() {
        let backend = MockBackend::new().with_rule(
            "Verify",
            vec![MockResponse::success("still failing"), MockResponse::success("VERIFIED")],
        );
        let ctx = context(backend, None);
        let mut verify = phase("verify", "Verify {{task}}");
        verify.until = Some("VERIFIED".to_string());
        verify.loop_back_to = Some("implement".to_string());
        let mut workflow = ScriptedWorkflow::new(
            definition(vec![phase("implement", "Implement"), verify]),
            Some("T3".to_string()),
        );

        assert_eq!(workflow.execute_phase(1, &ctx).await.unwrap(), PhaseOutcome::LoopBack(0));
        assert_eq!(workflow.execute_phase(1, &ctx).await.unwrap(), PhaseOutcome::Next);
    }

    #[tokio::test]
    async fn test_until_marker_without_loop_back_fails() {
        let ctx = context(MockBackend::new(), None);
        let mut check = phase("check", "Check");
        check.until = Some("OK".to_string());
        let mut workflow = ScriptedWorkflow::new(definition(vec![check]), None);

        match workflow.execute_phase(0, &ctx).await {
            Err(PhaseError::ConditionNotMet { phase, marker }) => {
                assert_eq!(phase, "check");
                assert_eq!(marker, "OK");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_presets() {
        let backend = MockBackend::new()
            .with_rule("api", vec![MockResponse::success("VERIFIED api")])
            .with_rule("storage", vec![MockResponse::success("storage only")]);
        let ctx = context(backend, None);
        let mut gather = phase("gather", "Research {{preset}}");
        gather.parallel = vec!["api".to_string(), "storage".to_string()];
        gather.until = Some("VERIFIED".to_string());
        let mut workflow = ScriptedWorkflow::new(definition(vec![gather]), None);

        assert_eq!(workflow.execute_phase(0, &ctx).await.unwrap(), PhaseOutcome::Next);
        assert_eq!(ctx.pool().available("engineer").len(), 5);
    }

    #[tokio::test]
    async fn test_declare_conflict_on_task() {
        let coordinator = Arc::new(RecordingCoordinator::default());
        let shared: Arc<dyn ConflictCoordinator> = coordinator.clone();
        let ctx = context(MockBackend::new(), Some(shared));
        let mut implement = phase("implement", "Implement");
        implement.declare_conflict = true;
        let mut workflow =
            ScriptedWorkflow::new(definition(vec![implement]), Some("T3".to_string()));

        workflow.execute_phase(0, &ctx).await.unwrap();
        let declared = coordinator.declared.lock();
        assert_eq!(declared.len(), 1);
        assert_eq!(declared[0].workflow_id, "wf-1");
        assert_eq!(declared[0].scope, ConflictScope::task("T3"));
    }

    #[test]
    fn test_registry() {
        let mut registry = WorkflowRegistry::from_definitions([WorkflowDefinition {
            name: "review".to_string(),
            description: String::new(),
            phases: vec![phase("read", "Read")],
        }]);
        registry.register("custom", |task| {
            Box::new(ScriptedWorkflow::new(definition(vec![phase("a", "A")]), task))
        });

        assert_eq!(registry.types(), vec!["custom", "review"]);
        let workflow = registry.create("review", Some("T1".to_string())).unwrap();
        assert_eq!(workflow.workflow_type(), "review");
        assert_eq!(workflow.task_id(), Some("T1"));
        assert_eq!(workflow.phase_names(), vec!["read"]);
        assert!(registry.create("missing", None).is_none());
    }
}
