//! Scripted backend for tests and dry runs. Never spawns a process.

use crate::agents::agent_type::BackendKind;
use crate::agents::base::{
    AgentBackend, AgentError, AgentRunResult, DependencyStatus, RunOptions, RunningAgent,
    StopReason,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// What a mock run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub output: String,
    pub success: bool,
    /// How long the run stays active before resolving.
    pub delay: Duration,
    pub error: Option<AgentError>,
}

impl MockResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn failure(error: AgentError) -> Self {
        Self {
            output: String::new(),
            success: false,
            delay: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Rule {
    pattern: String,
    responses: VecDeque<MockResponse>,
}

/// Removes a run from the table when the run ends or its future is dropped.
struct RunEntry<'a> {
    runs: &'a Mutex<HashMap<String, MockRun>>,
    id: String,
}

impl Drop for RunEntry<'_> {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.id);
    }
}

struct MockRun {
    output: String,
    started_at: DateTime<Utc>,
    stop: watch::Sender<Option<StopReason>>,
}

/// Backend answering prompts from a script.
///
/// Rules are matched in insertion order by substring of the prompt. A rule
/// yields its responses in order and then keeps repeating the last one.
pub struct MockBackend {
    available: bool,
    default: MockResponse,
    rules: Mutex<Vec<Rule>>,
    prompts: Mutex<Vec<(String, String)>>,
    runs: Mutex<HashMap<String, MockRun>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            available: true,
            default: MockResponse::success("Mock response"),
            rules: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_default(mut self, response: MockResponse) -> Self {
        self.default = response;
        self
    }

    pub fn with_rule(self, pattern: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        self.rules.lock().push(Rule {
            pattern: pattern.into(),
            responses: responses.into(),
        });
        self
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Run ids received so far, in order.
    pub fn run_ids(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    fn next_response(&self, prompt: &str) -> MockResponse {
        let mut rules = self.rules.lock();
        let Some(rule) = rules.iter_mut().find(|r| prompt.contains(&r.pattern)) else {
            return self.default.clone();
        };
        if rule.responses.len() > 1 {
            rule.responses.pop_front().unwrap_or_else(|| self.default.clone())
        } else {
            rule.responses
                .front()
                .cloned()
                .unwrap_or_else(|| self.default.clone())
        }
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn run(&self, options: RunOptions) -> AgentRunResult {
        let run_id = options.id.clone();
        if !self.available {
            return AgentRunResult::failed(
                run_id,
                AgentError::NotAvailable("mock backend disabled".to_string()),
            );
        }

        let started = Instant::now();
        self.prompts
            .lock()
            .push((run_id.clone(), options.prompt.clone()));
        let response = self.next_response(&options.prompt);

        let (stop_tx, mut stop_rx) = watch::channel(None);
        self.runs.lock().insert(
            run_id.clone(),
            MockRun {
                output: response.output.clone(),
                started_at: Utc::now(),
                stop: stop_tx,
            },
        );
        let guard = RunEntry {
            runs: &self.runs,
            id: run_id.clone(),
        };
        options.started(&run_id, None);
        options.output(&response.output);

        let stopped = tokio::select! {
            _ = tokio::time::sleep(response.delay) => None,
            changed = stop_rx.wait_for(Option::is_some) => changed.ok().and_then(|r| *r),
        };
        drop(guard);

        let (success, error) = match stopped {
            Some(StopReason::Completed) => (true, None),
            Some(reason) => (false, Some(AgentError::Stopped(reason))),
            None => (response.success, response.error),
        };
        AgentRunResult {
            run_id,
            success,
            exit_code: success.then_some(0),
            output: response.output,
            error,
            duration: started.elapsed(),
        }
    }

    async fn stop(&self, run_id: &str, reason: StopReason) -> bool {
        match self.runs.lock().get(run_id) {
            Some(run) => {
                run.stop.send_replace(Some(reason));
                true
            }
            None => false,
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn dependency_status(&self) -> DependencyStatus {
        DependencyStatus {
            name: "mock".to_string(),
            installed: self.available,
            path: None,
            version: None,
            install_hint: "The mock backend needs no installation.".to_string(),
        }
    }

    fn running_agents(&self) -> Vec<RunningAgent> {
        let mut agents: Vec<RunningAgent> = self
            .runs
            .lock()
            .iter()
            .map(|(id, run)| RunningAgent {
                run_id: id.clone(),
                pid: None,
                started_at: run.started_at,
            })
            .collect();
        agents.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        agents
    }

    fn is_running(&self, run_id: &str) -> bool {
        self.runs.lock().contains_key(run_id)
    }

    fn partial_output(&self, run_id: &str) -> Option<String> {
        self.runs.lock().get(run_id).map(|r| r.output.clone())
    }

    async fn dispose(&self) {
        for run in self.runs.lock().values() {
            run.stop.send_replace(Some(StopReason::Cancelled));
        }
    }
}
