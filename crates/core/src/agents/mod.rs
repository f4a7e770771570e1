//! Agent backends and the runner facade.
//!
//! This module provides the `AgentBackend` trait (one implementation per
//! external agent CLI), the shared stream/transcript machinery those
//! backends use, and the `AgentRunner` that workflows call.

pub mod adapters;
pub mod agent_type;
pub mod base;
pub mod factory;
pub mod log_file;
pub mod mcp;
pub mod retry;
pub mod runner;
pub mod stream;
pub mod transcript;

pub use adapters::{AgentSettings, CliBackend, CliProfile, MockBackend, MockResponse};
pub use agent_type::BackendKind;
pub use base::{
    AgentBackend, AgentError, AgentRunResult, DependencyStatus, RunOptions, RunningAgent,
    StopReason,
};
pub use factory::AgentFactory;
pub use mcp::McpServer;
pub use retry::{ErrorClassification, ErrorClassifier, ErrorKind, PatternClassifier, RetryPolicy};
pub use runner::AgentRunner;
