//! Workflow building blocks.
//!
//! This module provides the [`Workflow`] trait, the [`PhaseContext`] phases
//! run against, the agent pool, the pause manager with its session store,
//! and YAML-defined [`ScriptedWorkflow`]s.

pub mod base;
pub mod context;
pub mod pause;
pub mod pool;
pub mod progress;
pub mod scripted;
pub mod store;

pub use base::{ConflictCoordinator, CoordinatorError, PhaseError, PhaseOutcome, Workflow};
pub use context::{PhaseContext, WorkflowServices};
pub use pause::{PauseError, PauseRequest, WorkflowPauseManager};
pub use pool::{AgentLease, AgentPool, PoolError};
pub use progress::{build_continuation_prompt, summarize_progress, ProgressSummary};
pub use scripted::{ScriptedWorkflow, WorkflowFactory, WorkflowRegistry};
pub use store::{JsonFileStore, MemoryStore, SessionStore, StoreError};
