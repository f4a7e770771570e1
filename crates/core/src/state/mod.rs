//! Coordination of live workflows.
//!
//! This module provides:
//! - WorkflowCoordinator for starting, pausing, resuming and cancelling workflows
//! - Conflict enforcement between workflows that touch the same task

pub mod manager;

pub use manager::{WorkflowCoordinator, WorkflowStatus};
