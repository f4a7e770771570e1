//! # apc-core
//!
//! Core engine and agent management for agent-process-coordinator.
//!
//! This crate provides:
//! - Supervision of agent CLI child processes
//! - Agent backend abstraction and the CLI adapters built on it
//! - A phase engine for workflows with pause/resume and conflict handling
//! - Configuration loading from the `.apc/` directory
//!
//! ## Modules
//!
//! - [`supervisor`]: Child process lifecycle, output capture and snapshots
//! - [`agents`]: Agent backends, retries and the [`agents::AgentRunner`] facade
//! - [`workflow`]: Workflow trait, phase context, agent pool and pause persistence
//! - [`engine`]: Phase engine driving workflows
//! - [`state`]: Coordinator for all live workflows
//! - [`config`]: Configuration loading and management

pub mod agents;
pub mod config;
pub mod engine;
pub mod state;
pub mod supervisor;
pub mod workflow;
