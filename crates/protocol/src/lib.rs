//! # apc-protocol
//!
//! Core protocol definitions and data models for the agent process coordinator.
//!
//! This crate defines all shared data structures used for:
//! - Configuration file parsing (TOML config, Markdown roles, YAML workflows)
//! - Supervised OS process state and pause snapshots
//! - Durable paused-workflow records
//! - Events emitted by the workflow engine
//!
//! ## Modules
//!
//! - [`agent_models`]: Role definitions and capability tiers
//! - [`config_models`]: Global configuration from config.toml
//! - [`workflow_models`]: Workflow definitions, conflicts and saved state
//! - [`process_models`]: Supervised process state and snapshots
//! - [`ipc`]: Operations and Events exchanged with front-ends
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, ts-rs, and chrono
//! - TypeScript generation: All types derive `TS` for webview consumers
//! - Independent compilation: No dependencies on other apc crates

pub mod agent_models;
pub mod config_models;
pub mod ipc;
pub mod process_models;
pub mod workflow_models;

// Re-export all public types for convenience
pub use agent_models::*;
pub use config_models::*;
pub use ipc::*;
pub use process_models::*;
pub use workflow_models::*;
