//! OS process supervision.
//!
//! This module provides the `ProcessSupervisor`, which owns every agent
//! subprocess, and the `ProcessPlatform` abstraction it uses to start and
//! terminate process groups.

pub mod error;
pub mod manager;
pub mod platform;
pub mod snapshot;

pub use error::{SupervisorError, SupervisorResult};
pub use manager::{
    OutputLine, ProcessExit, ProcessHandle, ProcessHandlers, ProcessSupervisor, SpawnOptions,
    StuckHandler, SupervisorSettings, TimeoutHandler,
};
pub use platform::{ProcessPlatform, TerminateMode};
pub use snapshot::SnapshotStore;
