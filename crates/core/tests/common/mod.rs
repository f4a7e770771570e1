//! Common test utilities shared by the integration tests.
//!
//! This module provides:
//! - Project fixtures (`.apc/` configuration trees)
//! - Fake agent CLIs driven by shell scripts

pub mod fake_cli;
pub mod fixtures;

#[allow(unused_imports)]
pub use fake_cli::*;
#[allow(unused_imports)]
pub use fixtures::*;
