//! Global configuration models for `.apc/config.toml`.
//!
//! Every section and field has a default, so an empty or partial file is
//! valid.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use ts_rs::TS;

/// Names given to the default `engineer` pool slots.
pub const DEFAULT_AGENT_NAMES: [&str; 5] = ["Alex", "Betty", "Cleo", "Dany", "Eddy"];

/// Role used when a workflow phase does not name one.
pub const DEFAULT_ROLE: &str = "engineer";

/// Represents global settings from `.apc/config.toml`.
///
/// # Example
///
/// ```toml
/// # .apc/config.toml
/// backend = "cursor"
/// state_dir = ".apc/state"
///
/// [retry]
/// max_retries = 2
/// base_delay_ms = 5000
///
/// [pool.roles]
/// engineer = ["Alex", "Betty"]
/// reviewer = ["Rex"]
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct GlobalConfig {
    /// Active backend: "cursor", "claude" or "mock".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Directory holding paused-workflow records and process snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            state_dir: default_state_dir(),
            supervisor: SupervisorConfig::default(),
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Process supervisor timings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct SupervisorConfig {
    /// A running process silent for longer than this is considered stuck.
    pub stuck_threshold_secs: u64,

    /// Period of the per-process health check.
    pub health_check_interval_secs: u64,

    /// Time allowed after a graceful terminate before escalating.
    pub grace_period_ms: u64,

    /// Time allowed after a hard kill before giving up on observing exit.
    pub kill_wait_ms: u64,

    /// Bytes of trailing output kept per process.
    pub output_tail_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: 600,
            health_check_interval_secs: 30,
            grace_period_ms: 5_000,
            kill_wait_ms: 2_000,
            output_tail_bytes: 16 * 1024,
        }
    }
}

/// Agent run settings shared by all CLI backends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum runtime of a run without an explicit timeout.
    pub default_timeout_secs: u64,

    /// Silence after which the idle watchdog reports a heartbeat.
    pub idle_threshold_secs: u64,

    /// How often the idle watchdog checks.
    pub heartbeat_interval_secs: u64,

    /// Transcript size that triggers rotation.
    pub log_max_bytes: u64,

    /// Number of rotated transcripts kept.
    pub log_backups: usize,

    /// Override for the backend executable (path or name on PATH).
    pub command: Option<PathBuf>,

    /// Model identifier per capability tier.
    pub models: TierModels,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3_600,
            idle_threshold_secs: 120,
            heartbeat_interval_secs: 30,
            log_max_bytes: 5 * 1024 * 1024,
            log_backups: 3,
            command: None,
            models: TierModels::default(),
        }
    }
}

/// Model identifiers for each capability tier. Empty means backend default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default, TS)]
#[serde(default)]
pub struct TierModels {
    pub low: String,
    pub mid: String,
    pub high: String,
}

/// Retry behavior for backends fronting network-dependent CLIs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before retry N is `base_delay_ms * N`.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 5_000,
        }
    }
}

/// Named agent slots per role.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct PoolConfig {
    pub roles: BTreeMap<String, Vec<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            DEFAULT_ROLE.to_string(),
            DEFAULT_AGENT_NAMES.iter().map(|s| s.to_string()).collect(),
        );
        Self { roles }
    }
}

/// Workflow engine limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of loop-back transitions per workflow.
    pub max_loop_iterations: u32,

    /// Characters of prior raw output quoted in a continuation prompt.
    pub continuation_tail_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 3,
            continuation_tail_chars: 2_000,
        }
    }
}

fn default_backend() -> String {
    "cursor".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".apc/state")
}
