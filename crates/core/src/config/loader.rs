//! Configuration file loader for the `.apc/` directory structure.
//!
//! - `config.toml`: global settings
//! - `roles/*.md`: role definitions with YAML front matter
//! - `workflows/*.yaml`: workflow definitions

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::ApcConfig;
use apc_protocol::agent_models::RoleConfig;
use apc_protocol::config_models::GlobalConfig;
use apc_protocol::workflow_models::WorkflowDefinition;
use gray_matter::engine::YAML;
use gray_matter::Matter;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Name of the project configuration directory.
pub const CONFIG_DIR: &str = ".apc";

/// Loads all configuration from `<root>/.apc/`.
///
/// Missing directories and files yield defaults; files that exist but do not
/// parse are errors naming the offending path.
pub async fn load_config(root: &Path) -> ConfigResult<ApcConfig> {
    let apc_dir = root.join(CONFIG_DIR);
    if !apc_dir.exists() {
        debug!(root = %root.display(), "No .apc directory, using defaults");
        return Ok(ApcConfig::default());
    }

    let global = load_global_config(&apc_dir)?;
    let roles = load_roles(&apc_dir)?;
    let workflows = load_workflows(&apc_dir)?;
    debug!(
        roles = roles.len(),
        workflows = workflows.len(),
        backend = %global.backend,
        "Loaded configuration"
    );

    Ok(ApcConfig {
        global,
        roles,
        workflows,
    })
}

fn load_global_config(apc_dir: &Path) -> ConfigResult<GlobalConfig> {
    let config_path = apc_dir.join("config.toml");
    if !config_path.exists() {
        return Ok(GlobalConfig::default());
    }

    let content = read(&config_path)?;
    toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
        path: config_path,
        source,
    })
}

fn load_roles(apc_dir: &Path) -> ConfigResult<Vec<RoleConfig>> {
    let mut roles = Vec::new();
    let mut seen = HashSet::new();

    for path in files_with_extension(&apc_dir.join("roles"), &["md"])? {
        let content = read(&path)?;
        let matter = Matter::<YAML>::new();
        let result = matter.parse(&content);

        let mut role: RoleConfig = result
            .data
            .ok_or_else(|| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: "Missing YAML front matter".to_string(),
            })?
            .deserialize()
            .map_err(|e| ConfigError::MarkdownParse {
                path: path.clone(),
                reason: format!("Failed to deserialize front matter: {e}"),
            })?;
        role.prompt_template = result.content.trim().to_string();

        if !seen.insert(role.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "role",
                name: role.name,
                path,
            });
        }
        roles.push(role);
    }

    Ok(roles)
}

fn load_workflows(apc_dir: &Path) -> ConfigResult<Vec<WorkflowDefinition>> {
    let mut workflows = Vec::new();
    let mut seen = HashSet::new();

    for path in files_with_extension(&apc_dir.join("workflows"), &["yaml", "yml"])? {
        let content = read(&path)?;
        let workflow: WorkflowDefinition =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
                path: path.clone(),
                source,
            })?;
        validate_workflow(&workflow, &path)?;

        if !seen.insert(workflow.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "workflow",
                name: workflow.name,
                path,
            });
        }
        workflows.push(workflow);
    }

    Ok(workflows)
}

/// Phases need unique names, and loop-back targets must exist.
fn validate_workflow(workflow: &WorkflowDefinition, path: &Path) -> ConfigResult<()> {
    let invalid = |reason: String| ConfigError::InvalidConfig {
        path: path.to_path_buf(),
        reason,
    };

    if workflow.phases.is_empty() {
        return Err(invalid(format!("workflow '{}' has no phases", workflow.name)));
    }
    let mut names = HashSet::new();
    for phase in &workflow.phases {
        if !names.insert(phase.name.as_str()) {
            return Err(invalid(format!("duplicate phase '{}'", phase.name)));
        }
    }
    for phase in &workflow.phases {
        if let Some(target) = &phase.loop_back_to {
            if !names.contains(target.as_str()) {
                return Err(invalid(format!(
                    "phase '{}' loops back to unknown phase '{target}'",
                    phase.name
                )));
            }
        }
    }
    Ok(())
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Files directly inside `dir` with one of `extensions`, sorted by path.
fn files_with_extension(dir: &Path, extensions: &[&str]) -> ConfigResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| ConfigError::DirectoryWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if matches && entry.file_type().is_file() {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}
