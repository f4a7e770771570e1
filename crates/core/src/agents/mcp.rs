//! MCP server registration in an agent CLI's JSON configuration.
//!
//! Both supported CLIs keep their servers in a top-level `mcpServers` map.
//! Unrelated keys in the file are preserved.

use crate::agents::base::AgentError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

const SERVERS_KEY: &str = "mcpServers";

/// One MCP server entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct McpServer {
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

async fn read_config(path: &Path) -> Result<Map<String, Value>, AgentError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(AgentError::Mcp(format!("{}: {e}", path.display()))),
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AgentError::Mcp(format!(
            "{} is not a JSON object",
            path.display()
        ))),
        Err(e) => Err(AgentError::Mcp(format!("{}: {e}", path.display()))),
    }
}

async fn write_config(path: &Path, config: &Map<String, Value>) -> Result<(), AgentError> {
    let io_err = |e: std::io::Error| AgentError::Mcp(format!("{}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut text = serde_json::to_string_pretty(config)
        .map_err(|e| AgentError::Mcp(e.to_string()))?;
    text.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)
}

/// Add or replace a server entry.
pub async fn install_server(path: &Path, server: &McpServer) -> Result<(), AgentError> {
    let mut config = read_config(path).await?;
    let entry = serde_json::to_value(server).map_err(|e| AgentError::Mcp(e.to_string()))?;
    let servers = config
        .entry(SERVERS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(servers) = servers else {
        return Err(AgentError::Mcp(format!(
            "{SERVERS_KEY} in {} is not an object",
            path.display()
        )));
    };
    servers.insert(server.name.clone(), entry);
    write_config(path, &config).await
}

/// Remove a server entry. Returns whether it existed.
pub async fn remove_server(path: &Path, name: &str) -> Result<bool, AgentError> {
    let mut config = read_config(path).await?;
    let removed = config
        .get_mut(SERVERS_KEY)
        .and_then(Value::as_object_mut)
        .and_then(|servers| servers.remove(name))
        .is_some();
    if removed {
        write_config(path, &config).await?;
    }
    Ok(removed)
}

/// Whether a server entry is present.
pub async fn is_configured(path: &Path, name: &str) -> bool {
    read_config(path)
        .await
        .ok()
        .and_then(|config| {
            config
                .get(SERVERS_KEY)
                .and_then(Value::as_object)
                .map(|servers| servers.contains_key(name))
        })
        .unwrap_or(false)
}
