//! Typed payloads carried inside [`super::Envelope`]s.
//!
//! Plain data records, produced and consumed only by the [`super::Handler`]
//! and its callers. The transport layers never look inside them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One known agent, as reported by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Stable catalog id (e.g. `claude-code`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Installed version, if detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Latest version known to the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    /// Whether the agent is currently installed.
    pub installed: bool,
    /// Install method (e.g. `npm`, `brew`), if installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_method: Option<String>,
}

/// Request payload for `get_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAgentRequest {
    /// Catalog id of the agent to fetch.
    pub agent_id: String,
}

/// Request payload for `install_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallAgentRequest {
    /// Catalog id of the agent to install.
    pub agent_id: String,
    /// Preferred install method; the helper picks one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Install system-wide rather than per-user.
    #[serde(default)]
    pub global: bool,
}

/// Request payload for `update_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAgentRequest {
    /// Catalog id of the agent to update.
    pub agent_id: String,
}

/// Request payload for `uninstall_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallAgentRequest {
    /// Catalog id of the agent to remove.
    pub agent_id: String,
}

/// Response payload for `list_agents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAgentsResponse {
    /// All agents known to the helper.
    pub agents: Vec<AgentInfo>,
}

/// Response payload for `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the helper considers itself running.
    pub running: bool,
    /// Helper process id.
    pub pid: u32,
    /// Seconds since the helper started.
    pub uptime_seconds: u64,
    /// Number of agents in the helper's table.
    pub agent_count: usize,
    /// Number of agents with a known newer version.
    pub updates_available: usize,
    /// When the catalog was last refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_refresh: Option<DateTime<Utc>>,
    /// When updates were last checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_check: Option<DateTime<Utc>>,
}

/// Payload of an `error` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. `handler_error`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Payload of a `progress` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressResponse {
    /// Current stage (e.g. `downloading`).
    pub stage: String,
    /// Completion percentage, 0-100.
    pub percent: u8,
    /// Optional detail line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response payload for `check_updates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckUpdatesResponse {
    /// One entry per agent with an available update.
    pub updates: Vec<UpdateAvailableNotification>,
}

/// Payload of an `update_available` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAvailableNotification {
    /// Agent with the available update.
    pub agent_id: String,
    /// Currently installed version, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    /// Version available in the catalog.
    pub latest_version: String,
}

/// Payload of the `agent_installed`, `agent_updated`, and `agent_removed`
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEventNotification {
    /// Agent the event concerns.
    pub agent_id: String,
    /// Version after the event, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}
