use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Agent configuration from settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Provider: "anthropic" or "openai"
    pub provider: String,
    /// Model shortname or full ID (e.g. "sonnet", "gpt-5.3-codex")
    pub model: String,
    /// Absolute path, or relative to the workspace directory
    pub working_directory: String,
    /// Per-agent sandbox mode override: "host", "docker", or "apple"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
}

/// Team configuration from settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: String,
}

/// A single agent response in a team chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub response: String,
}

/// Root settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<HashMap<String, AgentConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teams: Option<HashMap<String, TeamConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Provider: "anthropic" or "openai"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic: Option<ProviderModelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai: Option<ProviderModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Raw sandbox section of settings.json. Defaults are merged in by
/// `sandbox::SandboxConfig::from_settings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// 0 means unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_allowlist: Option<Vec<String>>,
    /// "mapped" or "same-path"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_mapping_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apple: Option<AppleSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppleSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_command: Option<String>,
}

/// Queue message format — written as JSON to incoming/processing directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub channel: String,
    pub sender: String,
    #[serde(rename = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub message: String,
    pub timestamp: u64,
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// Pre-routed agent id from channel client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    /// Retry counter, incremented on each requeue
    #[serde(default)]
    pub attempt: u32,
    /// Epoch ms when the processor first claimed this message (0 = not yet)
    #[serde(rename = "firstSeenAt", default)]
    pub first_seen_at: u64,
    /// "transient" or "terminal", set when the last attempt failed
    #[serde(rename = "errorClass", skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

/// Outgoing response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub channel: String,
    pub sender: String,
    pub message: String,
    #[serde(rename = "originalMessage")]
    pub original_message: String,
    pub timestamp: u64,
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// Which agent handled this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Absolute host paths, deduplicated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Durable record of a message that exhausted retries or failed terminally.
/// Never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// ISO 8601
    #[serde(rename = "failedAt")]
    pub failed_at: String,
    #[serde(rename = "errorClass")]
    pub error_class: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    pub attempt: u32,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    pub payload: serde_json::Value,
}

/// Metadata for a file in the queue directory
#[derive(Debug, Clone)]
pub struct QueueFile {
    pub name: String,
    pub path: std::path::PathBuf,
    /// Modified time in milliseconds since epoch
    pub time: u64,
}

/// Routing result from parse_routing
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub agent_id: String,
    pub message: String,
    pub is_team: bool,
}

/// Teammate mention extracted from an agent response
#[derive(Debug, Clone)]
pub struct TeammateMention {
    pub teammate_id: String,
    pub message: String,
}

/// Team context resolved for a message
#[derive(Debug, Clone)]
pub struct TeamContext {
    pub team_id: String,
    pub team: TeamConfig,
}
