use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::{AgentConfig, Settings, TeamConfig};

/// All resolved paths under the Tinyclaw home directory
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.tinyclaw or local .tinyclaw/)
    pub tinyclaw_home: PathBuf,
    pub queue_incoming: PathBuf,
    pub queue_processing: PathBuf,
    pub queue_outgoing: PathBuf,
    pub queue_dead_letter: PathBuf,
    pub log_file: PathBuf,
    pub settings_file: PathBuf,
    pub events_dir: PathBuf,
    pub chats_dir: PathBuf,
    /// Global conversation reset flag
    pub reset_flag: PathBuf,
}

impl Paths {
    /// Resolve the Tinyclaw home directory:
    /// 1. TINYCLAW_HOME env var
    /// 2. local .tinyclaw/ if it has settings.json
    /// 3. ~/.tinyclaw/
    pub fn resolve(base_dir: &Path) -> Self {
        let tinyclaw_home = if let Ok(env_home) = std::env::var("TINYCLAW_HOME") {
            PathBuf::from(env_home)
        } else {
            let local = base_dir.join(".tinyclaw");
            if local.join("settings.json").exists() {
                local
            } else {
                dirs_home().join(".tinyclaw")
            }
        };

        Self::from_home(tinyclaw_home)
    }

    /// Build the path set for an explicit home directory.
    pub fn from_home(tinyclaw_home: PathBuf) -> Self {
        Self {
            queue_incoming: tinyclaw_home.join("queue/incoming"),
            queue_processing: tinyclaw_home.join("queue/processing"),
            queue_outgoing: tinyclaw_home.join("queue/outgoing"),
            queue_dead_letter: tinyclaw_home.join("queue/dead-letter"),
            log_file: tinyclaw_home.join("logs/queue.log"),
            settings_file: tinyclaw_home.join("settings.json"),
            events_dir: tinyclaw_home.join("events"),
            chats_dir: tinyclaw_home.join("chats"),
            reset_flag: tinyclaw_home.join("reset_flag"),
            tinyclaw_home,
        }
    }

    /// Ensure all four queue directories exist
    pub fn ensure_queue_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.queue_incoming)
            .context("Failed to create incoming queue dir")?;
        std::fs::create_dir_all(&self.queue_processing)
            .context("Failed to create processing queue dir")?;
        std::fs::create_dir_all(&self.queue_outgoing)
            .context("Failed to create outgoing queue dir")?;
        std::fs::create_dir_all(&self.queue_dead_letter)
            .context("Failed to create dead-letter queue dir")?;
        Ok(())
    }
}

/// Get user home directory
fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Load and parse settings.json
pub fn get_settings(settings_file: &Path) -> Result<Settings> {
    if !settings_file.exists() {
        return Ok(Settings::default());
    }

    let data =
        std::fs::read_to_string(settings_file).context("Failed to read settings.json")?;

    let settings: Settings = match serde_json::from_str(&data) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[WARN] settings.json contains invalid JSON: {}", e);
            eprintln!("[ERROR] Could not parse settings.json — returning empty config");
            return Ok(Settings::default());
        }
    };

    Ok(settings)
}

/// Build the default agent config from the models section.
/// Used when no agents are configured.
pub fn get_default_agent_from_models(settings: &Settings) -> AgentConfig {
    let provider = settings
        .models
        .as_ref()
        .and_then(|m| m.provider.clone())
        .unwrap_or_else(|| "anthropic".to_string());

    let model = match provider.as_str() {
        "openai" => settings
            .models
            .as_ref()
            .and_then(|m| m.openai.as_ref())
            .and_then(|o| o.model.clone())
            .unwrap_or_else(|| "gpt-5.3-codex".to_string()),
        _ => settings
            .models
            .as_ref()
            .and_then(|m| m.anthropic.as_ref())
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| "sonnet".to_string()),
    };

    AgentConfig {
        name: "Default".to_string(),
        provider,
        model,
        working_directory: "default".to_string(),
        sandbox_mode: None,
    }
}

/// Get all configured agents. Falls back to a single "default" agent
/// derived from the models section if no agents are configured.
pub fn get_agents(settings: &Settings) -> HashMap<String, AgentConfig> {
    if let Some(ref agents) = settings.agents {
        if !agents.is_empty() {
            return agents.clone();
        }
    }
    let mut map = HashMap::new();
    map.insert("default".to_string(), get_default_agent_from_models(settings));
    map
}

/// Get all configured teams.
pub fn get_teams(settings: &Settings) -> HashMap<String, TeamConfig> {
    settings.teams.clone().unwrap_or_default()
}

/// Get the workspace path from settings, with default fallback.
pub fn get_workspace_path(settings: &Settings) -> PathBuf {
    settings
        .workspace
        .as_ref()
        .and_then(|w| w.path.as_ref())
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs_home().join("tinyclaw-workspace"))
}
