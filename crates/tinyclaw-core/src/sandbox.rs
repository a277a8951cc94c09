//! Sandbox configuration and failure taxonomy.
//!
//! The normalized [`SandboxConfig`] is the single source of truth for the
//! runner and invoker: every default from settings.json is merged here so
//! downstream code never reasons about missing fields.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::types::SandboxSettings;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ENV_ALLOWLIST: [&str; 2] = ["ANTHROPIC_API_KEY", "OPENAI_API_KEY"];

/// Sandbox configuration with all defaults merged in.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// "host", "docker", or "apple"
    pub mode: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    /// 0 = unbounded. Applies only when the effective mode is not host.
    pub max_concurrency: usize,
    pub env_allowlist: Vec<String>,
    /// "mapped" or "same-path"
    pub path_mapping_mode: String,
    pub docker: DockerConfig,
    pub apple: AppleConfig,
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub network: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

#[derive(Debug, Clone)]
pub struct AppleConfig {
    pub image: String,
    pub network: String,
    pub memory: String,
    pub cpus: String,
    pub runtime_command: String,
}

impl SandboxConfig {
    /// Merge the raw settings section with defaults.
    pub fn from_settings(raw: Option<&SandboxSettings>) -> Self {
        let empty = SandboxSettings::default();
        let raw = raw.unwrap_or(&empty);

        let docker = raw.docker.clone().unwrap_or_default();
        let apple = raw.apple.clone().unwrap_or_default();

        Self {
            mode: raw.mode.clone().unwrap_or_else(|| "host".to_string()),
            timeout_seconds: raw.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            max_attempts: raw.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            max_concurrency: raw.max_concurrency.unwrap_or(0),
            env_allowlist: raw.env_allowlist.clone().unwrap_or_else(|| {
                DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect()
            }),
            path_mapping_mode: raw
                .path_mapping_mode
                .clone()
                .unwrap_or_else(|| "mapped".to_string()),
            docker: DockerConfig {
                image: docker
                    .image
                    .unwrap_or_else(|| "tinyclaw-sandbox:latest".to_string()),
                network: docker.network.unwrap_or_else(|| "default".to_string()),
                memory: docker.memory.unwrap_or_else(|| "2g".to_string()),
                cpus: docker.cpus.unwrap_or_else(|| "2".to_string()),
                pids_limit: docker.pids_limit.unwrap_or(512),
            },
            apple: AppleConfig {
                image: apple
                    .image
                    .unwrap_or_else(|| "tinyclaw-sandbox:latest".to_string()),
                network: apple.network.unwrap_or_else(|| "default".to_string()),
                memory: apple.memory.unwrap_or_else(|| "2g".to_string()),
                cpus: apple.cpus.unwrap_or_else(|| "2".to_string()),
                runtime_command: apple
                    .runtime_command
                    .unwrap_or_else(|| "container".to_string()),
            },
        }
    }

    /// Effective mode for an agent, honoring the per-agent override.
    pub fn mode_for_agent(&self, agent_override: Option<&str>) -> String {
        agent_override
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .unwrap_or_else(|| self.mode.clone())
    }
}

/// One container-to-host path translation returned by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathMapping {
    pub container_prefix: String,
    pub host_prefix: String,
}

/// Whether a failure can be fixed by retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Terminal,
    Transient,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Terminal => "terminal",
            ErrorClass::Transient => "transient",
        }
    }
}

/// Typed failure from the sandbox runner. Terminal errors go straight to
/// dead-letter; transient ones retry up to max_attempts.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("{reason}")]
    Terminal {
        reason: String,
        remediation: Option<String>,
        user_message: String,
    },
    #[error("{reason}")]
    Transient { reason: String, user_message: String },
}

impl SandboxError {
    pub fn terminal(
        reason: impl Into<String>,
        remediation: Option<String>,
        user_message: impl Into<String>,
    ) -> Self {
        SandboxError::Terminal {
            reason: redact_secrets(&reason.into()),
            remediation,
            user_message: redact_secrets(&user_message.into()),
        }
    }

    pub fn transient(reason: impl Into<String>, user_message: impl Into<String>) -> Self {
        SandboxError::Transient {
            reason: redact_secrets(&reason.into()),
            user_message: redact_secrets(&user_message.into()),
        }
    }

    pub fn classification(&self) -> ErrorClass {
        match self {
            SandboxError::Terminal { .. } => ErrorClass::Terminal,
            SandboxError::Transient { .. } => ErrorClass::Transient,
        }
    }

    pub fn user_message(&self) -> &str {
        match self {
            SandboxError::Terminal { user_message, .. } => user_message,
            SandboxError::Transient { user_message, .. } => user_message,
        }
    }

    pub fn remediation(&self) -> Option<&str> {
        match self {
            SandboxError::Terminal { remediation, .. } => remediation.as_deref(),
            SandboxError::Transient { .. } => None,
        }
    }
}

/// Stderr signatures of container failures that no retry can fix.
const TERMINAL_STDERR_PATTERNS: [&str; 7] = [
    "unknown flag",
    "no such file or directory",
    "not found",
    "invalid argument",
    "for \"--mount\" flag",
    "invalid reference format",
    "permission denied",
];

/// Classify a non-zero container exit by its stderr.
pub fn classify_container_stderr(stderr: &str) -> ErrorClass {
    let lower = stderr.to_lowercase();
    if TERMINAL_STDERR_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClass::Terminal
    } else {
        ErrorClass::Transient
    }
}

/// The env key a provider cannot run without.
pub fn required_env_key(provider: &str) -> &'static str {
    match provider {
        "openai" => "OPENAI_API_KEY",
        _ => "ANTHROPIC_API_KEY",
    }
}

static SECRET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(ANTHROPIC_API_KEY|OPENAI_API_KEY)=\S+").unwrap());

/// Redact API key values from any text headed for logs, events, or
/// user-visible errors.
pub fn redact_secrets(text: &str) -> String {
    SECRET_RE.replace_all(text, "${1}=[REDACTED]").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DockerSettings;

    #[test]
    fn test_defaults_merged() {
        let cfg = SandboxConfig::from_settings(None);
        assert_eq!(cfg.mode, "host");
        assert_eq!(cfg.timeout_seconds, 600);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.max_concurrency, 0);
        assert_eq!(
            cfg.env_allowlist,
            vec!["ANTHROPIC_API_KEY", "OPENAI_API_KEY"]
        );
        assert_eq!(cfg.path_mapping_mode, "mapped");
        assert_eq!(cfg.docker.network, "default");
        assert_eq!(cfg.docker.pids_limit, 512);
        assert_eq!(cfg.apple.runtime_command, "container");
    }

    #[test]
    fn test_partial_settings_override() {
        let raw = SandboxSettings {
            mode: Some("docker".to_string()),
            timeout_seconds: Some(30),
            docker: Some(DockerSettings {
                image: Some("custom:1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = SandboxConfig::from_settings(Some(&raw));
        assert_eq!(cfg.mode, "docker");
        assert_eq!(cfg.timeout_seconds, 30);
        assert_eq!(cfg.docker.image, "custom:1");
        // untouched fields keep defaults
        assert_eq!(cfg.docker.memory, "2g");
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn test_mode_for_agent_override() {
        let cfg = SandboxConfig::from_settings(None);
        assert_eq!(cfg.mode_for_agent(None), "host");
        assert_eq!(cfg.mode_for_agent(Some("docker")), "docker");
        assert_eq!(cfg.mode_for_agent(Some("")), "host");
    }

    #[test]
    fn test_classify_terminal_patterns() {
        assert_eq!(
            classify_container_stderr("docker: invalid reference format."),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify_container_stderr("Error: unknown flag: --bogus"),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify_container_stderr("mkdir /data: Permission Denied"),
            ErrorClass::Terminal
        );
        assert_eq!(
            classify_container_stderr("invalid argument \"x\" for \"--memory\" flag"),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_classify_transient_otherwise() {
        assert_eq!(
            classify_container_stderr("temporary network failure"),
            ErrorClass::Transient
        );
        assert_eq!(classify_container_stderr(""), ErrorClass::Transient);
    }

    #[test]
    fn test_required_env_key() {
        assert_eq!(required_env_key("openai"), "OPENAI_API_KEY");
        assert_eq!(required_env_key("anthropic"), "ANTHROPIC_API_KEY");
        assert_eq!(required_env_key(""), "ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_redact_secrets() {
        let line = "spawn failed: --env ANTHROPIC_API_KEY=sk-ant-secret123 --env OPENAI_API_KEY=sk-oai";
        let clean = redact_secrets(line);
        assert!(!clean.contains("sk-ant-secret123"));
        assert!(!clean.contains("sk-oai"));
        assert!(clean.contains("ANTHROPIC_API_KEY=[REDACTED]"));
        assert!(clean.contains("OPENAI_API_KEY=[REDACTED]"));
    }

    #[test]
    fn test_redact_leaves_other_text() {
        assert_eq!(redact_secrets("plain error"), "plain error");
    }

    #[test]
    fn test_sandbox_error_classification() {
        let t = SandboxError::terminal("bad image", None, "The sandbox image is invalid.");
        assert_eq!(t.classification(), ErrorClass::Terminal);
        let r = SandboxError::transient("timeout", "The agent took too long.");
        assert_eq!(r.classification(), ErrorClass::Transient);
        assert_eq!(r.user_message(), "The agent took too long.");
    }

    #[test]
    fn test_sandbox_error_redacts_on_construction() {
        let e = SandboxError::transient("exit 1: OPENAI_API_KEY=sk-live-xyz rejected", "oops");
        assert!(!e.to_string().contains("sk-live-xyz"));
    }
}
