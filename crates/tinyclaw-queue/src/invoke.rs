//! Provider invocation: argv building, output parsing, and the global
//! concurrency permit for container runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use tinyclaw_core::config::Paths;
use tinyclaw_core::logging::{emit_event, log};
use tinyclaw_core::models::{resolve_claude_model, resolve_codex_model};
use tinyclaw_core::routing::find_team_for_agent;
use tinyclaw_core::sandbox::{PathMapping, SandboxConfig};
use tinyclaw_core::types::{AgentConfig, TeamConfig};

use crate::runner::{run_sandboxed, RunRequest};

pub const CODEX_FALLBACK_RESPONSE: &str = "Sorry, I could not generate a response from Codex.";

/// Process-wide permit pool throttling container invocations.
/// Host-mode runs bypass it; max_concurrency 0 means unbounded.
#[derive(Debug)]
pub struct InvokePermits {
    sem: Option<Arc<Semaphore>>,
}

impl InvokePermits {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            sem: if max_concurrency == 0 {
                None
            } else {
                Some(Arc::new(Semaphore::new(max_concurrency)))
            },
        }
    }

    /// Acquire a permit. Returns None when unbounded. Waiters are FIFO.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.sem {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Shared context for invocations. Cheap to clone for fan-out tasks.
#[derive(Clone)]
pub struct InvokeCtx {
    pub paths: Arc<Paths>,
    pub workspace_path: PathBuf,
    pub sandbox: SandboxConfig,
    pub permits: Arc<InvokePermits>,
    pub agents: Arc<HashMap<String, AgentConfig>>,
    pub teams: Arc<HashMap<String, TeamConfig>>,
}

/// Build the provider command and argv.
/// `resume` continues the provider-side conversation; a reset drops it.
pub fn build_provider_argv(
    provider: &str,
    model: &str,
    message: &str,
    resume: bool,
) -> (String, Vec<String>) {
    match provider {
        "openai" => {
            let model_id = resolve_codex_model(model);
            let mut args: Vec<String> = vec!["exec".to_string()];
            if resume {
                args.push("resume".to_string());
                args.push("--last".to_string());
            }
            if !model_id.is_empty() {
                args.push("--model".to_string());
                args.push(model_id);
            }
            args.extend([
                "--skip-git-repo-check".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
                "--json".to_string(),
                message.to_string(),
            ]);
            ("codex".to_string(), args)
        }
        _ => {
            let model_id = resolve_claude_model(model);
            let mut args: Vec<String> = vec!["--dangerously-skip-permissions".to_string()];
            if !model_id.is_empty() {
                args.push("--model".to_string());
                args.push(model_id);
            }
            if resume {
                args.push("-c".to_string());
            }
            args.push("-p".to_string());
            args.push(message.to_string());
            ("claude".to_string(), args)
        }
    }
}

/// Parse Codex NDJSON output — the response is the `text` of the last
/// `item.completed` line carrying an `agent_message`. Unparseable lines are
/// skipped; no match yields a fixed fallback.
pub fn parse_codex_output(raw: &str) -> String {
    let mut response = String::new();
    for line in raw.trim().lines() {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(line) {
            if json.get("type").and_then(|t| t.as_str()) == Some("item.completed") {
                if let Some(item) = json.get("item") {
                    if item.get("type").and_then(|t| t.as_str()) == Some("agent_message") {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            response = text.to_string();
                        }
                    }
                }
            }
        }
    }
    if response.is_empty() {
        CODEX_FALLBACK_RESPONSE.to_string()
    } else {
        response
    }
}

/// Resolve an agent's working directory: absolute as-is, otherwise relative
/// to the workspace; empty falls back to `<workspace>/<agent_id>`.
pub fn resolve_working_dir(
    agent: &AgentConfig,
    agent_id: &str,
    workspace_path: &Path,
) -> PathBuf {
    if agent.working_directory.is_empty() {
        return workspace_path.join(agent_id);
    }
    let wd = PathBuf::from(&agent.working_directory);
    if wd.is_absolute() {
        wd
    } else {
        workspace_path.join(&agent.working_directory)
    }
}

/// Refresh the teammate roster in the agent's directory so the provider can
/// see who it may hand off to. No-op for agents outside any team.
pub fn refresh_teammates_file(
    agent_dir: &Path,
    agent_id: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> std::io::Result<()> {
    let Some(ctx) = find_team_for_agent(agent_id, teams) else {
        return Ok(());
    };

    let mut lines = vec![
        format!("# Teammates ({})", ctx.team.name),
        String::new(),
        "Address a teammate with @id in your reply to hand the conversation over.".to_string(),
        String::new(),
    ];
    for id in &ctx.team.agents {
        if id == agent_id {
            continue;
        }
        if let Some(a) = agents.get(id) {
            lines.push(format!("- @{}: {} ({}/{})", id, a.name, a.provider, a.model));
        }
    }
    lines.push(String::new());

    std::fs::write(agent_dir.join("TEAMMATES.md"), lines.join("\n"))
}

/// Invoke an agent with a message. Returns the parsed response text and the
/// path mappings from this run. Failures carry a `SandboxError` for
/// classification by the orchestrator.
pub async fn invoke_agent(
    ctx: &InvokeCtx,
    agent_id: &str,
    message: &str,
    should_reset: bool,
) -> Result<(String, Vec<PathMapping>)> {
    let agent = ctx
        .agents
        .get(agent_id)
        .ok_or_else(|| anyhow::anyhow!("Unknown agent: {}", agent_id))?;

    let working_dir = resolve_working_dir(agent, agent_id, &ctx.workspace_path);
    std::fs::create_dir_all(&working_dir)?;
    let _ = refresh_teammates_file(&working_dir, agent_id, &ctx.agents, &ctx.teams);

    let provider = if agent.provider.is_empty() {
        "anthropic"
    } else {
        agent.provider.as_str()
    };

    if should_reset {
        log(
            "INFO",
            &format!("Resetting conversation for agent: {}", agent_id),
            &ctx.paths.log_file,
        );
    }

    let (command, args) = build_provider_argv(provider, &agent.model, message, !should_reset);
    let mode = ctx.sandbox.mode_for_agent(agent.sandbox_mode.as_deref());

    // Containers contend for the global permit pool; host runs do not
    let _permit = if mode != "host" {
        ctx.permits.acquire().await
    } else {
        None
    };

    emit_event(
        "sandbox_invocation_start",
        serde_json::json!({
            "agentId": agent_id,
            "provider": provider,
            "mode": mode,
        }),
        &ctx.paths.events_dir,
    );

    let req = RunRequest {
        agent_id,
        provider,
        command: &command,
        args: &args,
        working_dir: &working_dir,
    };

    match run_sandboxed(&req, &ctx.sandbox, &mode).await {
        Ok(output) => {
            emit_event(
                "sandbox_invocation_end",
                serde_json::json!({
                    "agentId": agent_id,
                    "mode": output.mode,
                    "durationMs": output.duration_ms,
                }),
                &ctx.paths.events_dir,
            );
            let response = match provider {
                "openai" => parse_codex_output(&output.stdout),
                _ => output.stdout,
            };
            Ok((response, output.path_mappings))
        }
        Err(e) => {
            emit_event(
                "sandbox_invocation_error",
                serde_json::json!({
                    "agentId": agent_id,
                    "mode": mode,
                    "classification": e.classification().as_str(),
                    "error": e.to_string(),
                }),
                &ctx.paths.events_dir,
            );
            Err(e.into())
        }
    }
}
