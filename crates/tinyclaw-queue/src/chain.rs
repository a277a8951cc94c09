//! Team chains, fan-out, and response assembly.
//!
//! A chain starts at the routed agent and follows teammate mentions: one
//! mention hands the conversation to that teammate, several mentions fan out
//! concurrently for a single round. Steps are aggregated into one reply.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use regex::Regex;

use tinyclaw_core::logging::{emit_event, log};
use tinyclaw_core::reset::resolve_should_reset;
use tinyclaw_core::routing::extract_teammate_mentions;
use tinyclaw_core::sandbox::PathMapping;
use tinyclaw_core::types::{AgentConfig, ChainStep, TeamContext};

use crate::invoke::{invoke_agent, InvokeCtx};

/// Hard ceiling on the final reply length.
pub const RESPONSE_LIMIT: usize = 4000;
/// Where an over-long reply is cut before the marker is appended.
pub const TRUNCATED_LENGTH: usize = 3900;
pub const TRUNCATION_MARKER: &str = "[Response truncated...]";
/// Ceiling on chain steps per message so two agents cannot volley forever.
pub const MAX_CHAIN_STEPS: usize = 50;

/// Everything a finished chain produced.
pub struct ChainOutcome {
    pub steps: Vec<ChainStep>,
    /// Union of the path mappings from every invocation in this chain.
    pub path_mappings: Vec<PathMapping>,
}

/// The message a teammate receives on handoff.
pub fn handoff_message(from_agent: &str, payload: &str) -> String {
    format!("[Message from teammate @{}]:\n{}", from_agent, payload)
}

/// Run a team chain starting at `initial_agent_id`.
///
/// Sequential handoffs follow single mentions; a multi-mention runs all
/// mentioned teammates concurrently and then stops — mentions produced by
/// fan-out responses are ignored.
pub async fn run_team_chain(
    ctx: &InvokeCtx,
    team_ctx: &TeamContext,
    initial_agent_id: &str,
    initial_message: &str,
) -> Result<ChainOutcome> {
    let mut steps: Vec<ChainStep> = Vec::new();
    let mut mappings: Vec<PathMapping> = Vec::new();

    let mut current_agent = initial_agent_id.to_string();
    let mut current_message = initial_message.to_string();
    let mut first_step = true;

    loop {
        emit_event(
            "chain_step_start",
            serde_json::json!({
                "agentId": current_agent,
                "teamId": team_ctx.team_id,
            }),
            &ctx.paths.events_dir,
        );

        // Only the first step honors the global reset flag
        let should_reset = resolve_should_reset(
            &ctx.paths.reset_flag,
            &current_agent,
            &ctx.workspace_path,
            first_step,
        );
        first_step = false;

        let (response, run_mappings) =
            invoke_agent(ctx, &current_agent, &current_message, should_reset).await?;
        merge_mappings(&mut mappings, run_mappings);
        steps.push(ChainStep {
            agent_id: current_agent.clone(),
            response: response.clone(),
        });
        emit_event(
            "chain_step_done",
            serde_json::json!({
                "agentId": current_agent,
                "teamId": team_ctx.team_id,
                "responseLength": response.len(),
            }),
            &ctx.paths.events_dir,
        );

        if steps.len() >= MAX_CHAIN_STEPS {
            log(
                "WARN",
                &format!(
                    "Chain for team {} hit {} steps, stopping",
                    team_ctx.team_id, MAX_CHAIN_STEPS
                ),
                &ctx.paths.log_file,
            );
            break;
        }

        let mentions = extract_teammate_mentions(
            &response,
            &current_agent,
            &team_ctx.team_id,
            &ctx.teams,
            &ctx.agents,
        );

        if mentions.is_empty() {
            break;
        }

        if mentions.len() == 1 {
            let mention = &mentions[0];
            log(
                "INFO",
                &format!("@{} -> @{} (handoff)", current_agent, mention.teammate_id),
                &ctx.paths.log_file,
            );
            emit_event(
                "chain_handoff",
                serde_json::json!({
                    "teamId": team_ctx.team_id,
                    "fromAgent": current_agent,
                    "toAgent": mention.teammate_id,
                }),
                &ctx.paths.events_dir,
            );
            current_message = handoff_message(&current_agent, &mention.message);
            current_agent = mention.teammate_id.clone();
            continue;
        }

        // Fan-out: one concurrent round, then stop
        let mut handles = Vec::new();
        for mention in &mentions {
            log(
                "INFO",
                &format!(
                    "@{} -> @{} (fan-out)",
                    current_agent, mention.teammate_id
                ),
                &ctx.paths.log_file,
            );
            emit_event(
                "chain_handoff",
                serde_json::json!({
                    "teamId": team_ctx.team_id,
                    "fromAgent": current_agent,
                    "toAgent": mention.teammate_id,
                }),
                &ctx.paths.events_dir,
            );
            emit_event(
                "chain_step_start",
                serde_json::json!({
                    "agentId": mention.teammate_id,
                    "teamId": team_ctx.team_id,
                }),
                &ctx.paths.events_dir,
            );

            let task_ctx = ctx.clone();
            let teammate = mention.teammate_id.clone();
            let message = handoff_message(&current_agent, &mention.message);
            handles.push((
                mention.teammate_id.clone(),
                tokio::spawn(async move {
                    let should_reset = resolve_should_reset(
                        &task_ctx.paths.reset_flag,
                        &teammate,
                        &task_ctx.workspace_path,
                        false,
                    );
                    invoke_agent(&task_ctx, &teammate, &message, should_reset).await
                }),
            ));
        }

        for (teammate, handle) in handles {
            let (response, run_mappings) = handle
                .await
                .map_err(|e| anyhow::anyhow!("Fan-out task for @{} failed: {}", teammate, e))??;
            merge_mappings(&mut mappings, run_mappings);
            emit_event(
                "chain_step_done",
                serde_json::json!({
                    "agentId": teammate,
                    "teamId": team_ctx.team_id,
                    "responseLength": response.len(),
                }),
                &ctx.paths.events_dir,
            );
            steps.push(ChainStep {
                agent_id: teammate,
                response,
            });
        }
        break;
    }

    Ok(ChainOutcome {
        steps,
        path_mappings: mappings,
    })
}

fn merge_mappings(into: &mut Vec<PathMapping>, from: Vec<PathMapping>) {
    for m in from {
        if !into.contains(&m) {
            into.push(m);
        }
    }
}

/// Aggregate chain steps into one reply. A single step passes through; more
/// are labeled and joined in step order.
pub fn aggregate_steps(steps: &[ChainStep]) -> String {
    if steps.len() == 1 {
        return steps[0].response.trim().to_string();
    }
    steps
        .iter()
        .map(|step| format!("@{}: {}", step.agent_id, step.response.trim()))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// The final reply and its attachments, ready for the outgoing queue.
pub struct AssembledResponse {
    pub message: String,
    pub files: Vec<String>,
}

/// Resolve `[send_file:]` tags against the chain's path mappings, strip the
/// tags, append a warning for unresolved paths, and cap the length.
pub fn assemble_response(aggregated: &str, mappings: &[PathMapping]) -> AssembledResponse {
    let (mut clean, files, missing) = resolve_outbound_files(aggregated, mappings);
    if !missing.is_empty() {
        clean.push_str(&missing_files_warning(&missing));
    }
    AssembledResponse {
        message: cap_response_length(&clean),
        files,
    }
}

/// Scan `[send_file: path]` tags and resolve each to a host path: the path
/// as-is when it exists on the host, otherwise rewritten through the first
/// mapping whose container prefix matches on a path separator boundary.
/// Resolved paths are deduplicated; unresolved ones are reported back.
pub fn resolve_outbound_files(
    text: &str,
    mappings: &[PathMapping],
) -> (String, Vec<String>, Vec<String>) {
    let tag_re = Regex::new(r"\[send_file:\s*([^\]]+)\]").unwrap();
    let mut resolved: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();

    for caps in tag_re.captures_iter(text) {
        let raw = caps[1].trim().to_string();
        match resolve_path(&raw, mappings) {
            Some(host) => {
                if !resolved.contains(&host) {
                    resolved.push(host);
                }
            }
            None => {
                if !missing.contains(&raw) {
                    missing.push(raw);
                }
            }
        }
    }

    let clean = tag_re.replace_all(text, "").trim().to_string();
    (clean, resolved, missing)
}

fn resolve_path(raw: &str, mappings: &[PathMapping]) -> Option<String> {
    let as_is = Path::new(raw);
    if as_is.is_absolute() && as_is.exists() {
        return Some(raw.to_string());
    }

    for mapping in mappings {
        let Some(rest) = raw.strip_prefix(&mapping.container_prefix) else {
            continue;
        };
        if !rest.is_empty() && !rest.starts_with('/') {
            continue;
        }
        let host = format!("{}{}", mapping.host_prefix, rest);
        if Path::new(&host).exists() {
            return Some(host);
        }
    }

    None
}

fn missing_files_warning(missing: &[String]) -> String {
    let shown: Vec<&str> = missing.iter().take(3).map(|s| s.as_str()).collect();
    format!("\n\n[Could not find attachment(s): {}]", shown.join(", "))
}

/// Trim, then truncate over-long replies with an explicit marker.
pub fn cap_response_length(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= RESPONSE_LIMIT {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(TRUNCATED_LENGTH).collect();
    format!("{}\n\n{}", head.trim_end(), TRUNCATION_MARKER)
}

/// Append the chain transcript to the team's chat history directory.
pub fn save_chat_history(
    team_ctx: &TeamContext,
    original_message: &str,
    channel: &str,
    sender: &str,
    steps: &[ChainStep],
    agents: &HashMap<String, AgentConfig>,
    chats_dir: &Path,
    log_file: &Path,
) {
    let result: Result<(), Box<dyn std::error::Error>> = (|| {
        let team_chats_dir = chats_dir.join(&team_ctx.team_id);
        std::fs::create_dir_all(&team_chats_dir)?;

        let now = chrono::Utc::now();
        let mut lines = Vec::new();
        lines.push(format!(
            "# Team Conversation: {} (@{})",
            team_ctx.team.name, team_ctx.team_id
        ));
        lines.push(format!("**Date:** {}", now.to_rfc3339()));
        lines.push(format!("**Channel:** {} | **Sender:** {}", channel, sender));
        lines.push(format!("**Steps:** {}", steps.len()));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
        lines.push("## User Message".to_string());
        lines.push(String::new());
        lines.push(original_message.to_string());
        lines.push(String::new());

        for step in steps {
            let step_label = if let Some(agent) = agents.get(&step.agent_id) {
                format!("{} (@{})", agent.name, step.agent_id)
            } else {
                format!("@{}", step.agent_id)
            };
            lines.push("---".to_string());
            lines.push(String::new());
            lines.push(format!("## {}", step_label));
            lines.push(String::new());
            lines.push(step.response.clone());
            lines.push(String::new());
        }

        let file_name = format!("{}.md", now.format("%Y-%m-%dT%H-%M-%S-%3fZ"));
        std::fs::write(team_chats_dir.join(file_name), lines.join("\n"))?;
        log("INFO", "Chat history saved", log_file);
        Ok(())
    })();

    if let Err(e) = result {
        log(
            "ERROR",
            &format!("Failed to save chat history: {}", e),
            log_file,
        );
    }
}
