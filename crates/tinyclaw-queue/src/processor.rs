//! The queue processor: a 1 Hz poll over incoming/, per-agent FIFO workers,
//! and the retry / dead-letter discipline around each message.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

use tinyclaw_core::config::{get_agents, get_settings, get_teams, get_workspace_path, Paths};
use tinyclaw_core::logging::{emit_event, log, should_log_heartbeat_error};
use tinyclaw_core::reset::resolve_should_reset;
use tinyclaw_core::routing::{find_team_for_agent, parse_routing};
use tinyclaw_core::sandbox::{redact_secrets, ErrorClass, SandboxConfig, SandboxError};
use tinyclaw_core::types::{
    AgentConfig, ChainStep, DeadLetterRecord, MessageData, ResponseData, TeamContext,
};

use crate::chain::{aggregate_steps, assemble_response, run_team_chain, save_chat_history};
use crate::invoke::{invoke_agent, InvokeCtx, InvokePermits};
use crate::store;

const GENERIC_FAILURE_REPLY: &str =
    "Sorry, I encountered an error processing your request. Please check the queue logs.";

/// Resolve a routed agent id to a configured agent. Unknown targets fall
/// back to "default"; when no agent with that id is configured, the
/// alphabetically-first agent stands in. None only when no agents exist.
///
/// Both the peek classification and message processing go through this, so
/// the per-agent FIFO worker key always equals the invoked agent.
pub fn resolve_target_agent(
    agent_id: &str,
    agents: &HashMap<String, AgentConfig>,
) -> Option<String> {
    if agents.contains_key(agent_id) {
        return Some(agent_id.to_string());
    }
    if agents.contains_key("default") {
        return Some("default".to_string());
    }
    let mut ids: Vec<&String> = agents.keys().collect();
    ids.sort();
    ids.first().map(|id| (*id).clone())
}

/// Peek at a message file to determine which agent it's routed to,
/// without claiming it.
pub fn peek_agent_id(file_path: &Path, paths: &Paths) -> String {
    let result: Result<String, Box<dyn std::error::Error>> = (|| {
        let raw = std::fs::read_to_string(file_path)?;
        let message_data: MessageData = serde_json::from_str(&raw)?;

        let settings = get_settings(&paths.settings_file)?;
        let agents = get_agents(&settings);
        let teams = get_teams(&settings);

        // Pre-routed agent wins
        if let Some(ref agent) = message_data.agent {
            if agents.contains_key(agent) {
                return Ok(agent.clone());
            }
        }

        let routing = parse_routing(&message_data.message, &agents, &teams);
        // The "error" sentinel never invokes, so any key will do
        if routing.agent_id == "error" {
            return Ok(routing.agent_id);
        }
        Ok(resolve_target_agent(&routing.agent_id, &agents)
            .unwrap_or_else(|| "default".to_string()))
    })();

    result.unwrap_or_else(|_| "default".to_string())
}

/// Process a single claimed message end to end.
async fn process_message_inner(
    name: &str,
    paths: &Arc<Paths>,
    permits: &Arc<InvokePermits>,
) -> Result<()> {
    let processing_file = store::claim(paths, name)?;

    let raw = std::fs::read_to_string(&processing_file)?;
    let mut message_data: MessageData = match serde_json::from_str(&raw) {
        Ok(m) => m,
        Err(e) => {
            // No parseable payload means no attempt counter to honor
            let settings = get_settings(&paths.settings_file).unwrap_or_default();
            let sandbox = SandboxConfig::from_settings(settings.sandbox.as_ref());
            let record = DeadLetterRecord {
                failed_at: chrono::Utc::now().to_rfc3339(),
                error_class: ErrorClass::Terminal.as_str().to_string(),
                error_message: format!("Unparseable queue file: {}", e),
                attempt: 1,
                max_attempts: sandbox.max_attempts,
                payload: serde_json::Value::String(raw),
            };
            store::deadletter(paths, name, &record)?;
            log(
                "ERROR",
                &format!("Dead-lettered unparseable queue file: {}", name),
                &paths.log_file,
            );
            return Ok(());
        }
    };

    if message_data.first_seen_at == 0 {
        message_data.first_seen_at = now_millis();
        store::write_atomic(
            &processing_file,
            &serde_json::to_string_pretty(&message_data)?,
        )?;
    }

    let channel = message_data.channel.clone();
    let sender = message_data.sender.clone();
    let raw_message = message_data.message.clone();
    let message_id = message_data.message_id.clone();

    let preview: String = raw_message.chars().take(50).collect();
    log(
        "INFO",
        &format!("Processing [{}] from {}: {}...", channel, sender, preview),
        &paths.log_file,
    );
    let msg_preview: String = raw_message.chars().take(120).collect();
    emit_event(
        "message_received",
        serde_json::json!({
            "channel": channel,
            "sender": sender,
            "message": msg_preview,
            "messageId": message_id,
        }),
        &paths.events_dir,
    );

    let settings = get_settings(&paths.settings_file)?;
    let agents = get_agents(&settings);
    let teams = get_teams(&settings);
    let workspace_path = get_workspace_path(&settings);
    let sandbox = SandboxConfig::from_settings(settings.sandbox.as_ref());

    // Route: a known pre-routed agent bypasses prefix parsing
    let routing = match message_data.agent.as_ref() {
        Some(pre_routed) if agents.contains_key(pre_routed) => {
            tinyclaw_core::types::RoutingResult {
                agent_id: pre_routed.clone(),
                message: raw_message.clone(),
                is_team: false,
            }
        }
        _ => parse_routing(&raw_message, &agents, &teams),
    };

    // Multi-target prefix: reply directly, invoke nothing
    if routing.agent_id == "error" {
        let response = ResponseData {
            channel: channel.clone(),
            sender: sender.clone(),
            message: routing.message,
            original_message: raw_message,
            timestamp: now_millis(),
            message_id: message_id.clone(),
            agent: None,
            files: None,
        };
        store::write_response(paths, &response)?;
        emit_event(
            "response_ready",
            serde_json::json!({
                "channel": channel,
                "sender": sender,
                "responseLength": response.message.len(),
                "messageId": message_id,
            }),
            &paths.events_dir,
        );
        store::complete(paths, name)?;
        return Ok(());
    }

    let Some(agent_id) = resolve_target_agent(&routing.agent_id, &agents) else {
        anyhow::bail!("No agents configured");
    };
    // A fallback target answers the original text, not a stripped prefix
    let mut message = if agent_id == routing.agent_id {
        routing.message
    } else {
        raw_message.clone()
    };

    let agent = agents[&agent_id].clone();
    log(
        "INFO",
        &format!(
            "Routing to agent: {} ({}) [{}/{}]",
            agent.name, agent_id, agent.provider, agent.model
        ),
        &paths.log_file,
    );
    emit_event(
        "agent_routed",
        serde_json::json!({
            "agentId": agent_id,
            "agentName": agent.name,
            "provider": agent.provider,
            "model": agent.model,
            "isTeamRouted": routing.is_team,
        }),
        &paths.events_dir,
    );

    // Inbound attachments ride along in the prompt
    if let Some(files) = message_data.files.as_ref().filter(|f| !f.is_empty()) {
        message = format!("{}\n\n[Attached files: {}]", message, files.join(", "));
    }

    // Team context: a team-alias route anchors on the alias's own team,
    // otherwise the agent's first team applies
    let team_context: Option<TeamContext> = if routing.is_team {
        let mut ctx = None;
        let mut team_ids: Vec<&String> = teams.keys().collect();
        team_ids.sort();
        for tid in team_ids {
            let t = &teams[tid];
            if t.leader_agent == agent_id && t.agents.contains(&agent_id) {
                ctx = Some(TeamContext {
                    team_id: tid.clone(),
                    team: t.clone(),
                });
                break;
            }
        }
        ctx.or_else(|| find_team_for_agent(&agent_id, &teams))
    } else {
        find_team_for_agent(&agent_id, &teams)
    };

    let ctx = InvokeCtx {
        paths: Arc::clone(paths),
        workspace_path: workspace_path.clone(),
        sandbox,
        permits: Arc::clone(permits),
        agents: Arc::new(agents.clone()),
        teams: Arc::new(teams.clone()),
    };

    let (steps, mappings) = match &team_context {
        None => {
            // Single-agent path: one invocation, raw response is the reply
            emit_event(
                "chain_step_start",
                serde_json::json!({ "agentId": agent_id }),
                &paths.events_dir,
            );
            let should_reset =
                resolve_should_reset(&paths.reset_flag, &agent_id, &workspace_path, true);
            let (response, mappings) =
                invoke_agent(&ctx, &agent_id, &message, should_reset).await?;
            emit_event(
                "chain_step_done",
                serde_json::json!({
                    "agentId": agent_id,
                    "responseLength": response.len(),
                }),
                &paths.events_dir,
            );
            (
                vec![ChainStep {
                    agent_id: agent_id.clone(),
                    response,
                }],
                mappings,
            )
        }
        Some(tc) => {
            emit_event(
                "team_chain_start",
                serde_json::json!({
                    "teamId": tc.team_id,
                    "teamName": tc.team.name,
                    "agents": tc.team.agents,
                    "leader": tc.team.leader_agent,
                }),
                &paths.events_dir,
            );
            let outcome = run_team_chain(&ctx, tc, &agent_id, &message).await?;
            emit_event(
                "team_chain_end",
                serde_json::json!({
                    "teamId": tc.team_id,
                    "totalSteps": outcome.steps.len(),
                    "agents": outcome
                        .steps
                        .iter()
                        .map(|s| s.agent_id.as_str())
                        .collect::<Vec<_>>(),
                }),
                &paths.events_dir,
            );
            save_chat_history(
                tc,
                &raw_message,
                &channel,
                &sender,
                &outcome.steps,
                &agents,
                &paths.chats_dir,
                &paths.log_file,
            );
            (outcome.steps, outcome.path_mappings)
        }
    };

    let aggregated = aggregate_steps(&steps);
    let assembled = assemble_response(&aggregated, &mappings);
    let final_agent = steps.last().map(|s| s.agent_id.clone());

    let response_data = ResponseData {
        channel: channel.clone(),
        sender: sender.clone(),
        message: assembled.message,
        original_message: raw_message,
        timestamp: now_millis(),
        message_id: message_id.clone(),
        agent: final_agent.clone(),
        files: if assembled.files.is_empty() {
            None
        } else {
            Some(assembled.files)
        },
    };
    store::write_response(paths, &response_data)?;

    log(
        "INFO",
        &format!(
            "Response ready [{}] {} via agent:{} ({} chars)",
            channel,
            sender,
            final_agent.as_deref().unwrap_or("?"),
            response_data.message.len()
        ),
        &paths.log_file,
    );
    emit_event(
        "response_ready",
        serde_json::json!({
            "channel": channel,
            "sender": sender,
            "agentId": final_agent,
            "responseLength": response_data.message.len(),
            "messageId": message_id,
        }),
        &paths.events_dir,
    );

    store::complete(paths, name)?;
    Ok(())
}

/// Process a message with the retry / dead-letter discipline around it.
pub async fn process_message(name: String, paths: Arc<Paths>, permits: Arc<InvokePermits>) {
    if let Err(e) = process_message_inner(&name, &paths, &permits).await {
        handle_processing_failure(&name, &e, &paths);
    }
}

/// Classify a processing failure and either requeue the message or write a
/// dead-letter record plus a user-visible reply.
fn handle_processing_failure(name: &str, error: &anyhow::Error, paths: &Paths) {
    let sandbox_error = error.downcast_ref::<SandboxError>();
    let class = sandbox_error
        .map(|se| se.classification())
        .unwrap_or(ErrorClass::Transient);
    let sanitized = redact_secrets(&format!("{:#}", error));

    let processing_file = paths.queue_processing.join(name);
    let parsed: Option<MessageData> = std::fs::read_to_string(&processing_file)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());

    let Some(mut msg) = parsed else {
        // Claim failed or the file was already finalized; the incoming copy,
        // if any, is picked up on the next tick
        log(
            "ERROR",
            &format!("Processing error for {}: {}", name, sanitized),
            &paths.log_file,
        );
        return;
    };

    let settings = get_settings(&paths.settings_file).unwrap_or_default();
    let max_attempts = SandboxConfig::from_settings(settings.sandbox.as_ref()).max_attempts;

    let should_log = msg.channel != "heartbeat" || should_log_heartbeat_error(&sanitized);

    if class == ErrorClass::Transient && msg.attempt + 1 < max_attempts {
        msg.attempt += 1;
        msg.error_class = Some(class.as_str().to_string());
        match store::requeue(paths, name, &msg) {
            Ok(_) => {
                if should_log {
                    log(
                        "WARN",
                        &format!(
                            "Transient failure for {} (attempt {}/{}), requeued: {}",
                            name, msg.attempt, max_attempts, sanitized
                        ),
                        &paths.log_file,
                    );
                }
            }
            Err(e) => {
                log(
                    "ERROR",
                    &format!("Failed to requeue {}: {}", name, e),
                    &paths.log_file,
                );
            }
        }
        return;
    }

    // Terminal, or retries exhausted
    let attempt = msg.attempt + 1;
    let record = DeadLetterRecord {
        failed_at: chrono::Utc::now().to_rfc3339(),
        error_class: class.as_str().to_string(),
        error_message: sanitized.clone(),
        attempt,
        max_attempts,
        payload: serde_json::to_value(&msg).unwrap_or(serde_json::Value::Null),
    };
    if let Err(e) = store::deadletter(paths, name, &record) {
        log(
            "ERROR",
            &format!("Failed to dead-letter {}: {}", name, e),
            &paths.log_file,
        );
    }
    if should_log {
        log(
            "ERROR",
            &format!(
                "Dead-lettered {} ({}): {}",
                name,
                class.as_str(),
                sanitized
            ),
            &paths.log_file,
        );
    }

    // The sender still gets an answer
    let user_message = sandbox_error
        .map(|se| se.user_message().to_string())
        .unwrap_or_else(|| GENERIC_FAILURE_REPLY.to_string());
    let response = ResponseData {
        channel: msg.channel.clone(),
        sender: msg.sender.clone(),
        message: user_message,
        original_message: msg.message.clone(),
        timestamp: now_millis(),
        message_id: msg.message_id.clone(),
        agent: msg.agent.clone(),
        files: None,
    };
    match store::write_response(paths, &response) {
        Ok(_) => {
            emit_event(
                "response_ready",
                serde_json::json!({
                    "channel": response.channel,
                    "sender": response.sender,
                    "responseLength": response.message.len(),
                    "messageId": response.message_id,
                }),
                &paths.events_dir,
            );
        }
        Err(e) => {
            log(
                "ERROR",
                &format!("Failed to write failure reply for {}: {}", name, e),
                &paths.log_file,
            );
        }
    }
}

/// Log the current agent and team configuration.
pub fn log_agent_config(paths: &Paths) {
    let settings = match get_settings(&paths.settings_file) {
        Ok(s) => s,
        Err(_) => return,
    };
    let agents = get_agents(&settings);
    let teams = get_teams(&settings);

    log(
        "INFO",
        &format!("Loaded {} agent(s):", agents.len()),
        &paths.log_file,
    );
    for (id, agent) in &agents {
        log(
            "INFO",
            &format!(
                "  {}: {} [{}/{}] cwd={}",
                id, agent.name, agent.provider, agent.model, agent.working_directory
            ),
            &paths.log_file,
        );
    }

    if !teams.is_empty() {
        log(
            "INFO",
            &format!("Loaded {} team(s):", teams.len()),
            &paths.log_file,
        );
        for (id, team) in &teams {
            log(
                "INFO",
                &format!(
                    "  {}: {} [agents: {}] leader={}",
                    id,
                    team.name,
                    team.agents.join(", "),
                    team.leader_agent
                ),
                &paths.log_file,
            );
        }
    }
}

/// Main queue processor loop.
/// Uses one mpsc channel per agent id so messages for the same agent run
/// strictly sequentially while different agents run in parallel.
pub async fn run_queue_processor(paths: Arc<Paths>) -> Result<()> {
    paths.ensure_queue_dirs()?;
    let _ = std::fs::create_dir_all(&paths.events_dir);
    if let Some(dir) = paths.log_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }

    log("INFO", "Queue processor started", &paths.log_file);
    store::recover_orphaned(&paths);
    log(
        "INFO",
        &format!("Watching: {}", paths.queue_incoming.display()),
        &paths.log_file,
    );
    log_agent_config(&paths);

    let settings = get_settings(&paths.settings_file).unwrap_or_default();
    let sandbox = SandboxConfig::from_settings(settings.sandbox.as_ref());
    let permits = Arc::new(InvokePermits::new(sandbox.max_concurrency));

    {
        let agents = get_agents(&settings);
        let teams = get_teams(&settings);
        emit_event(
            "processor_start",
            serde_json::json!({
                "agents": agents.keys().collect::<Vec<_>>(),
                "teams": teams.keys().collect::<Vec<_>>(),
            }),
            &paths.events_dir,
        );
    }

    let agent_senders: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    // Prevents double-enqueue of a file across poll ticks
    let queued_files: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let files = store::list_incoming(&paths.queue_incoming);
                if files.is_empty() {
                    continue;
                }

                log(
                    "DEBUG",
                    &format!("Found {} message(s) in queue", files.len()),
                    &paths.log_file,
                );

                for file in files {
                    {
                        let mut queued = queued_files.lock().await;
                        if queued.contains(&file.name) {
                            continue;
                        }
                        queued.insert(file.name.clone());
                    }

                    let target_agent_id = peek_agent_id(&file.path, &paths);

                    let sender = {
                        let mut senders = agent_senders.lock().await;
                        if let Some(tx) = senders.get(&target_agent_id) {
                            tx.clone()
                        } else {
                            let (tx, mut rx) = mpsc::channel::<String>(100);
                            let paths_clone = Arc::clone(&paths);
                            let permits_clone = Arc::clone(&permits);
                            let queued_clone = Arc::clone(&queued_files);

                            // Dedicated worker task draining this agent's queue
                            tokio::spawn(async move {
                                while let Some(name) = rx.recv().await {
                                    process_message(
                                        name.clone(),
                                        Arc::clone(&paths_clone),
                                        Arc::clone(&permits_clone),
                                    )
                                    .await;
                                    queued_clone.lock().await.remove(&name);
                                }
                            });

                            senders.insert(target_agent_id.clone(), tx.clone());
                            tx
                        }
                    };

                    if let Err(e) = sender.send(file.name.clone()).await {
                        log(
                            "ERROR",
                            &format!(
                                "Failed to queue message for agent {}: {}",
                                target_agent_id, e
                            ),
                            &paths.log_file,
                        );
                        queued_files.lock().await.remove(&file.name);
                    }
                }
            }
            _ = &mut shutdown => {
                // In-flight files stay in processing/ for recovery on restart
                log("INFO", "Shutting down queue processor...", &paths.log_file);
                break;
            }
        }
    }

    Ok(())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyclaw_core::routing::MULTI_TARGET_REPLY;
    use tempfile::TempDir;

    fn test_paths() -> (TempDir, Arc<Paths>) {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().join(".tinyclaw"));
        paths.ensure_queue_dirs().unwrap();
        (tmp, Arc::new(paths))
    }

    fn write_settings(paths: &Paths, content: &str) {
        std::fs::write(&paths.settings_file, content).unwrap();
    }

    fn two_agent_settings() -> &'static str {
        r#"{
            "agents": {
                "alpha": {
                    "name": "Alpha",
                    "provider": "anthropic",
                    "model": "sonnet",
                    "working_directory": "alpha"
                },
                "beta": {
                    "name": "Beta",
                    "provider": "openai",
                    "model": "gpt-5.3-codex",
                    "working_directory": "beta"
                }
            }
        }"#
    }

    fn sample_message(id: &str, text: &str) -> MessageData {
        MessageData {
            channel: "telegram".to_string(),
            sender: "alice".to_string(),
            sender_id: None,
            message: text.to_string(),
            timestamp: 1_700_000_000_000,
            message_id: id.to_string(),
            agent: None,
            files: None,
            attempt: 0,
            first_seen_at: 0,
            error_class: None,
        }
    }

    fn drop_incoming(paths: &Paths, name: &str, msg: &MessageData) {
        let json = serde_json::to_string_pretty(msg).unwrap();
        std::fs::write(paths.queue_incoming.join(name), json).unwrap();
    }

    fn outgoing_files(paths: &Paths) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(&paths.queue_outgoing)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect()
    }

    fn dead_letter_files(paths: &Paths) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(&paths.queue_dead_letter)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect()
    }

    #[test]
    fn test_peek_agent_id_prefers_pre_route() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());

        let mut msg = sample_message("m1", "@alpha hello");
        msg.agent = Some("beta".to_string());
        drop_incoming(&paths, "m1.json", &msg);

        let id = peek_agent_id(&paths.queue_incoming.join("m1.json"), &paths);
        assert_eq!(id, "beta");
    }

    #[test]
    fn test_peek_agent_id_parses_prefix() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(&paths, "m1.json", &sample_message("m1", "@alpha hello"));

        let id = peek_agent_id(&paths.queue_incoming.join("m1.json"), &paths);
        assert_eq!(id, "alpha");
    }

    #[test]
    fn test_resolve_target_agent() {
        let settings = get_settings(Path::new("/nonexistent/settings.json")).unwrap();
        let empty = std::collections::HashMap::new();
        assert!(resolve_target_agent("anything", &empty).is_none());

        // the synthesized "default" agent resolves to itself
        let agents = get_agents(&settings);
        assert_eq!(
            resolve_target_agent("default", &agents).as_deref(),
            Some("default")
        );

        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        let agents = get_agents(&get_settings(&paths.settings_file).unwrap());
        assert_eq!(
            resolve_target_agent("beta", &agents).as_deref(),
            Some("beta")
        );
        // no "default" agent configured: the alphabetically-first stands in
        assert_eq!(
            resolve_target_agent("default", &agents).as_deref(),
            Some("alpha")
        );
        assert_eq!(
            resolve_target_agent("nobody", &agents).as_deref(),
            Some("alpha")
        );
    }

    #[test]
    fn test_unrouted_peek_key_matches_invoked_agent() {
        // multi-agent config without an agent literally named "default"
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(&paths, "m1.json", &sample_message("m1", "hello"));

        let peeked = peek_agent_id(&paths.queue_incoming.join("m1.json"), &paths);

        let settings = get_settings(&paths.settings_file).unwrap();
        let agents = get_agents(&settings);
        let teams = get_teams(&settings);
        let routing = parse_routing("hello", &agents, &teams);
        let invoked = resolve_target_agent(&routing.agent_id, &agents).unwrap();

        // same worker key and invocation target, so per-agent FIFO holds
        assert_eq!(peeked, invoked);
        assert_eq!(peeked, "alpha");
    }

    #[test]
    fn test_peek_agent_id_defaults_on_garbage() {
        let (_tmp, paths) = test_paths();
        std::fs::write(paths.queue_incoming.join("m1.json"), "not json").unwrap();
        let id = peek_agent_id(&paths.queue_incoming.join("m1.json"), &paths);
        assert_eq!(id, "default");
    }

    #[tokio::test]
    async fn test_multi_target_prefix_replies_without_invoking() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(
            &paths,
            "m1.json",
            &sample_message("m1", "@alpha @beta fix everything"),
        );

        let permits = Arc::new(InvokePermits::new(0));
        process_message("m1.json".to_string(), Arc::clone(&paths), permits).await;

        // one response, queue fully drained
        let outgoing = outgoing_files(&paths);
        assert_eq!(outgoing.len(), 1);
        let raw = std::fs::read_to_string(&outgoing[0]).unwrap();
        let resp: ResponseData = serde_json::from_str(&raw).unwrap();
        assert_eq!(resp.message, MULTI_TARGET_REPLY);
        assert!(resp.agent.is_none());

        assert!(!paths.queue_processing.join("m1.json").exists());
        assert!(!paths.queue_incoming.join("m1.json").exists());
        assert!(dead_letter_files(&paths).is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_file_dead_letters() {
        let (_tmp, paths) = test_paths();
        std::fs::write(paths.queue_incoming.join("bad.json"), "{ not json").unwrap();

        let permits = Arc::new(InvokePermits::new(0));
        process_message("bad.json".to_string(), Arc::clone(&paths), permits).await;

        let dls = dead_letter_files(&paths);
        assert_eq!(dls.len(), 1);
        let record: DeadLetterRecord =
            serde_json::from_str(&std::fs::read_to_string(&dls[0]).unwrap()).unwrap();
        assert_eq!(record.error_class, "terminal");
        assert!(record.attempt >= 1);
        assert!(!paths.queue_processing.join("bad.json").exists());
    }

    #[tokio::test]
    async fn test_container_preflight_failure_is_terminal_end_to_end() {
        let (_tmp, paths) = test_paths();
        // openai agent in docker mode, but the allowlist only carries the
        // anthropic key: preflight fails terminally before any spawn
        write_settings(
            &paths,
            r#"{
                "agents": {
                    "beta": {
                        "name": "Beta",
                        "provider": "openai",
                        "model": "gpt-5.3-codex",
                        "working_directory": "beta"
                    }
                },
                "workspace": { "path": "WORKSPACE" },
                "sandbox": {
                    "mode": "docker",
                    "env_allowlist": ["ANTHROPIC_API_KEY"]
                }
            }"#
            .replace(
                "WORKSPACE",
                &paths.tinyclaw_home.join("ws").to_string_lossy(),
            )
            .as_str(),
        );
        drop_incoming(&paths, "m1.json", &sample_message("m1", "@beta hello"));

        let permits = Arc::new(InvokePermits::new(0));
        process_message("m1.json".to_string(), Arc::clone(&paths), permits).await;

        // no retry: straight to dead-letter plus a user-visible reply
        let dls = dead_letter_files(&paths);
        assert_eq!(dls.len(), 1);
        let record: DeadLetterRecord =
            serde_json::from_str(&std::fs::read_to_string(&dls[0]).unwrap()).unwrap();
        assert_eq!(record.error_class, "terminal");
        assert_eq!(record.attempt, 1);

        let outgoing = outgoing_files(&paths);
        assert_eq!(outgoing.len(), 1);
        let resp: ResponseData =
            serde_json::from_str(&std::fs::read_to_string(&outgoing[0]).unwrap()).unwrap();
        assert!(resp.message.contains("API key"));

        assert!(!paths.queue_incoming.join("m1.json").exists());
        assert!(!paths.queue_processing.join("m1.json").exists());
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_attempt() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(&paths, "m1.json", &sample_message("m1", "hello"));
        store::claim(&paths, "m1.json").unwrap();

        let err: anyhow::Error =
            SandboxError::transient("temporary network failure", "Please try again.").into();
        handle_processing_failure("m1.json", &err, &paths);

        let raw = std::fs::read_to_string(paths.queue_incoming.join("m1.json")).unwrap();
        let msg: MessageData = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.attempt, 1);
        assert_eq!(msg.error_class.as_deref(), Some("transient"));
        assert!(dead_letter_files(&paths).is_empty());
        assert!(outgoing_files(&paths).is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_with_reply() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        let mut msg = sample_message("m1", "hello");
        msg.attempt = 2; // default max_attempts is 3
        drop_incoming(&paths, "m1.json", &msg);
        store::claim(&paths, "m1.json").unwrap();

        let err: anyhow::Error =
            SandboxError::transient("still failing", "The agent keeps failing.").into();
        handle_processing_failure("m1.json", &err, &paths);

        let dls = dead_letter_files(&paths);
        assert_eq!(dls.len(), 1);
        let record: DeadLetterRecord =
            serde_json::from_str(&std::fs::read_to_string(&dls[0]).unwrap()).unwrap();
        assert_eq!(record.error_class, "transient");
        assert_eq!(record.attempt, 3);
        assert_eq!(record.max_attempts, 3);

        let outgoing = outgoing_files(&paths);
        assert_eq!(outgoing.len(), 1);
        let resp: ResponseData =
            serde_json::from_str(&std::fs::read_to_string(&outgoing[0]).unwrap()).unwrap();
        assert_eq!(resp.message, "The agent keeps failing.");
        assert!(!paths.queue_incoming.join("m1.json").exists());
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retry() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(&paths, "m1.json", &sample_message("m1", "hello"));
        store::claim(&paths, "m1.json").unwrap();

        let err: anyhow::Error = SandboxError::terminal(
            "docker: invalid reference format",
            None,
            "The sandbox rejected the agent invocation.",
        )
        .into();
        handle_processing_failure("m1.json", &err, &paths);

        let dls = dead_letter_files(&paths);
        assert_eq!(dls.len(), 1);
        let record: DeadLetterRecord =
            serde_json::from_str(&std::fs::read_to_string(&dls[0]).unwrap()).unwrap();
        assert_eq!(record.error_class, "terminal");
        assert_eq!(record.attempt, 1);
        assert!(!paths.queue_incoming.join("m1.json").exists());
    }

    #[tokio::test]
    async fn test_failure_messages_are_redacted() {
        let (_tmp, paths) = test_paths();
        write_settings(&paths, two_agent_settings());
        drop_incoming(&paths, "m1.json", &sample_message("m1", "hello"));
        store::claim(&paths, "m1.json").unwrap();

        let err = anyhow::anyhow!("spawn failed: OPENAI_API_KEY=sk-live-secret env rejected");
        handle_processing_failure("m1.json", &err, &paths);

        let raw = std::fs::read_to_string(paths.queue_incoming.join("m1.json")).unwrap();
        assert!(!raw.contains("sk-live-secret"));
        let logs = std::fs::read_to_string(&paths.log_file).unwrap();
        assert!(!logs.contains("sk-live-secret"));
    }
}
