//! Conversation reset flags.
//!
//! Two flags control whether an agent starts a fresh conversation: a global
//! `reset_flag` at the Tinyclaw home and a per-agent `reset_flag` inside the
//! agent's workspace directory. Flags are consumed (deleted) when read.

use std::path::{Path, PathBuf};

/// Reset flag path for a specific agent.
pub fn agent_reset_flag(agent_id: &str, workspace_path: &Path) -> PathBuf {
    workspace_path.join(agent_id).join("reset_flag")
}

/// Resolve whether the next invocation should reset the conversation,
/// consuming any flag found. The global flag only participates when
/// `honor_global` is set — the first step of a chain honors it, subsequent
/// steps only look at their own agent flag.
pub fn resolve_should_reset(
    global_flag: &Path,
    agent_id: &str,
    workspace_path: &Path,
    honor_global: bool,
) -> bool {
    let mut reset = false;

    if honor_global && global_flag.exists() {
        reset = true;
        let _ = std::fs::remove_file(global_flag);
    }

    let agent_flag = agent_reset_flag(agent_id, workspace_path);
    if agent_flag.exists() {
        reset = true;
        let _ = std::fs::remove_file(&agent_flag);
    }

    reset
}
