use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Claude (Anthropic) model ID mappings
pub static CLAUDE_MODEL_IDS: Lazy<HashMap<&str, &str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("sonnet", "claude-sonnet-4-5");
    m.insert("opus", "claude-opus-4-6");
    m.insert("claude-sonnet-4-5", "claude-sonnet-4-5");
    m.insert("claude-opus-4-6", "claude-opus-4-6");
    m
});

/// Codex (OpenAI) model ID mappings
pub static CODEX_MODEL_IDS: Lazy<HashMap<&str, &str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("gpt-5.2", "gpt-5.2");
    m.insert("gpt-5.3-codex", "gpt-5.3-codex");
    m
});

/// Resolve the model ID for Claude (Anthropic).
/// Falls back to the raw model string if no mapping found.
pub fn resolve_claude_model(model: &str) -> String {
    CLAUDE_MODEL_IDS
        .get(model)
        .map(|s| s.to_string())
        .unwrap_or_else(|| model.to_string())
}

/// Resolve the model ID for Codex (OpenAI).
/// Falls back to the raw model string if no mapping found.
pub fn resolve_codex_model(model: &str) -> String {
    CODEX_MODEL_IDS
        .get(model)
        .map(|s| s.to_string())
        .unwrap_or_else(|| model.to_string())
}
