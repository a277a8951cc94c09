use std::collections::HashMap;

use regex::Regex;

use crate::types::{AgentConfig, RoutingResult, TeamConfig, TeamContext, TeammateMention};

/// Reply sent when a message @-mentions several targets at once.
pub const MULTI_TARGET_REPLY: &str =
    "Whoa, one at a time! Mention a single @agent (or a team) and I'll get right on it.";

/// Find the first team (by sorted team id) that contains the given agent.
pub fn find_team_for_agent(
    agent_id: &str,
    teams: &HashMap<String, TeamConfig>,
) -> Option<TeamContext> {
    let mut team_ids: Vec<&String> = teams.keys().collect();
    team_ids.sort();
    for team_id in team_ids {
        let team = &teams[team_id];
        if team.agents.iter().any(|a| a == agent_id) {
            return Some(TeamContext {
                team_id: team_id.clone(),
                team: team.clone(),
            });
        }
    }
    None
}

/// Parse the `@agent_id` or `@team_id` prefix from a message.
///
/// Agent ids are checked before team ids; a team id resolves to the team's
/// leader. A leading run of several distinct known targets routes to the
/// sentinel agent "error" with a fixed reply and no invocation. Unknown
/// prefixes and plain messages go to "default" with the text untouched.
pub fn parse_routing(
    raw_message: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> RoutingResult {
    // Scan the leading @-token run for distinct known targets
    let mut known_targets: Vec<String> = Vec::new();
    for token in raw_message.split_whitespace() {
        let Some(id) = token.strip_prefix('@') else {
            break;
        };
        let id = id.to_lowercase();
        if (agents.contains_key(&id) || teams.contains_key(&id)) && !known_targets.contains(&id) {
            known_targets.push(id);
        }
    }
    if known_targets.len() > 1 {
        return RoutingResult {
            agent_id: "error".to_string(),
            message: MULTI_TARGET_REPLY.to_string(),
            is_team: false,
        };
    }

    let prefix_re = Regex::new(r"^@(\S+)\s+([\s\S]*)$").unwrap();
    if let Some(caps) = prefix_re.captures(raw_message) {
        let candidate_id = caps[1].to_lowercase();
        let message = caps[2].trim().to_string();

        // Agent ids win over team ids
        if agents.contains_key(&candidate_id) {
            return RoutingResult {
                agent_id: candidate_id,
                message,
                is_team: false,
            };
        }

        // Team ids resolve to the leader agent
        if let Some(team) = teams.get(&candidate_id) {
            return RoutingResult {
                agent_id: team.leader_agent.clone(),
                message,
                is_team: true,
            };
        }

        // Match by agent display name (case-insensitive)
        for (id, config) in agents {
            if config.name.to_lowercase() == candidate_id {
                return RoutingResult {
                    agent_id: id.clone(),
                    message,
                    is_team: false,
                };
            }
        }

        // Match by team display name (case-insensitive)
        for config in teams.values() {
            if config.name.to_lowercase() == candidate_id {
                return RoutingResult {
                    agent_id: config.leader_agent.clone(),
                    message,
                    is_team: true,
                };
            }
        }
    }

    RoutingResult {
        agent_id: "default".to_string(),
        message: raw_message.to_string(),
        is_team: false,
    }
}

/// Extract teammate mentions from an agent response.
///
/// Any `@id` occurrence where id is a teammate of the current agent counts.
/// Each mention's payload is the response segment between that mention and
/// the next one (or end of text); mentions of the same teammate merge their
/// segments. The payload is always non-empty — when a mention carries no
/// trailing text, the response with mention tokens stripped is used instead.
pub fn extract_teammate_mentions(
    response: &str,
    current_agent_id: &str,
    team_id: &str,
    teams: &HashMap<String, TeamConfig>,
    agents: &HashMap<String, AgentConfig>,
) -> Vec<TeammateMention> {
    let Some(team) = teams.get(team_id) else {
        return Vec::new();
    };

    let mention_re = Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap();

    struct Occurrence {
        id: String,
        end: usize,
    }

    let mut occurrences: Vec<(usize, Occurrence)> = Vec::new();
    for caps in mention_re.captures_iter(response) {
        let m = caps.get(0).unwrap();
        // "user@coder.com" is not a mention
        let preceded_by_word = response[..m.start()]
            .chars()
            .next_back()
            .map(|c| c.is_alphanumeric())
            .unwrap_or(false);
        if preceded_by_word {
            continue;
        }
        let id = caps[1].to_lowercase();
        if id == current_agent_id {
            continue;
        }
        if !team.agents.iter().any(|a| a == &id) {
            continue;
        }
        if !agents.contains_key(&id) {
            continue;
        }
        occurrences.push((m.start(), Occurrence { id, end: m.end() }));
    }

    if occurrences.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<String> = Vec::new();
    let mut texts: HashMap<String, Vec<String>> = HashMap::new();

    for (i, (_, occ)) in occurrences.iter().enumerate() {
        let segment_end = if i + 1 < occurrences.len() {
            occurrences[i + 1].0
        } else {
            response.len()
        };
        let segment = response[occ.end..segment_end]
            .trim()
            .trim_start_matches(|c: char| c == ':' || c == ',' || c == '-')
            .trim();

        if !order.contains(&occ.id) {
            order.push(occ.id.clone());
        }
        if !segment.is_empty() {
            texts
                .entry(occ.id.clone())
                .or_default()
                .push(segment.to_string());
        }
    }

    // Fallback payload for mentions with no trailing text
    let stripped = mention_re.replace_all(response, "").trim().to_string();
    let fallback = if stripped.is_empty() {
        response.trim().to_string()
    } else {
        stripped
    };

    order
        .into_iter()
        .map(|id| {
            let message = texts
                .get(&id)
                .map(|segments| segments.join("\n\n"))
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| fallback.clone());
            TeammateMention {
                teammate_id: id,
                message,
            }
        })
        .collect()
}
