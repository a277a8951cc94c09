use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::sandbox::redact_secrets;

/// Log a message to console and append to the log file.
/// API key values are redacted before the line is written anywhere.
pub fn log(level: &str, message: &str, log_file: &Path) {
    let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let log_message = format!("[{}] [{}] {}", timestamp, level, redact_secrets(message));
    println!("{}", log_message);

    if let Some(dir) = log_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(log_file) {
        let _ = writeln!(f, "{}", log_message);
    }
}

/// Append a structured event to the daily event file under events_dir.
/// Shares the log sanitizer; best-effort, never breaks the caller.
pub fn emit_event(event_type: &str, data: serde_json::Value, events_dir: &Path) {
    let _ = (|| -> Result<(), Box<dyn std::error::Error>> {
        std::fs::create_dir_all(events_dir)?;

        let mut event = data;
        if let Some(obj) = event.as_object_mut() {
            obj.insert("type".to_string(), serde_json::json!(event_type));
            obj.insert("timestamp".to_string(), serde_json::json!(now_millis()));
        }

        let line = redact_secrets(&serde_json::to_string(&event)?);
        let file = events_dir.join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let mut f = OpenOptions::new().create(true).append(true).open(file)?;
        writeln!(f, "{}", line)?;
        Ok(())
    })();
}

/// Window for suppressing repeated heartbeat errors.
const HEARTBEAT_DEDUP_WINDOW_MS: u64 = 60_000;
/// Heartbeat errors are keyed by their first 160 chars.
const HEARTBEAT_DEDUP_KEY_CHARS: usize = 160;

static HEARTBEAT_ERRORS: Lazy<Mutex<HashMap<String, u64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Whether a heartbeat-channel error should be logged, deduplicating
/// repeats of the same message within a 60 second window.
pub fn should_log_heartbeat_error(message: &str) -> bool {
    should_log_heartbeat_error_at(message, now_millis())
}

fn should_log_heartbeat_error_at(message: &str, now: u64) -> bool {
    let key: String = message.chars().take(HEARTBEAT_DEDUP_KEY_CHARS).collect();
    let mut seen = HEARTBEAT_ERRORS.lock().unwrap_or_else(|e| e.into_inner());
    match seen.get(&key) {
        Some(&last) if now.saturating_sub(last) < HEARTBEAT_DEDUP_WINDOW_MS => false,
        _ => {
            seen.insert(key, now);
            true
        }
    }
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
    use tempfile::TempDir;

    #[test]
    fn test_log_creates_file() {
        let tmp = TempDir::new().unwrap();
        let log_file = tmp.path().join("logs/test.log");

        log("INFO", "test message", &log_file);
        assert!(log_file.exists());

        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(content.contains("[INFO]"));
        assert!(content.contains("test message"));
    }

    #[test]
    fn test_log_appends() {
        let tmp = TempDir::new().unwrap();
        let log_file = tmp.path().join("test.log");

        log("INFO", "first", &log_file);
        log("WARN", "second", &log_file);

        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_log_redacts_secrets() {
        let tmp = TempDir::new().unwrap();
        let log_file = tmp.path().join("test.log");

        log("ERROR", "spawn env ANTHROPIC_API_KEY=sk-ant-oops failed", &log_file);

        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(!content.contains("sk-ant-oops"));
        assert!(content.contains("[REDACTED]"));
    }

    #[test]
    fn test_emit_event_appends_jsonl() {
        let tmp = TempDir::new().unwrap();
        let events_dir = tmp.path().join("events");

        emit_event("processor_start", serde_json::json!({"agents": ["a"]}), &events_dir);
        emit_event("response_ready", serde_json::json!({"channel": "telegram"}), &events_dir);

        let files: Vec<_> = std::fs::read_dir(&events_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].file_name().to_string_lossy().ends_with(".jsonl"));

        let content = std::fs::read_to_string(files[0].path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "processor_start");
        assert!(first["timestamp"].is_number());
    }

    #[test]
    fn test_heartbeat_dedup_window() {
        let msg = "heartbeat test failure: unique-alpha";
        assert!(should_log_heartbeat_error_at(msg, 1_000));
        assert!(!should_log_heartbeat_error_at(msg, 30_000));
        assert!(should_log_heartbeat_error_at(msg, 62_000));
    }

    #[test]
    fn test_heartbeat_dedup_keyed_by_prefix() {
        let long_a = format!("{}{}", "b".repeat(160), "tail-one");
        let long_b = format!("{}{}", "b".repeat(160), "tail-two");
        assert!(should_log_heartbeat_error_at(&long_a, 1_000));
        // same first 160 chars, still inside the window
        assert!(!should_log_heartbeat_error_at(&long_b, 2_000));
    }
}
