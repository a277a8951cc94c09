//! File-backed queue store. Atomic renames define the state transitions:
//! incoming -> processing on claim, processing -> incoming on requeue,
//! delete on complete, and a durable dead-letter record on terminal failure.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;

use tinyclaw_core::config::Paths;
use tinyclaw_core::logging::log;
use tinyclaw_core::types::{DeadLetterRecord, MessageData, QueueFile, ResponseData};

/// Move orphaned files from processing/ back to incoming/ on startup.
/// This is what makes delivery at-least-once across crashes.
pub fn recover_orphaned(paths: &Paths) {
    let entries = match std::fs::read_dir(&paths.queue_processing) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let dest = paths.queue_incoming.join(entry.file_name());
        match std::fs::rename(&path, &dest) {
            Ok(_) => {
                log(
                    "INFO",
                    &format!(
                        "Recovered orphaned file: {}",
                        entry.file_name().to_string_lossy()
                    ),
                    &paths.log_file,
                );
            }
            Err(e) => {
                log(
                    "ERROR",
                    &format!(
                        "Failed to recover orphaned file {}: {}",
                        entry.file_name().to_string_lossy(),
                        e
                    ),
                    &paths.log_file,
                );
            }
        }
    }
}

/// List JSON files in the incoming queue, sorted by modification time ascending.
pub fn list_incoming(queue_incoming: &Path) -> Vec<QueueFile> {
    let entries = match std::fs::read_dir(queue_incoming) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<QueueFile> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return None;
            }
            let meta = std::fs::metadata(&path).ok()?;
            let time = meta
                .modified()
                .ok()?
                .duration_since(std::time::UNIX_EPOCH)
                .ok()?
                .as_millis() as u64;
            Some(QueueFile {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                time,
            })
        })
        .collect();

    files.sort_by_key(|f| f.time);
    files
}

/// Claim a message: rename incoming/name to processing/name.
/// The rename is atomic on one filesystem, so a file is owned by at most
/// one in-flight invocation.
pub fn claim(paths: &Paths, name: &str) -> Result<PathBuf> {
    let src = paths.queue_incoming.join(name);
    let dest = paths.queue_processing.join(name);
    std::fs::rename(&src, &dest)
        .with_context(|| format!("Failed to claim queue file {}", name))?;
    Ok(dest)
}

/// Delete a successfully processed message from processing/.
pub fn complete(paths: &Paths, name: &str) -> Result<()> {
    std::fs::remove_file(paths.queue_processing.join(name))
        .with_context(|| format!("Failed to remove processed file {}", name))?;
    Ok(())
}

/// Rewrite the processing file with the updated message, then move it back
/// to incoming/ for another attempt.
pub fn requeue(paths: &Paths, name: &str, updated: &MessageData) -> Result<()> {
    let processing = paths.queue_processing.join(name);
    let json = serde_json::to_string_pretty(updated)?;
    write_atomic(&processing, &json)?;
    std::fs::rename(&processing, paths.queue_incoming.join(name))
        .with_context(|| format!("Failed to requeue {}", name))?;
    Ok(())
}

/// Write a dead-letter record for the message and drop the processing file.
/// Dead-letter files are never deleted automatically.
pub fn deadletter(paths: &Paths, name: &str, record: &DeadLetterRecord) -> Result<PathBuf> {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let dest = paths
        .queue_dead_letter
        .join(format!("{}_{}.json", stem, now_millis()));

    let json = serde_json::to_string_pretty(record)?;
    write_atomic(&dest, &json)?;

    let processing = paths.queue_processing.join(name);
    if processing.exists() {
        std::fs::remove_file(&processing)
            .with_context(|| format!("Failed to remove dead-lettered file {}", name))?;
    }
    Ok(dest)
}

/// Write a response into outgoing/. Heartbeat responses are keyed by message
/// id alone; everything else gets a channel and epoch suffix to avoid
/// collisions.
pub fn write_response(paths: &Paths, response: &ResponseData) -> Result<PathBuf> {
    let file = if response.channel == "heartbeat" {
        paths
            .queue_outgoing
            .join(format!("{}.json", response.message_id))
    } else {
        paths.queue_outgoing.join(format!(
            "{}_{}_{}.json",
            response.channel,
            response.message_id,
            now_millis()
        ))
    };

    std::fs::create_dir_all(&paths.queue_outgoing)?;
    let json = serde_json::to_string_pretty(response)?;
    write_atomic(&file, &json)?;
    Ok(file)
}

/// Write contents to a temp file in the same directory, then rename over
/// the destination.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().context("Destination has no parent directory")?;
    std::fs::create_dir_all(dir)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", name, rand_suffix(6)));

    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename temp file into {}", path.display()))?;
    Ok(())
}

fn rand_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
