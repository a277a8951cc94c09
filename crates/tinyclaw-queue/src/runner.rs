//! Sandboxed execution of provider commands.
//!
//! Three modes: `host` spawns the command directly with the ambient
//! environment; `docker` and `apple` wrap it in an ephemeral container with
//! resource limits, an env allowlist, and a single bind mount of the agent's
//! working directory. Every failure is classified terminal or transient so
//! the orchestrator knows whether a retry can help.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use tinyclaw_core::sandbox::{
    classify_container_stderr, required_env_key, ErrorClass, PathMapping, SandboxConfig,
    SandboxError,
};

/// Canonical container working directory in mapped mode.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// HOME inside the container, relative to the working dir bind mount.
const SANDBOX_HOME_DIR: &str = ".tinyclaw-home";

/// One provider invocation to execute.
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub agent_id: &'a str,
    pub provider: &'a str,
    pub command: &'a str,
    pub args: &'a [String],
    pub working_dir: &'a Path,
}

/// Output of a successful run, with the path translations for this mode.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub mode: String,
    pub path_mappings: Vec<PathMapping>,
}

/// Execute the request under the given sandbox mode.
pub async fn run_sandboxed(
    req: &RunRequest<'_>,
    sandbox: &SandboxConfig,
    mode: &str,
) -> Result<RunOutput, SandboxError> {
    match mode {
        "host" => run_host(req, sandbox).await,
        "docker" | "apple" => run_container(req, sandbox, mode).await,
        other => Err(SandboxError::terminal(
            format!("Unknown sandbox mode: {}", other),
            Some("set sandbox.mode to host, docker, or apple".to_string()),
            "The sandbox mode is misconfigured. Ask an operator to check settings.json.",
        )),
    }
}

async fn run_host(
    req: &RunRequest<'_>,
    sandbox: &SandboxConfig,
) -> Result<RunOutput, SandboxError> {
    let started = Instant::now();

    let mut cmd = Command::new(req.command);
    cmd.args(req.args)
        .current_dir(req.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        SandboxError::transient(
            format!("Failed to spawn {}: {}", req.command, e),
            "The agent could not be started. Please try again.",
        )
    })?;

    let (status, stdout, stderr) =
        collect(child, sandbox.timeout_seconds)
            .await
            .map_err(|e| match e {
                CollectError::TimedOut => SandboxError::transient(
                    format!(
                        "{} timed out after {}s",
                        req.command, sandbox.timeout_seconds
                    ),
                    "The agent timed out. Please try again.",
                ),
                CollectError::Io(e) => SandboxError::transient(
                    format!("Failed waiting for {}: {}", req.command, e),
                    "The agent could not be run. Please try again.",
                ),
            })?;

    if !status.success() {
        let stderr_trim = stderr.trim();
        let reason = if stderr_trim.is_empty() {
            format!("{} exited with code {:?}", req.command, status.code())
        } else {
            stderr_trim.to_string()
        };
        return Err(SandboxError::transient(
            reason,
            "The agent failed. Please try again.",
        ));
    }

    let host_dir = req.working_dir.to_string_lossy().to_string();
    Ok(RunOutput {
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        mode: "host".to_string(),
        path_mappings: vec![PathMapping {
            container_prefix: host_dir.clone(),
            host_prefix: host_dir,
        }],
    })
}

async fn run_container(
    req: &RunRequest<'_>,
    sandbox: &SandboxConfig,
    mode: &str,
) -> Result<RunOutput, SandboxError> {
    let network = if mode == "apple" {
        &sandbox.apple.network
    } else {
        &sandbox.docker.network
    };

    let key = required_env_key(req.provider);
    preflight(
        req.provider,
        &sandbox.env_allowlist,
        network,
        std::env::var_os(key).is_some(),
    )?;

    let host_dir = req.working_dir.to_string_lossy().to_string();
    let (container_workdir, path_mappings) =
        plan_path_mapping(&sandbox.path_mapping_mode, &host_dir);

    // HOME inside the container lives under the bind mount
    let home_host = req.working_dir.join(SANDBOX_HOME_DIR);
    if !home_host.exists() {
        std::fs::create_dir_all(&home_host).map_err(|e| {
            SandboxError::transient(
                format!(
                    "Failed to create sandbox home {}: {}",
                    home_host.display(),
                    e
                ),
                "The agent workspace could not be prepared. Please try again.",
            )
        })?;
    }

    // Allowlisted keys present in the host env, sorted for a stable argv
    let mut allowed: Vec<&String> = sandbox.env_allowlist.iter().collect();
    allowed.sort();
    let env_pairs: Vec<(String, String)> = allowed
        .into_iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.clone(), v)))
        .collect();

    let argv = build_container_args(
        mode,
        sandbox,
        &container_workdir,
        &host_dir,
        &env_pairs,
        req.command,
        req.args,
    );
    let runtime = if mode == "apple" {
        sandbox.apple.runtime_command.as_str()
    } else {
        "docker"
    };

    let started = Instant::now();
    let mut cmd = Command::new(runtime);
    cmd.args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SandboxError::terminal(
                format!("Sandbox runtime '{}' not found", runtime),
                Some("run the sandbox doctor to install the container runtime".to_string()),
                format!(
                    "The {} sandbox runtime is not installed. Ask an operator to run the doctor.",
                    mode
                ),
            )
        } else {
            SandboxError::transient(
                format!("Failed to spawn {}: {}", runtime, e),
                "The sandbox could not be started. Please try again.",
            )
        }
    })?;

    let (status, stdout, stderr) =
        collect(child, sandbox.timeout_seconds)
            .await
            .map_err(|e| match e {
                CollectError::TimedOut => SandboxError::transient(
                    format!(
                        "Container for agent {} timed out after {}s",
                        req.agent_id, sandbox.timeout_seconds
                    ),
                    "The agent timed out inside the sandbox. Please try again.",
                ),
                CollectError::Io(e) => SandboxError::transient(
                    format!("Failed waiting for {}: {}", runtime, e),
                    "The sandbox could not be run. Please try again.",
                ),
            })?;

    if !status.success() {
        let stderr_trim = stderr.trim();
        let reason = if stderr_trim.is_empty() {
            format!("Container exited with code {:?}", status.code())
        } else {
            stderr_trim.to_string()
        };
        return Err(match classify_container_stderr(stderr_trim) {
            ErrorClass::Terminal => SandboxError::terminal(
                reason,
                None,
                "The sandbox rejected the agent invocation. Ask an operator to check the sandbox configuration.",
            ),
            ErrorClass::Transient => SandboxError::transient(
                reason,
                "The agent failed inside the sandbox. Please try again.",
            ),
        });
    }

    Ok(RunOutput {
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        mode: mode.to_string(),
        path_mappings,
    })
}

/// Container pre-flight checks. Every failure here is terminal: nothing a
/// retry can fix.
pub fn preflight(
    provider: &str,
    env_allowlist: &[String],
    network: &str,
    key_present: bool,
) -> Result<(), SandboxError> {
    let key = required_env_key(provider);

    if !env_allowlist.iter().any(|k| k == key) {
        return Err(SandboxError::terminal(
            format!(
                "{} is not in sandbox.env_allowlist; the {} provider cannot authenticate",
                key, provider
            ),
            Some(format!(
                "add {} to sandbox.env_allowlist in settings.json",
                key
            )),
            "The sandbox is not configured to pass the provider API key. Ask an operator to update the sandbox allowlist.",
        ));
    }

    if !key_present {
        return Err(SandboxError::terminal(
            format!("{} is not set in the environment", key),
            Some(format!("export {} before starting the queue processor", key)),
            "The provider API key is missing from the environment. Ask an operator to set it.",
        ));
    }

    if network == "none" {
        return Err(SandboxError::terminal(
            "sandbox network is 'none' but the provider needs API access",
            Some("set the sandbox network to 'default' or 'restricted'".to_string()),
            "The sandbox network is disabled, so the agent cannot reach its provider. Ask an operator to enable networking.",
        ));
    }

    Ok(())
}

/// Container working directory and path translations for a mapping mode.
pub fn plan_path_mapping(path_mapping_mode: &str, host_dir: &str) -> (String, Vec<PathMapping>) {
    match path_mapping_mode {
        "same-path" => (
            host_dir.to_string(),
            vec![PathMapping {
                container_prefix: host_dir.to_string(),
                host_prefix: host_dir.to_string(),
            }],
        ),
        _ => (
            CONTAINER_WORKSPACE.to_string(),
            vec![PathMapping {
                container_prefix: CONTAINER_WORKSPACE.to_string(),
                host_prefix: host_dir.to_string(),
            }],
        ),
    }
}

fn resolved_network(network: &str) -> &str {
    match network {
        "default" | "restricted" => "bridge",
        other => other,
    }
}

/// Build the container argv. `env_pairs` arrive pre-filtered to allowlisted
/// keys present in the host environment.
pub fn build_container_args(
    mode: &str,
    sandbox: &SandboxConfig,
    container_workdir: &str,
    host_dir: &str,
    env_pairs: &[(String, String)],
    command: &str,
    args: &[String],
) -> Vec<String> {
    let (image, network, memory, cpus) = if mode == "apple" {
        (
            &sandbox.apple.image,
            &sandbox.apple.network,
            &sandbox.apple.memory,
            &sandbox.apple.cpus,
        )
    } else {
        (
            &sandbox.docker.image,
            &sandbox.docker.network,
            &sandbox.docker.memory,
            &sandbox.docker.cpus,
        )
    };

    let mut argv: Vec<String> = vec!["run".to_string(), "--rm".to_string()];
    argv.push("--workdir".to_string());
    argv.push(container_workdir.to_string());
    argv.push("--network".to_string());
    argv.push(resolved_network(network).to_string());
    argv.push("--memory".to_string());
    argv.push(memory.clone());
    argv.push("--cpus".to_string());
    argv.push(cpus.clone());

    if mode != "apple" {
        argv.push("--pull".to_string());
        argv.push("missing".to_string());
        argv.push("--pids-limit".to_string());
        argv.push(sandbox.docker.pids_limit.to_string());
        argv.push("--security-opt".to_string());
        argv.push("no-new-privileges".to_string());
        argv.push("--cap-drop".to_string());
        argv.push("ALL".to_string());
        argv.push("--read-only".to_string());
        argv.push("--tmpfs".to_string());
        argv.push("/tmp:rw,noexec,nosuid,size=256m".to_string());
    }

    argv.push("--user".to_string());
    argv.push("1000:1000".to_string());
    argv.push("-v".to_string());
    argv.push(format!("{}:{}", host_dir, container_workdir));
    argv.push("--env".to_string());
    argv.push(format!("HOME={}/{}", container_workdir, SANDBOX_HOME_DIR));

    for (key, value) in env_pairs {
        argv.push("--env".to_string());
        argv.push(format!("{}={}", key, value));
    }

    argv.push(image.clone());
    argv.push(command.to_string());
    argv.extend(args.iter().cloned());
    argv
}

enum CollectError {
    TimedOut,
    Io(std::io::Error),
}

/// Wait for a child with a timeout, draining both pipes concurrently so a
/// chatty process cannot deadlock on a full pipe. Timeout kills the child.
async fn collect(
    mut child: Child,
    timeout_seconds: u64,
) -> Result<(std::process::ExitStatus, String, String), CollectError> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(drain(stdout_pipe));
    let stderr_task = tokio::spawn(drain(stderr_pipe));

    let status = match tokio::time::timeout(Duration::from_secs(timeout_seconds), child.wait())
        .await
    {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(CollectError::Io(e)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CollectError::TimedOut);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok((status, stdout, stderr))
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        let _ = p.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyclaw_core::sandbox::ErrorClass;

    fn sandbox() -> SandboxConfig {
        SandboxConfig::from_settings(None)
    }

    fn request<'a>(command: &'a str, args: &'a [String], dir: &'a Path) -> RunRequest<'a> {
        RunRequest {
            agent_id: "coder",
            provider: "anthropic",
            command,
            args,
            working_dir: dir,
        }
    }

    #[test]
    fn test_preflight_missing_allowlist_entry() {
        let err = preflight("openai", &["ANTHROPIC_API_KEY".to_string()], "default", true)
            .unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Terminal);
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_preflight_missing_env_value() {
        let err = preflight("anthropic", &["ANTHROPIC_API_KEY".to_string()], "default", false)
            .unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Terminal);
        assert!(err.remediation().is_some());
    }

    #[test]
    fn test_preflight_network_none() {
        let err = preflight("anthropic", &["ANTHROPIC_API_KEY".to_string()], "none", true)
            .unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Terminal);
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_preflight_ok() {
        assert!(preflight("anthropic", &["ANTHROPIC_API_KEY".to_string()], "default", true).is_ok());
    }

    #[test]
    fn test_plan_path_mapping_mapped() {
        let (workdir, mappings) = plan_path_mapping("mapped", "/home/u/agent");
        assert_eq!(workdir, "/workspace");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].container_prefix, "/workspace");
        assert_eq!(mappings[0].host_prefix, "/home/u/agent");
    }

    #[test]
    fn test_plan_path_mapping_same_path() {
        let (workdir, mappings) = plan_path_mapping("same-path", "/home/u/agent");
        assert_eq!(workdir, "/home/u/agent");
        assert_eq!(mappings[0].container_prefix, "/home/u/agent");
        assert_eq!(mappings[0].host_prefix, "/home/u/agent");
    }

    #[test]
    fn test_docker_args_contract() {
        let cfg = sandbox();
        let env = vec![("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string())];
        let args = vec!["-p".to_string(), "hello".to_string()];
        let argv = build_container_args(
            "docker",
            &cfg,
            "/workspace",
            "/home/u/agent",
            &env,
            "claude",
            &args,
        );

        assert_eq!(&argv[..2], &["run", "--rm"]);
        let joined = argv.join(" ");
        assert!(joined.contains("--workdir /workspace"));
        assert!(joined.contains("--network bridge"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--pull missing"));
        assert!(joined.contains("--pids-limit 512"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--tmpfs /tmp:rw,noexec,nosuid,size=256m"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("-v /home/u/agent:/workspace"));
        assert!(joined.contains("--env HOME=/workspace/.tinyclaw-home"));
        assert!(joined.contains("--env ANTHROPIC_API_KEY=sk-test"));

        // image, then command and args at the tail
        let n = argv.len();
        assert_eq!(argv[n - 4], "tinyclaw-sandbox:latest");
        assert_eq!(argv[n - 3], "claude");
        assert_eq!(argv[n - 2], "-p");
        assert_eq!(argv[n - 1], "hello");
    }

    #[test]
    fn test_apple_args_skip_docker_only_flags() {
        let cfg = sandbox();
        let argv = build_container_args(
            "apple",
            &cfg,
            "/workspace",
            "/home/u/agent",
            &[],
            "claude",
            &[],
        );
        let joined = argv.join(" ");
        assert!(joined.contains("--network bridge"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(!joined.contains("--pull"));
        assert!(!joined.contains("--pids-limit"));
        assert!(!joined.contains("--cap-drop"));
        assert!(!joined.contains("--read-only"));
        assert!(!joined.contains("--tmpfs"));
        assert!(!joined.contains("--security-opt"));
    }

    #[tokio::test]
    async fn test_host_mode_captures_stdout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let args = vec!["hello".to_string()];
        let req = request("echo", &args, tmp.path());

        let out = run_sandboxed(&req, &sandbox(), "host").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.mode, "host");
        assert_eq!(out.path_mappings.len(), 1);
        assert_eq!(
            out.path_mappings[0].container_prefix,
            out.path_mappings[0].host_prefix
        );
    }

    #[tokio::test]
    async fn test_host_mode_nonzero_exit_is_transient() {
        let tmp = tempfile::TempDir::new().unwrap();
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let req = request("sh", &args, tmp.path());

        let err = run_sandboxed(&req, &sandbox(), "host").await.unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Transient);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_host_mode_timeout_is_transient() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = sandbox();
        cfg.timeout_seconds = 1;
        let args = vec!["5".to_string()];
        let req = request("sleep", &args, tmp.path());

        let err = run_sandboxed(&req, &cfg, "host").await.unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Transient);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_mode_is_terminal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let req = request("echo", &[], tmp.path());

        let err = run_sandboxed(&req, &sandbox(), "firecracker")
            .await
            .unwrap_err();
        assert_eq!(err.classification(), ErrorClass::Terminal);
    }
}
