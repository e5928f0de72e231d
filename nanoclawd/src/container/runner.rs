//! Sandbox runner: spawns the per-invocation container, streams stdin/stdout,
//! frames results, and enforces independent idle and hard-wall timeouts.
//!
//! The container's stdin stays open for the lifetime of the run so the Group
//! Queue can pipe follow-up messages onto a live sandbox instead of paying
//! spawn cost per message. Follow-ups are handed off through files dropped
//! into `<ipc_dir>/<folder>/input/` (written by `queue::send_message`); this
//! task is the only thing that ever touches that live process's stdin, so it
//! polls that directory itself and forwards each file onto the pipe in
//! arrival order, deleting it once written. A `_close` sentinel in the same
//! directory means: stop piping, close stdin, let the sandbox finalize.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nanoclaw_core::{
    container_image, extract_output_markers, SandboxFailure, SandboxInput, SandboxOutput,
    SandboxStatus,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::mounts::{build_volume_mounts, container_name, FolderInfo};
use super::secrets::{build_container_args, read_secrets};
use super::security::MountAllowlist;
use nanoclaw_core::RuntimeKind;

const CONTAINER_RUNTIME_BIN: &str = "docker";

/// Cap on buffered stdout/stderr kept for framing and logging; bytes beyond
/// this are dropped from the buffer (the process itself is never killed for
/// exceeding it — only truncated for framing purposes, per spec).
const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// How long to wait after a graceful `docker stop` before force-killing.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How often to poll the per-folder IPC `input/` directory for piped
/// follow-up messages and the `_close` sentinel.
const DEFAULT_INPUT_POLL_MS: u64 = 500;

/// Parameters shared across sandbox invocations for one host process.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project_root: PathBuf,
    pub folders_dir: PathBuf,
    pub data_dir: PathBuf,
    pub timezone: String,
    /// Idle timeout (ms): no new piped input for this long closes stdin.
    pub idle_timeout_ms: u64,
    /// Hard-wall timeout (ms), fixed from launch, never reset by activity.
    pub container_timeout_ms: u64,
    /// How often to poll the input directory for piped follow-ups.
    pub ipc_poll_interval_ms: u64,
    pub allowlist: Option<MountAllowlist>,
}

impl RunConfig {
    pub fn input_poll_interval(&self) -> Duration {
        if self.ipc_poll_interval_ms == 0 {
            Duration::from_millis(DEFAULT_INPUT_POLL_MS)
        } else {
            Duration::from_millis(self.ipc_poll_interval_ms)
        }
    }
}

/// Outcome of one sandbox invocation.
pub struct RunResult {
    pub output: SandboxOutput,
    pub container_name: String,
    pub duration: Duration,
    /// Set when `output.status` is `Error`, classifying whether the Group
    /// Queue should retry this batch or abandon it immediately.
    pub failure: Option<SandboxFailure>,
}

/// Stderr substrings known to indicate a transient condition worth retrying
/// rather than a persistent failure in the sandbox or its environment.
const RETRIABLE_STDERR_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "rate limit",
    "429",
    "temporarily unavailable",
    "503",
];

/// Classify a non-zero exit by its stderr tail.
fn classify_exit_failure(stderr_tail: &str) -> SandboxFailure {
    let lower = stderr_tail.to_lowercase();
    if RETRIABLE_STDERR_PATTERNS.iter().any(|p| lower.contains(p)) {
        SandboxFailure::Transient(stderr_tail.to_string())
    } else {
        SandboxFailure::Permanent(stderr_tail.to_string())
    }
}

/// Callback invoked for every framed output block observed on stdout
/// (not just the final one), so streaming replies can be dispatched as they
/// arrive.
pub type OutputCallback = dyn Fn(SandboxOutput) -> BoxFuture<'static, ()> + Send + Sync;

/// Launch a sandbox, stream its I/O to completion, and return the final result.
pub async fn run_container_agent(
    folder: &FolderInfo,
    input: &SandboxInput,
    runtime: RuntimeKind,
    is_main: bool,
    config: &RunConfig,
    on_output: Option<Arc<OutputCallback>>,
) -> anyhow::Result<RunResult> {
    let folder_dir = config.folders_dir.join(&folder.folder);
    std::fs::create_dir_all(&folder_dir).ok();
    let logs_dir = config.data_dir.join("logs").join(&folder.folder);
    std::fs::create_dir_all(&logs_dir).ok();

    let mounts = build_volume_mounts(
        folder,
        is_main,
        runtime,
        &config.project_root,
        &config.folders_dir,
        &config.data_dir,
        config.allowlist.as_ref(),
    );

    let name = container_name(&folder.folder);
    let image = container_image(runtime);
    let args = build_container_args(&mounts, &name, image, &config.timezone);

    let secrets = read_secrets(&config.project_root);
    let mut wire_input = input.clone();
    wire_input.secrets = Some(secrets);

    let input_dir = config
        .data_dir
        .join("ipc")
        .join(&folder.folder)
        .join("input");
    std::fs::create_dir_all(&input_dir).ok();

    info!(
        folder = %folder.folder,
        container = %name,
        image,
        "spawning sandbox"
    );

    let mut child = Command::new(CONTAINER_RUNTIME_BIN)
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let initial_line = serde_json::to_string(&wire_input)?;
    stdin.write_all(initial_line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let launched_at = Instant::now();
    let hard_deadline = launched_at + Duration::from_millis(config.container_timeout_ms.max(1));
    let mut idle_deadline = Instant::now() + Duration::from_millis(config.idle_timeout_ms.max(1));
    let input_poll = config.input_poll_interval();

    let mut stdout_total = String::new();
    let mut stdout_buf = String::new();
    let mut stderr_total = String::new();
    let mut stdout_truncated = false;
    let mut stderr_truncated = false;
    let mut last_session_id: Option<String> = None;
    let mut had_output = false;
    let mut stdin_open = true;
    let mut was_hard_killed = false;

    loop {
        if stdin_open && Instant::now() >= idle_deadline {
            debug!(folder = %folder.folder, "idle timeout elapsed, closing stdin");
            let _ = stdin.shutdown().await;
            stdin_open = false;
        }

        if Instant::now() >= hard_deadline {
            warn!(folder = %folder.folder, container = %name, "hard wall timeout, stopping container");
            was_hard_killed = true;
            stop_container(&name).await;
            tokio::time::sleep(KILL_GRACE).await;
            let _ = child.kill().await;
            break;
        }

        tokio::select! {
            biased;

            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        push_capped(&mut stdout_total, &l, MAX_OUTPUT_SIZE, &mut stdout_truncated);
                        push_capped(&mut stdout_buf, &l, MAX_OUTPUT_SIZE, &mut stdout_truncated);
                        stdout_buf.push('\n');

                        let (blocks, consumed) = extract_output_markers(&stdout_buf);
                        if consumed > 0 {
                            stdout_buf.drain(..consumed);
                        }
                        for block in blocks {
                            match serde_json::from_str::<SandboxOutput>(&block) {
                                Ok(out) => {
                                    had_output = true;
                                    if out.session_id.is_some() {
                                        last_session_id = out.session_id.clone();
                                    }
                                    idle_deadline = Instant::now() + Duration::from_millis(config.idle_timeout_ms.max(1));
                                    if let Some(ref cb) = on_output {
                                        cb(out).await;
                                    }
                                }
                                Err(e) => {
                                    warn!(folder = %folder.folder, err = %e, "malformed framed output block");
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(folder = %folder.folder, err = %e, "stdout read error");
                        break;
                    }
                }
            }

            line = stderr_lines.next_line() => {
                if let Ok(Some(l)) = line {
                    push_capped(&mut stderr_total, &l, MAX_OUTPUT_SIZE, &mut stderr_truncated);
                }
            }

            _ = tokio::time::sleep(input_poll), if stdin_open => {
                if poll_input_dir(&input_dir, &mut stdin).await {
                    idle_deadline = Instant::now() + Duration::from_millis(config.idle_timeout_ms.max(1));
                } else if input_dir.join("_close").exists() {
                    debug!(folder = %folder.folder, "close sentinel observed, closing stdin");
                    let _ = std::fs::remove_file(input_dir.join("_close"));
                    let _ = stdin.shutdown().await;
                    stdin_open = false;
                }
            }
        }
    }

    let exit_status = if was_hard_killed {
        None
    } else {
        child.wait().await.ok()
    };
    let duration = launched_at.elapsed();

    let mut failure: Option<SandboxFailure> = None;

    let final_output = if had_output && on_output.is_some() {
        // Streaming mode: every block was already dispatched via callback.
        SandboxOutput {
            status: SandboxStatus::Success,
            result: None,
            session_id: last_session_id.clone(),
            error: None,
            usage: None,
            event: None,
        }
    } else if let Some(block) = last_framed_block(&stdout_total) {
        serde_json::from_str::<SandboxOutput>(&block).unwrap_or_else(|e| {
            let msg = format!("failed to parse framed output: {e}");
            failure = Some(SandboxFailure::Permanent(msg.clone()));
            SandboxOutput {
                status: SandboxStatus::Error,
                result: None,
                session_id: last_session_id.clone(),
                error: Some(msg),
                usage: None,
                event: None,
            }
        })
    } else if was_hard_killed {
        let msg = "sandbox exceeded hard-wall timeout".to_string();
        failure = Some(SandboxFailure::Transient(msg.clone()));
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            session_id: last_session_id.clone(),
            error: Some(msg),
            usage: None,
            event: None,
        }
    } else {
        let ok = exit_status.map(|s| s.success()).unwrap_or(false);
        if ok {
            let msg = "sandbox exited without emitting a framed result".to_string();
            failure = Some(SandboxFailure::Permanent(msg.clone()));
            SandboxOutput {
                status: SandboxStatus::Error,
                result: None,
                session_id: last_session_id.clone(),
                error: Some(msg),
                usage: None,
                event: None,
            }
        } else {
            let tail: String = stderr_total.chars().rev().take(2000).collect::<String>().chars().rev().collect();
            let classified = classify_exit_failure(&tail);
            let msg = format!("sandbox exited with failure: {tail}");
            failure = Some(match classified {
                SandboxFailure::Transient(_) => SandboxFailure::Transient(msg.clone()),
                SandboxFailure::Permanent(_) => SandboxFailure::Permanent(msg.clone()),
            });
            SandboxOutput {
                status: SandboxStatus::Error,
                result: None,
                session_id: last_session_id.clone(),
                error: Some(msg),
                usage: None,
                event: None,
            }
        }
    };

    write_container_log(
        &logs_dir,
        &name,
        &folder.folder,
        &mounts,
        &stdout_total,
        &stderr_total,
        stdout_truncated,
        stderr_truncated,
        matches!(final_output.status, SandboxStatus::Error),
    );

    Ok(RunResult {
        output: final_output,
        container_name: name,
        duration,
        failure,
    })
}

/// Drain any files currently sitting in the input directory, writing each as
/// a `PipedMessage` JSON line onto the sandbox's stdin. Returns true if any
/// message was piped (used to reset the idle timer).
async fn poll_input_dir(input_dir: &Path, stdin: &mut tokio::process::ChildStdin) -> bool {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(input_dir) {
        Ok(rd) => rd
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(_) => return false,
    };
    entries.sort();

    let mut piped_any = false;
    for path in entries {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if stdin.write_all(content.as_bytes()).await.is_ok() && stdin.write_all(b"\n").await.is_ok() {
            piped_any = true;
        }
        let _ = std::fs::remove_file(&path);
    }
    piped_any
}

/// Append `line` to `buf`, truncating (dropping further bytes, not the
/// process) once the cap is reached.
fn push_capped(buf: &mut String, line: &str, cap: usize, truncated: &mut bool) {
    if buf.len() >= cap {
        *truncated = true;
        return;
    }
    let remaining = cap - buf.len();
    if line.len() > remaining {
        buf.push_str(&line[..remaining]);
        *truncated = true;
    } else {
        buf.push_str(line);
        buf.push('\n');
    }
}

/// Extract the last framed output block found anywhere in `buf`.
fn last_framed_block(buf: &str) -> Option<String> {
    let (blocks, _) = extract_output_markers(buf);
    blocks.into_iter().last()
}

/// Stop a running container by name. Best-effort.
pub async fn stop_container(name: &str) {
    match Command::new(CONTAINER_RUNTIME_BIN)
        .args(["stop", name])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!(container = name, "container stopped");
        }
        Ok(_) => warn!(container = name, "docker stop reported failure"),
        Err(e) => error!(container = name, err = %e, "docker stop error"),
    }
}

/// Confirm the container runtime is reachable; call once at host startup.
pub async fn ensure_runtime_available() -> anyhow::Result<()> {
    let output = Command::new(CONTAINER_RUNTIME_BIN)
        .arg("info")
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!("docker info failed: container runtime is not available");
    }
    Ok(())
}

/// Stop any container left running from a prior crashed process, identified
/// by the `nanoclaw-` name prefix. Call once at host startup before accepting
/// new work.
pub async fn cleanup_orphans() -> anyhow::Result<usize> {
    let output = Command::new(CONTAINER_RUNTIME_BIN)
        .args(["ps", "--filter", "name=nanoclaw-", "--format", "{{.Names}}"])
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!("docker ps failed while scanning for orphans");
    }
    let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    for name in &names {
        warn!(container = name.as_str(), "stopping orphaned container from prior run");
        stop_container(name).await;
    }
    Ok(names.len())
}

/// Write snapshots of current tasks / registered folders into the per-folder
/// IPC namespace, so a sandbox can read its own schedule and peers without an
/// IPC round trip.
pub fn write_snapshots(
    data_dir: &Path,
    workspace_folder: &str,
    is_main: bool,
    tasks_json: &str,
    folders_json: Option<&str>,
) {
    let ipc_dir = data_dir.join("ipc").join(workspace_folder);
    std::fs::create_dir_all(&ipc_dir).ok();
    let _ = std::fs::write(ipc_dir.join("current_tasks.json"), tasks_json);
    if is_main {
        if let Some(json) = folders_json {
            let _ = std::fs::write(ipc_dir.join("available_groups.json"), json);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_container_log(
    logs_dir: &Path,
    container_name: &str,
    workspace_folder: &str,
    mounts: &[nanoclaw_core::VolumeMount],
    stdout_total: &str,
    stderr_total: &str,
    stdout_truncated: bool,
    stderr_truncated: bool,
    had_error: bool,
) {
    let ts = chrono_timestamp();
    let log_path = logs_dir.join(format!("{ts}-{container_name}.log"));

    let mut body = String::new();
    body.push_str(&format!("container: {container_name}\n"));
    body.push_str(&format!("folder: {workspace_folder}\n"));
    body.push_str(&format!("mounts: {}\n", mounts.len()));
    for m in mounts {
        body.push_str(&format!(
            "  {} -> {} (ro={})\n",
            m.host_path, m.container_path, m.readonly
        ));
    }

    if had_error {
        body.push_str("\n--- stdout ---\n");
        body.push_str(stdout_total);
        if stdout_truncated {
            body.push_str("\n[stdout truncated]\n");
        }
        body.push_str("\n--- stderr ---\n");
        body.push_str(stderr_total);
        if stderr_truncated {
            body.push_str("\n[stderr truncated]\n");
        }
    } else {
        body.push_str(&format!(
            "\nstdout bytes: {} stderr bytes: {}\n",
            stdout_total.len(),
            stderr_total.len()
        ));
    }

    let _ = std::fs::write(&log_path, body);
}

/// Filename-safe timestamp, not full ISO-8601 (used only to order log files).
fn chrono_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{}", now.as_secs(), now.subsec_millis())
}
