//! Per-folder serialization queue with a global concurrency cap.
//!
//! Ensures only one sandbox runs per chat folder at a time, with a global
//! limit on total concurrent sandboxes.
//!
//! Key semantics:
//! - Tasks drain before messages (priority ordering)
//! - Follow-up messages piped to active sandboxes via the IPC `input/` directory
//! - Exponential retry backoff on message-batch processing failure, capped at
//!   `MAX_ATTEMPTS` consecutive failures before the batch is abandoned
//! - Graceful shutdown: sandboxes are detached, not killed

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const BASE_RETRY_MS: u64 = 5000;

/// Callback for processing messages for a chat folder. Returns true on success.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Callback invoked when a chat folder's batch is abandoned after
/// `MAX_ATTEMPTS` consecutive failures, so the caller can force the cursor
/// past the poisoned batch and tell the user the run gave up.
pub type ExhaustionFn = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback for running a queued task.
pub type TaskFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A queued task waiting for execution.
struct QueuedTask {
    id: String,
    #[allow(dead_code)]
    chat_id: String,
    task_fn: TaskFn,
}

/// Per-folder state tracked by the queue.
#[derive(Default)]
struct FolderState {
    active: bool,
    idle_waiting: bool,
    is_task_container: bool,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    container_name: Option<String>,
    workspace_folder: Option<String>,
    retry_count: u32,
}

/// Shared inner state behind a mutex.
struct Inner {
    folders: HashMap<String, FolderState>,
    active_count: usize,
    max_concurrent: usize,
    max_attempts: u32,
    waiting_folders: VecDeque<String>,
    process_messages_fn: Option<ProcessMessagesFn>,
    on_exhausted: Option<ExhaustionFn>,
    shutting_down: bool,
    ipc_dir: PathBuf,
}

impl Inner {
    fn get_or_insert(&mut self, chat_id: &str) -> &mut FolderState {
        self.folders
            .entry(chat_id.to_string())
            .or_insert_with(FolderState::default)
    }

    fn reset_folder(&mut self, chat_id: &str) {
        if let Some(state) = self.folders.get_mut(chat_id) {
            state.active = false;
            state.is_task_container = false;
            state.container_name = None;
            state.workspace_folder = None;
        }
        self.active_count = self.active_count.saturating_sub(1);
    }
}

/// Group queue managing per-folder serialization and global concurrency.
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, max_attempts: u32, ipc_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                folders: HashMap::new(),
                active_count: 0,
                max_concurrent,
                max_attempts,
                waiting_folders: VecDeque::new(),
                process_messages_fn: None,
                on_exhausted: None,
                shutting_down: false,
                ipc_dir,
            })),
        }
    }

    /// Set the callback invoked to process messages for a chat folder.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Set the callback invoked when a chat folder's batch is abandoned
    /// after `MAX_ATTEMPTS` consecutive failures.
    pub async fn set_on_exhausted_fn(&self, f: ExhaustionFn) {
        self.inner.lock().await.on_exhausted = Some(f);
    }

    /// Enqueue a message check for a chat folder.
    pub async fn enqueue_message_check(&self, chat_id: &str) {
        let should_spawn = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }

            let state = inner.get_or_insert(chat_id);

            if state.active {
                state.pending_messages = true;
                debug!(chat_id, "container active, message queued");
                return;
            }

            if inner.active_count >= inner.max_concurrent {
                let state = inner.get_or_insert(chat_id);
                state.pending_messages = true;
                let id = chat_id.to_string();
                if !inner.waiting_folders.contains(&id) {
                    inner.waiting_folders.push_back(id);
                }
                debug!(
                    chat_id,
                    active_count = inner.active_count,
                    "at concurrency limit, message queued"
                );
                return;
            }

            let state = inner.get_or_insert(chat_id);
            state.active = true;
            state.idle_waiting = false;
            state.is_task_container = false;
            state.pending_messages = false;
            inner.active_count += 1;
            true
        };

        if should_spawn {
            let queue = self.inner.clone();
            let id = chat_id.to_string();
            tokio::spawn(async move {
                run_for_folder(queue, id).await;
            });
        }
    }

    /// Enqueue a task for a chat folder. Tasks have priority over messages.
    pub async fn enqueue_task(&self, chat_id: &str, task_id: &str, task_fn: TaskFn) {
        let task_to_run = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }

            let ipc_dir = inner.ipc_dir.clone();
            let state = inner.get_or_insert(chat_id);

            if state.pending_tasks.iter().any(|t| t.id == task_id) {
                debug!(chat_id, task_id, "task already queued, skipping");
                return;
            }

            if state.active {
                let close_folder = if state.idle_waiting {
                    state.workspace_folder.clone()
                } else {
                    None
                };
                state.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    chat_id: chat_id.to_string(),
                    task_fn,
                });
                if let Some(ref folder) = close_folder {
                    write_close_sentinel(&ipc_dir, folder);
                }
                debug!(chat_id, task_id, "container active, task queued");
                return;
            }

            if inner.active_count >= inner.max_concurrent {
                let state = inner.get_or_insert(chat_id);
                state.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    chat_id: chat_id.to_string(),
                    task_fn,
                });
                let id = chat_id.to_string();
                if !inner.waiting_folders.contains(&id) {
                    inner.waiting_folders.push_back(id);
                }
                debug!(
                    chat_id,
                    task_id,
                    active_count = inner.active_count,
                    "at concurrency limit, task queued"
                );
                return;
            }

            let state = inner.get_or_insert(chat_id);
            state.active = true;
            state.idle_waiting = false;
            state.is_task_container = true;
            inner.active_count += 1;

            Some(QueuedTask {
                id: task_id.to_string(),
                chat_id: chat_id.to_string(),
                task_fn,
            })
        };

        if let Some(task) = task_to_run {
            let queue = self.inner.clone();
            let id = chat_id.to_string();
            tokio::spawn(async move {
                run_task(queue, id, task).await;
            });
        }
    }

    /// Register a sandbox process for a chat folder.
    pub async fn register_process(
        &self,
        chat_id: &str,
        container_name: &str,
        workspace_folder: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        let state = inner.get_or_insert(chat_id);
        state.container_name = Some(container_name.to_string());
        if let Some(folder) = workspace_folder {
            state.workspace_folder = Some(folder.to_string());
        }
    }

    /// Mark the container as idle-waiting. Preempts if tasks are pending.
    pub async fn notify_idle(&self, chat_id: &str) {
        let mut inner = self.inner.lock().await;
        let has_tasks;
        let folder;
        {
            let state = inner.get_or_insert(chat_id);
            state.idle_waiting = true;
            has_tasks = !state.pending_tasks.is_empty();
            folder = state.workspace_folder.clone();
        }
        if has_tasks {
            if let Some(ref f) = folder {
                write_close_sentinel(&inner.ipc_dir, f);
            }
        }
    }

    /// Send a follow-up message to the active container via an IPC input file.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> bool {
        let input_dir = {
            let inner = self.inner.lock().await;
            let state = match inner.folders.get(chat_id) {
                Some(s) => s,
                None => return false,
            };
            if !state.active || state.workspace_folder.is_none() || state.is_task_container {
                return false;
            }
            let folder = state.workspace_folder.as_ref().unwrap();
            inner.ipc_dir.join(folder).join("input")
        };

        write_ipc_message(&input_dir, text)
    }

    /// Signal the active container to wind down via close sentinel.
    pub async fn close_stdin(&self, chat_id: &str) {
        let inner = self.inner.lock().await;
        if let Some(state) = inner.folders.get(chat_id) {
            if state.active {
                if let Some(ref folder) = state.workspace_folder {
                    write_close_sentinel(&inner.ipc_dir, folder);
                }
            }
        }
    }

    /// Check if a chat folder has an active container.
    pub async fn is_active(&self, chat_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .folders
            .get(chat_id)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Stop an active container via `docker stop`.
    pub async fn kill_group(&self, chat_id: &str) -> bool {
        let container_name = {
            let inner = self.inner.lock().await;
            match inner.folders.get(chat_id) {
                Some(s) if s.active && s.container_name.is_some() => {
                    s.container_name.clone().unwrap()
                }
                _ => return false,
            }
        };

        match tokio::process::Command::new("docker")
            .args(["stop", &container_name])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!(
                    chat_id,
                    container = container_name.as_str(),
                    "container stopped via kill_group"
                );
                true
            }
            Ok(_) => {
                warn!(
                    chat_id,
                    container = container_name.as_str(),
                    "failed to stop container"
                );
                false
            }
            Err(e) => {
                error!(chat_id, container = container_name.as_str(), err = %e, "docker stop error");
                false
            }
        }
    }

    /// Graceful shutdown — close stdin on every active sandbox, wait up to
    /// `grace` for them to exit on their own, then force-kill any stragglers.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        let (folders, ipc_dir) = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;

            let folders: Vec<String> = inner
                .folders
                .iter()
                .filter(|(_, s)| s.active)
                .map(|(folder, _)| folder.clone())
                .collect();
            (folders, inner.ipc_dir.clone())
        };

        if folders.is_empty() {
            info!("GroupQueue shutdown — no active containers");
            return;
        }

        info!(count = folders.len(), ?folders, "closing stdin on active containers");
        for folder in &folders {
            if let Some(state) = self.inner.lock().await.folders.get(folder) {
                if let Some(ref workspace_folder) = state.workspace_folder {
                    write_close_sentinel(&ipc_dir, workspace_folder);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let still_active = {
                let inner = self.inner.lock().await;
                folders
                    .iter()
                    .filter(|f| inner.folders.get(*f).is_some_and(|s| s.active))
                    .count()
            };
            if still_active == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        let stragglers: Vec<(String, String)> = {
            let inner = self.inner.lock().await;
            folders
                .iter()
                .filter_map(|f| {
                    inner.folders.get(f).and_then(|s| {
                        if s.active {
                            s.container_name.clone().map(|name| (f.clone(), name))
                        } else {
                            None
                        }
                    })
                })
                .collect()
        };

        for (chat_id, container_name) in stragglers {
            warn!(chat_id, container = container_name.as_str(), "SHUTDOWN_GRACE elapsed, force-killing container");
            match tokio::process::Command::new("docker")
                .args(["kill", &container_name])
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    info!(chat_id, container = container_name.as_str(), "container force-killed");
                }
                Ok(_) => warn!(chat_id, container = container_name.as_str(), "docker kill reported failure"),
                Err(e) => error!(chat_id, container = container_name.as_str(), err = %e, "docker kill error"),
            }
        }

        info!("GroupQueue shutdown complete");
    }

    /// Get the current active container count.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }
}

// ---------------------------------------------------------------------------
// Internal execution functions
// ---------------------------------------------------------------------------

async fn run_for_folder(queue: Arc<Mutex<Inner>>, chat_id: String) {
    debug!(chat_id = chat_id.as_str(), "starting message processing");

    let process_fn = {
        let inner = queue.lock().await;
        inner.process_messages_fn.clone()
    };

    let success = if let Some(ref f) = process_fn {
        f(chat_id.clone()).await
    } else {
        warn!(
            chat_id = chat_id.as_str(),
            "no process_messages_fn set, skipping"
        );
        false
    };

    let mut inner = queue.lock().await;
    let max_attempts = inner.max_attempts;

    if success {
        if let Some(state) = inner.folders.get_mut(&chat_id) {
            state.retry_count = 0;
        }
    } else {
        let retry_count = inner
            .folders
            .get(&chat_id)
            .map(|s| s.retry_count + 1)
            .unwrap_or(1);

        if let Some(state) = inner.folders.get_mut(&chat_id) {
            state.retry_count = retry_count;
        }

        if retry_count <= max_attempts {
            let delay_ms = BASE_RETRY_MS * 2u64.pow(retry_count - 1);
            info!(
                chat_id = chat_id.as_str(),
                retry_count,
                delay_ms,
                "scheduling retry with backoff"
            );
            let queue_clone = queue.clone();
            let id_clone = chat_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                let mut inner = queue_clone.lock().await;
                if !inner.shutting_down {
                    let state = inner.get_or_insert(&id_clone);
                    state.pending_messages = true;
                }
            });
        } else {
            error!(
                chat_id = chat_id.as_str(),
                retry_count,
                max_attempts,
                "MAX_ATTEMPTS exceeded, abandoning batch and forcing cursor past it"
            );
            if let Some(state) = inner.folders.get_mut(&chat_id) {
                state.retry_count = 0;
            }
            if let Some(ref f) = inner.on_exhausted {
                let f = f.clone();
                let id_clone = chat_id.clone();
                tokio::spawn(async move {
                    f(id_clone).await;
                });
            }
        }
    }

    inner.reset_folder(&chat_id);
    // Drain is handled by the next poll cycle or enqueue call.
}

async fn run_task(queue: Arc<Mutex<Inner>>, chat_id: String, task: QueuedTask) {
    debug!(
        chat_id = chat_id.as_str(),
        task_id = task.id.as_str(),
        "running queued task"
    );

    (task.task_fn)().await;

    let mut inner = queue.lock().await;
    inner.reset_folder(&chat_id);
}

// ---------------------------------------------------------------------------
// IPC helpers
// ---------------------------------------------------------------------------

fn write_ipc_message(input_dir: &Path, text: &str) -> bool {
    if let Err(e) = std::fs::create_dir_all(input_dir) {
        error!(err = %e, "failed to create IPC input dir");
        return false;
    }
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let filename = format!("{ts}-{:04x}.json", rand_u16());
    let filepath = input_dir.join(&filename);
    let temp_path = input_dir.join(format!("{filename}.tmp"));

    let message = nanoclaw_core::PipedMessage::user_message(text);
    let content = serde_json::to_string(&message).unwrap_or_default();
    match std::fs::write(&temp_path, content) {
        Ok(()) => match std::fs::rename(&temp_path, &filepath) {
            Ok(()) => true,
            Err(e) => {
                error!(err = %e, "failed to rename IPC message file");
                false
            }
        },
        Err(e) => {
            error!(err = %e, "failed to write IPC message file");
            false
        }
    }
}

fn write_close_sentinel(ipc_dir: &Path, workspace_folder: &str) {
    let input_dir = ipc_dir.join(workspace_folder).join("input");
    let _ = std::fs::create_dir_all(&input_dir);
    let _ = std::fs::write(input_dir.join("_close"), "");
}

/// Simple pseudo-random u16 for file name uniqueness.
fn rand_u16() -> u16 {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (t.subsec_nanos() ^ (t.as_secs() as u32).wrapping_mul(2654435761)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_queue_has_zero_active() {
        let q = GroupQueue::new(3, 3, PathBuf::from("/tmp/test-queue"));
        assert_eq!(q.active_count().await, 0);
    }

    #[tokio::test]
    async fn is_active_returns_false_for_unknown_folder() {
        let q = GroupQueue::new(3, 3, PathBuf::from("/tmp/test-queue"));
        assert!(!q.is_active("tg:unknown").await);
    }

    #[tokio::test]
    async fn shutdown_sets_flag() {
        let q = GroupQueue::new(3, 3, PathBuf::from("/tmp/test-queue"));
        q.shutdown(std::time::Duration::from_millis(50)).await;
        q.enqueue_message_check("tg:12345").await;
        assert!(!q.is_active("tg:12345").await);
    }

    #[tokio::test]
    async fn exhaustion_fn_invoked_after_max_attempts() {
        let q = GroupQueue::new(3, 0, PathBuf::from("/tmp/test-queue-exhaust"));
        let exhausted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let exhausted_cb = exhausted.clone();
        q.set_on_exhausted_fn(Arc::new(move |_chat_id: String| {
            let exhausted = exhausted_cb.clone();
            Box::pin(async move {
                exhausted.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        }))
        .await;
        q.set_process_messages_fn(Arc::new(|_chat_id: String| {
            Box::pin(async move { false })
        }))
        .await;

        q.enqueue_message_check("tg:exhaust").await;

        for _ in 0..20 {
            if exhausted.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        assert!(exhausted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn rand_u16_produces_values() {
        let a = rand_u16();
        assert!(a <= u16::MAX);
    }

    #[test]
    fn write_close_sentinel_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        write_close_sentinel(dir.path(), "test-folder");
        let sentinel = dir
            .path()
            .join("test-folder")
            .join("input")
            .join("_close");
        assert!(sentinel.exists());
    }

    #[test]
    fn write_ipc_message_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("input");
        let result = write_ipc_message(&input_dir, "hello");
        assert!(result);
        let files: Vec<_> = std::fs::read_dir(&input_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();
        assert_eq!(files.len(), 1);
    }
}
