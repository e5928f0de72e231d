//! Filesystem IPC dispatcher — the channel sandboxes use to talk back to the
//! host.
//!
//! A sandbox writes a small JSON file into `<ipc_root>/<folder>/requests/`
//! for every RPC it wants to make (send a message, manage its own scheduled
//! tasks, register a new chat). The host polls each folder's `requests/`
//! directory, authorizes the request against the folder it was found under
//! (never against anything the request body claims), dispatches it against
//! Postgres/the transport registry, and — for request/response ops — writes
//! a reply to `results/<requestId>.json` before deleting the request file.
//!
//! Authorization model: an op targeting the requesting sandbox's own chat or
//! folder is always allowed; an op targeting another chat/folder, or a
//! cross-cutting op like listing every task or registering a new chat, is
//! allowed only from the main folder. Every denial is logged at `warn` —
//! there is no silent denial path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nanoclaw_core::{IpcGroupContext, IpcOp, IpcRequest, IpcResponse, PgPool, RegisteredChat, ScheduledTask, TaskUpdate};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::transport::TransportRegistry;

/// Configuration for the IPC dispatcher.
#[derive(Debug, Clone)]
pub struct IpcDispatcherConfig {
    /// Base directory containing one subdirectory per workspace folder.
    pub ipc_root: PathBuf,
    pub poll_interval: Duration,
    pub main_folder: String,
}

/// The IPC dispatcher. Owns polling state and shared handles to the rest of
/// the host's runtime.
pub struct IpcDispatcher {
    config: IpcDispatcherConfig,
    pool: PgPool,
    groups: Arc<RwLock<HashMap<String, RegisteredChat>>>,
    transports: Arc<TransportRegistry>,
}

impl IpcDispatcher {
    pub fn new(
        config: IpcDispatcherConfig,
        pool: PgPool,
        groups: Arc<RwLock<HashMap<String, RegisteredChat>>>,
        transports: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            config,
            pool,
            groups,
            transports,
        }
    }

    /// Run the polling loop. Call from a `tokio::spawn`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_root).ok();
        info!(dir = %self.config.ipc_root.display(), "IPC dispatcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC dispatcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one polling cycle across every folder's request directory.
    async fn poll_once(&self) {
        let folders = match fs::read_dir(&self.config.ipc_root) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir()) && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC root not readable");
                return;
            }
        };

        for folder in folders {
            let ctx = IpcGroupContext::new(&folder, &self.config.main_folder);
            let requests_dir = self.config.ipc_root.join(&folder).join("requests");
            let Some(files) = read_json_files(&requests_dir) else {
                continue;
            };

            for file_path in files {
                self.process_one(&ctx, &file_path).await;
            }
        }
    }

    async fn process_one(&self, ctx: &IpcGroupContext, file_path: &Path) {
        let content = match fs::read_to_string(file_path) {
            Ok(c) => c,
            Err(err) => {
                error!(path = %file_path.display(), err = %err, "failed to read IPC request file");
                return;
            }
        };

        let request: IpcRequest = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(err) => {
                warn!(path = %file_path.display(), err = %err, "malformed IPC request, quarantining");
                move_to_errors(&self.config.ipc_root, file_path, &ctx.workspace_folder);
                return;
            }
        };

        if request.workspace_folder != ctx.workspace_folder {
            warn!(
                path = %file_path.display(),
                claimed = %request.workspace_folder,
                actual = %ctx.workspace_folder,
                "IPC request workspaceFolder does not match its own directory, quarantining"
            );
            move_to_errors(&self.config.ipc_root, file_path, &ctx.workspace_folder);
            return;
        }

        let request_id = request.request_id.clone();
        let op_name = request.op.name();
        let response = self.dispatch(ctx, request).await;

        if let Some(request_id) = request_id {
            let results_dir = self.config.ipc_root.join(&ctx.workspace_folder).join("results");
            if let Err(err) = write_response(&results_dir, &request_id, &response) {
                error!(request_id, err = %err, "failed to write IPC response");
            }
        }

        debug!(
            folder = %ctx.workspace_folder,
            op = op_name,
            ok = response.ok,
            "IPC request processed"
        );
        remove_file(file_path);
    }

    /// Authorize and dispatch a single request, returning the response to
    /// write (if the op is request/response) or to discard (if fire-and-forget).
    async fn dispatch(&self, ctx: &IpcGroupContext, request: IpcRequest) -> IpcResponse {
        let chat_id = request.chat_id.clone();

        match request.op {
            IpcOp::SendMessage { text, target_chat_id } => {
                let target = target_chat_id.unwrap_or_else(|| chat_id.clone());
                if target != chat_id && !ctx.is_main {
                    self.deny(ctx, "send_message", &format!("target chat {target}"));
                    return IpcResponse::not_authorized();
                }
                match self.transports.send(&target, &text).await {
                    Ok(()) => IpcResponse::ok(None),
                    Err(err) => IpcResponse::error(err.to_string()),
                }
            }

            IpcOp::ScheduleTask {
                id,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_folder,
            } => {
                let folder = target_folder.unwrap_or_else(|| ctx.workspace_folder.clone());
                if folder != ctx.workspace_folder && !ctx.is_main {
                    self.deny(ctx, "schedule_task", &format!("target folder {folder}"));
                    return IpcResponse::not_authorized();
                }

                let task_chat_id = if folder == ctx.workspace_folder {
                    chat_id.clone()
                } else {
                    match self.groups.read().await.values().find(|g| g.folder == folder) {
                        Some(g) => g.chat_id.clone(),
                        None => return IpcResponse::error(format!("unknown workspace folder {folder}")),
                    }
                };

                let task = ScheduledTask {
                    id: id.unwrap_or_else(|| format!("task-{}", chrono::Utc::now().timestamp_millis())),
                    workspace_folder: folder,
                    chat_id: task_chat_id,
                    prompt,
                    next_run: crate::scheduler::calculate_next_run(&schedule_type, &schedule_value, "UTC"),
                    schedule_type,
                    schedule_value,
                    context_mode,
                    last_run: None,
                    last_result: None,
                    status: "active".to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };

                match self.pool.create_task(&task).await {
                    Ok(()) => IpcResponse::ok(serde_json::json!({"id": task.id})),
                    Err(err) => IpcResponse::error(err.to_string()),
                }
            }

            IpcOp::ListTasks { scope } => {
                if scope == "all" && !ctx.is_main {
                    self.deny(ctx, "list_tasks", "scope=all");
                    return IpcResponse::not_authorized();
                }

                let result = if scope == "all" {
                    self.pool.get_all_tasks().await
                } else {
                    self.pool.get_tasks_for_folder(&ctx.workspace_folder).await
                };

                match result {
                    Ok(tasks) => IpcResponse::ok(serde_json::to_value(tasks).ok()),
                    Err(err) => IpcResponse::error(err.to_string()),
                }
            }

            IpcOp::PauseTask { task_id } => self.update_own_task(ctx, &task_id, "pause_task", "paused").await,
            IpcOp::ResumeTask { task_id } => self.update_own_task(ctx, &task_id, "resume_task", "active").await,
            IpcOp::CancelTask { task_id } => self.cancel_own_task(ctx, &task_id).await,

            IpcOp::RegisterChat {
                chat_id: new_chat_id,
                name,
                folder,
                trigger,
                requires_trigger,
            } => {
                if !ctx.is_main {
                    self.deny(ctx, "register_chat", &format!("chat {new_chat_id}"));
                    return IpcResponse::not_authorized();
                }

                let registered = RegisteredChat {
                    chat_id: new_chat_id.clone(),
                    name,
                    folder,
                    trigger,
                    added_at: chrono::Utc::now().to_rfc3339(),
                    container_config: None,
                    requires_trigger: Some(requires_trigger),
                    runtime: None,
                    model: None,
                };

                match self.pool.set_registered_chat(&registered).await {
                    Ok(()) => {
                        self.groups.write().await.insert(new_chat_id, registered);
                        IpcResponse::ok(None)
                    }
                    Err(err) => IpcResponse::error(err.to_string()),
                }
            }
        }
    }

    /// Shared logic for pause_task/resume_task: verify the task belongs to
    /// the requesting folder (or the request comes from main), then update
    /// its status.
    async fn update_own_task(&self, ctx: &IpcGroupContext, task_id: &str, op_name: &str, status: &str) -> IpcResponse {
        let task = match self.pool.get_task_by_id(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return IpcResponse::error(format!("unknown task {task_id}")),
            Err(err) => return IpcResponse::error(err.to_string()),
        };

        if task.workspace_folder != ctx.workspace_folder && !ctx.is_main {
            self.deny(ctx, op_name, &format!("task {task_id} owned by {}", task.workspace_folder));
            return IpcResponse::not_authorized();
        }

        let updates = TaskUpdate {
            prompt: None,
            schedule_type: None,
            schedule_value: None,
            next_run: None,
            status: Some(status.to_string()),
        };

        match self.pool.update_task(task_id, &updates).await {
            Ok(()) => IpcResponse::ok(None),
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }

    async fn cancel_own_task(&self, ctx: &IpcGroupContext, task_id: &str) -> IpcResponse {
        let task = match self.pool.get_task_by_id(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return IpcResponse::error(format!("unknown task {task_id}")),
            Err(err) => return IpcResponse::error(err.to_string()),
        };

        if task.workspace_folder != ctx.workspace_folder && !ctx.is_main {
            self.deny(ctx, "cancel_task", &format!("task {task_id} owned by {}", task.workspace_folder));
            return IpcResponse::not_authorized();
        }

        match self.pool.delete_task(task_id).await {
            Ok(()) => IpcResponse::ok(None),
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }

    fn deny(&self, ctx: &IpcGroupContext, op: &str, detail: &str) {
        warn!(
            folder = %ctx.workspace_folder,
            is_main = ctx.is_main,
            op,
            detail,
            "IPC request denied by authorization matrix"
        );
    }
}

// ── Filesystem helpers ─────────────────────────────────────────────

/// Read sorted `.json` filenames from a directory. Returns None if the
/// directory doesn't exist (a folder with no pending requests is normal).
fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    if !dir.exists() {
        return None;
    }

    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(err) => {
            error!(dir = %dir.display(), err = %err, "failed to read IPC requests directory");
            None
        }
    }
}

/// Write a response atomically: write to a `.tmp` sibling, then rename.
fn write_response(results_dir: &Path, request_id: &str, response: &IpcResponse) -> anyhow::Result<()> {
    fs::create_dir_all(results_dir)?;
    let final_path = results_dir.join(format!("{request_id}.json"));
    let tmp_path = results_dir.join(format!("{request_id}.json.tmp"));
    let content = serde_json::to_string_pretty(response)?;
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Quarantine a malformed or unauthorized-field request file instead of
/// silently deleting it, so a human can inspect it later.
fn move_to_errors(ipc_root: &Path, file_path: &Path, folder: &str) {
    let errors_dir = ipc_root.join("errors");
    fs::create_dir_all(&errors_dir).ok();

    if let Some(filename) = file_path.file_name() {
        let dest = errors_dir.join(format!("{folder}-{}", filename.to_string_lossy()));
        if let Err(err) = fs::rename(file_path, &dest) {
            error!(path = %file_path.display(), err = %err, "failed to move request file to errors");
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "failed to remove processed IPC request file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoclaw_core::Config;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn dispatcher(root: PathBuf) -> IpcDispatcher {
        let pool = PgPool::new("postgres://localhost/test".to_string());
        IpcDispatcher::new(
            IpcDispatcherConfig {
                ipc_root: root,
                poll_interval: Duration::from_millis(10),
                main_folder: "main".to_string(),
            },
            pool,
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(TransportRegistry::new()),
        )
    }

    fn write_request(dir: &Path, name: &str, body: &serde_json::Value) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), serde_json::to_string(body).unwrap()).unwrap();
    }

    #[test]
    fn read_json_files_returns_sorted() {
        let dir = tempdir().unwrap();
        write_request(dir.path(), "2.json", &serde_json::json!({}));
        write_request(dir.path(), "1.json", &serde_json::json!({}));
        let files = read_json_files(dir.path()).unwrap();
        assert_eq!(files[0].file_name().unwrap(), "1.json");
        assert_eq!(files[1].file_name().unwrap(), "2.json");
    }

    #[test]
    fn read_json_files_nonexistent_dir_returns_none() {
        assert!(read_json_files(Path::new("/no/such/dir")).is_none());
    }

    #[test]
    fn move_to_errors_preserves_file() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        fs::create_dir_all(&requests).unwrap();
        let file = requests.join("bad.json");
        fs::write(&file, "not json").unwrap();

        move_to_errors(root.path(), &file, "team");

        assert!(!file.exists());
        assert!(root.path().join("errors").join("team-bad.json").exists());
    }

    #[test]
    fn atomic_response_write() {
        let dir = tempdir().unwrap();
        let response = IpcResponse::ok(serde_json::json!({"id": "task-1"}));
        write_response(dir.path(), "req-1", &response).unwrap();

        let content = fs::read_to_string(dir.path().join("req-1.json")).unwrap();
        let parsed: IpcResponse = serde_json::from_str(&content).unwrap();
        assert!(parsed.ok);
        assert!(!dir.path().join("req-1.json.tmp").exists());
    }

    #[tokio::test]
    async fn poll_once_moves_bad_json_to_errors() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        fs::create_dir_all(&requests).unwrap();
        fs::write(requests.join("bad.json"), "{not valid json").unwrap();

        let d = dispatcher(root.path().to_path_buf());
        d.poll_once().await;

        assert!(!requests.join("bad.json").exists());
        assert!(root.path().join("errors").join("team-bad.json").exists());
    }

    #[tokio::test]
    async fn poll_once_quarantines_workspace_folder_mismatch() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        write_request(
            &requests,
            "1.json",
            &serde_json::json!({
                "chatId": "tg:1",
                "workspaceFolder": "main",
                "timestamp": null,
                "type": "list_tasks",
            }),
        );

        let d = dispatcher(root.path().to_path_buf());
        d.poll_once().await;

        assert!(!requests.join("1.json").exists());
        assert!(root.path().join("errors").join("team-1.json").exists());
    }

    #[tokio::test]
    async fn send_message_to_own_chat_is_allowed_without_transport_panicking() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        write_request(
            &requests,
            "1.json",
            &serde_json::json!({
                "requestId": "r1",
                "chatId": "tg:1",
                "workspaceFolder": "team",
                "timestamp": null,
                "type": "send_message",
                "text": "hi",
                "targetChatId": null,
            }),
        );

        let d = dispatcher(root.path().to_path_buf());
        d.poll_once().await;

        let results = root.path().join("team").join("results").join("r1.json");
        assert!(results.exists());
        let content = fs::read_to_string(results).unwrap();
        let parsed: IpcResponse = serde_json::from_str(&content).unwrap();
        // no transport registered, so the send fails, but it was authorized
        assert!(!parsed.ok);
        assert_ne!(parsed.error.as_deref(), Some("not_authorized"));
    }

    #[tokio::test]
    async fn send_message_to_other_chat_denied_from_non_main() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        write_request(
            &requests,
            "1.json",
            &serde_json::json!({
                "requestId": "r1",
                "chatId": "tg:1",
                "workspaceFolder": "team",
                "timestamp": null,
                "type": "send_message",
                "text": "hi",
                "targetChatId": "tg:2",
            }),
        );

        let d = dispatcher(root.path().to_path_buf());
        d.poll_once().await;

        let results = root.path().join("team").join("results").join("r1.json");
        let content = fs::read_to_string(results).unwrap();
        let parsed: IpcResponse = serde_json::from_str(&content).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.error.as_deref(), Some("not_authorized"));
    }

    #[tokio::test]
    async fn register_chat_denied_from_non_main() {
        let root = tempdir().unwrap();
        let requests = root.path().join("team").join("requests");
        write_request(
            &requests,
            "1.json",
            &serde_json::json!({
                "requestId": "r1",
                "chatId": "tg:1",
                "workspaceFolder": "team",
                "timestamp": null,
                "type": "register_chat",
                "chatId": "tg:9",
                "name": "New",
                "folder": "newfolder",
                "trigger": "@Andy",
            }),
        );

        let d = dispatcher(root.path().to_path_buf());
        d.poll_once().await;

        let results = root.path().join("team").join("results").join("r1.json");
        let content = fs::read_to_string(results).unwrap();
        let parsed: IpcResponse = serde_json::from_str(&content).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.error.as_deref(), Some("not_authorized"));
    }

    #[test]
    fn config_defaults_ipc_poll_interval() {
        let config = Config::default();
        assert_eq!(config.orchestrator.ipc_poll_interval_ms, 500);
    }
}
