//! Scheduler → GroupQueue wiring.
//!
//! Builds the `TaskCallback` closure that the scheduler loop invokes for each
//! due task. The callback enqueues a `TaskFn` into `GroupQueue` that:
//! 1. Resolves the chat and session state
//! 2. Runs `run_container_agent()` with the task prompt
//! 3. Sends output through the Outbound Splitter
//! 4. Logs the run and advances next_run in Postgres

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use nanoclaw_core::{PgPool, RegisteredChat, SandboxInput, SandboxOutput, SandboxStatus, TaskRunLog};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::container::mounts::FolderInfo;
use crate::container::runner::{run_container_agent, write_snapshots, RunConfig};
use crate::container::security::ContainerConfig;
use crate::process_group::resolve_runtime;
use crate::queue::GroupQueue;
use crate::scheduler::{calculate_next_run, result_summary, DueTask, TaskCallback};
use crate::transport::TransportRegistry;

/// Build the `TaskCallback` that the scheduler loop invokes for each due task.
///
/// The callback captures all shared state and enqueues a `TaskFn` into the
/// `GroupQueue` for per-chat serialized execution.
#[allow(clippy::too_many_arguments)]
pub fn build_task_callback(
    pool: PgPool,
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredChat>>>,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    transports: Arc<TransportRegistry>,
    run_config: RunConfig,
    timezone: String,
    assistant_name: String,
) -> TaskCallback {
    Box::new(move |task: DueTask| {
        let pool = pool.clone();
        let queue = queue.clone();
        let groups = groups.clone();
        let sessions = sessions.clone();
        let transports = transports.clone();
        let run_config = run_config.clone();
        let timezone = timezone.clone();
        let assistant_name = assistant_name.clone();

        let task_id = task.id.clone();
        let chat_id = task.chat_id.clone();

        let queue_for_enqueue = queue.clone();

        let task_fn = Box::new(move || -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
            Box::pin(async move {
                run_scheduled_task(
                    task,
                    &pool,
                    &queue,
                    &groups,
                    &sessions,
                    &transports,
                    &run_config,
                    &timezone,
                    &assistant_name,
                )
                .await;
            })
        });

        // enqueue_task is async; spawn a small task to drive it.
        tokio::spawn(async move {
            queue_for_enqueue.enqueue_task(&chat_id, &task_id, task_fn).await;
        });
    })
}

/// Execute a single scheduled task inside a sandbox.
#[allow(clippy::too_many_arguments)]
async fn run_scheduled_task(
    task: DueTask,
    pool: &PgPool,
    queue: &Arc<GroupQueue>,
    groups: &Arc<RwLock<HashMap<String, RegisteredChat>>>,
    sessions: &Arc<RwLock<HashMap<String, String>>>,
    transports: &Arc<TransportRegistry>,
    run_config: &RunConfig,
    timezone: &str,
    assistant_name: &str,
) {
    let start = Instant::now();

    let group = {
        let g = groups.read().await;
        match g.values().find(|g| g.folder == task.workspace_folder) {
            Some(group) => group.clone(),
            None => {
                error!(
                    task_id = task.id.as_str(),
                    workspace_folder = task.workspace_folder.as_str(),
                    "scheduled task references unknown workspace folder"
                );
                log_and_update(pool, &task, start, None, Some("Unknown workspace folder"), timezone).await;
                return;
            }
        }
    };

    let is_main = false; // scheduled tasks never run as the privileged main chat

    let session_id = if task.context_mode == "group" {
        let s = sessions.read().await;
        s.get(&task.workspace_folder).cloned()
    } else {
        None // isolated tasks get a fresh session
    };

    let runtime = resolve_runtime(&group);
    let provider = Some(
        match runtime {
            nanoclaw_core::RuntimeKind::Claude => "anthropic",
            nanoclaw_core::RuntimeKind::Gemini => "code-assist",
            nanoclaw_core::RuntimeKind::Codex => "openai",
        }
        .to_string(),
    );

    let input = SandboxInput {
        prompt: task.prompt.clone(),
        session_id,
        workspace_folder: task.workspace_folder.clone(),
        chat_id: task.chat_id.clone(),
        is_main,
        scheduled_task_id: Some(task.id.clone()),
        context_mode: Some(task.context_mode.clone()),
        assistant_name: Some(assistant_name.to_string()),
        provider,
        model: group.model.clone(),
        secrets: None,
    };

    let folder_info = FolderInfo {
        folder: group.folder.clone(),
        name: group.name.clone(),
        container_config: group
            .container_config
            .as_ref()
            .and_then(|v| serde_json::from_value::<ContainerConfig>(v.clone()).ok()),
    };

    let transports_cb = transports.clone();
    let sessions_cb = sessions.clone();
    let pool_cb = pool.clone();
    let queue_cb = queue.clone();
    let chat_id_cb = task.chat_id.clone();
    let workspace_folder_cb = task.workspace_folder.clone();

    let result_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
    let error_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
    let result_cb = result_text.clone();
    let error_cb = error_text.clone();

    let on_output: Option<Arc<crate::container::runner::OutputCallback>> =
        Some(Arc::new(move |output: SandboxOutput| {
            let transports = transports_cb.clone();
            let sessions = sessions_cb.clone();
            let pool = pool_cb.clone();
            let queue = queue_cb.clone();
            let chat_id = chat_id_cb.clone();
            let workspace_folder = workspace_folder_cb.clone();
            let result_cb = result_cb.clone();
            let error_cb = error_cb.clone();

            let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
                if let Some(ref sid) = output.session_id {
                    let mut s = sessions.write().await;
                    s.insert(workspace_folder.clone(), sid.clone());
                    if let Err(e) = pool.set_session(&workspace_folder, sid).await {
                        warn!(err = %e, "failed to persist session");
                    }
                }

                if let Some(ref text) = output.result {
                    if !text.is_empty() {
                        if let Err(e) = transports.send(&chat_id, text).await {
                            error!(err = %e, "failed to send task output");
                        }
                        *result_cb.write().await = Some(text.clone());
                    }
                }

                if output.status == SandboxStatus::Error {
                    let err_msg = output.error.clone().unwrap_or_else(|| "Unknown error".into());
                    *error_cb.write().await = Some(err_msg);
                }

                if output.status == SandboxStatus::Success {
                    queue.notify_idle(&chat_id).await;
                }
            });
            fut
        }));

    // Snapshot current tasks for this folder so the sandbox can read its own
    // schedule without an IPC round trip.
    {
        let tasks_json = match pool.get_tasks_for_folder(&task.workspace_folder).await {
            Ok(tasks) => serde_json::to_string(&tasks).unwrap_or_else(|_| "[]".into()),
            Err(e) => {
                warn!(err = %e, "failed to load tasks for snapshot");
                "[]".into()
            }
        };
        write_snapshots(&run_config.data_dir, &task.workspace_folder, is_main, &tasks_json, None);
    }

    info!(
        task_id = task.id.as_str(),
        group = group.name.as_str(),
        "running scheduled task"
    );

    let container_result = run_container_agent(&folder_info, &input, runtime, is_main, run_config, on_output).await;

    let result = result_text.read().await.clone();
    let error = error_text.read().await.clone();

    let (final_result, final_error) = match container_result {
        Ok(run_result) => {
            if let Some(ref sid) = run_result.output.session_id {
                let mut s = sessions.write().await;
                s.insert(task.workspace_folder.clone(), sid.clone());
                if let Err(e) = pool.set_session(&task.workspace_folder, sid).await {
                    warn!(err = %e, "failed to persist session");
                }
            }

            if run_result.output.status == SandboxStatus::Error {
                let err = error
                    .or_else(|| run_result.output.error.clone())
                    .unwrap_or_else(|| "Unknown error".into());
                (result, Some(err))
            } else {
                (result.or(run_result.output.result), None)
            }
        }
        Err(e) => {
            error!(task_id = task.id.as_str(), err = %e, "task sandbox error");
            (result, Some(e.to_string()))
        }
    };

    log_and_update(pool, &task, start, final_result.as_deref(), final_error.as_deref(), timezone).await;
}

/// Log the task run and update next_run in Postgres.
async fn log_and_update(
    pool: &PgPool,
    task: &DueTask,
    start: Instant,
    result: Option<&str>,
    error: Option<&str>,
    timezone: &str,
) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let status = if error.is_some() { "error" } else { "success" };

    let log = TaskRunLog {
        task_id: task.id.clone(),
        run_at: chrono::Utc::now().to_rfc3339(),
        duration_ms,
        status: status.into(),
        result: result.map(|s| s.to_string()),
        error: error.map(|s| s.to_string()),
    };
    if let Err(e) = pool.log_task_run(&log).await {
        error!(task_id = task.id.as_str(), err = %e, "failed to log task run");
    }

    let next_run = calculate_next_run(&task.schedule_type, &task.schedule_value, timezone);
    let summary = result_summary(result, error);

    if let Err(e) = pool
        .update_task_after_run(&task.id, next_run.as_deref(), &summary)
        .await
    {
        error!(task_id = task.id.as_str(), err = %e, "failed to update task after run");
    }

    info!(
        task_id = task.id.as_str(),
        status,
        duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "scheduled task completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_summary_delegates() {
        assert_eq!(result_summary(Some("ok"), None), "ok");
        assert_eq!(result_summary(None, Some("fail")), "Error: fail");
    }
}
