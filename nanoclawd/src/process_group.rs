//! GroupQueue's `process_messages_fn` callback: runs when it's a chat's turn.
//!
//! Flow:
//! 1. Look up the registered chat from its chat_id in shared state
//! 2. Fetch pending messages from Postgres since the per-chat agent cursor
//! 3. Check the trigger for non-main chats
//! 4. Format the prompt from those messages
//! 5. Spawn the sandbox via `run_container_agent()`
//! 6. Stream output: route results through the Outbound Splitter
//! 7. Store bot responses in Postgres
//! 8. Advance the per-chat cursor only after a successful run has dispatched
//!    its output — a failed run with nothing sent leaves the cursor where it
//!    was, so the batch is retried from the same point

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use nanoclaw_core::{PgPool, RegisteredChat, RuntimeKind, SandboxInput, SandboxOutput, SandboxStatus};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::container::mounts::FolderInfo;
use crate::container::runner::{run_container_agent, OutputCallback, RunConfig};
use crate::container::security::ContainerConfig;
use crate::message_loop::{self};
use crate::queue::{GroupQueue, ProcessMessagesFn};
use crate::transport::TransportRegistry;

/// Build the `ProcessMessagesFn` closure that GroupQueue invokes for message processing.
///
/// The returned closure captures all shared state and is `Send + Sync`.
pub fn build_process_messages_fn(
    pool: PgPool,
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredChat>>>,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    transports: Arc<TransportRegistry>,
    assistant_name: String,
    main_group_folder: String,
    run_config: RunConfig,
) -> ProcessMessagesFn {
    Arc::new(move |chat_id: String| {
        let pool = pool.clone();
        let queue = queue.clone();
        let groups = groups.clone();
        let sessions = sessions.clone();
        let transports = transports.clone();
        let assistant_name = assistant_name.clone();
        let main_group_folder = main_group_folder.clone();
        let run_config = run_config.clone();

        Box::pin(async move {
            match process_group_messages(
                &chat_id,
                &pool,
                &queue,
                &groups,
                &sessions,
                &transports,
                &assistant_name,
                &main_group_folder,
                &run_config,
            )
            .await
            {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_id, err = %e, "processGroupMessages failed");
                    false
                }
            }
        })
    })
}

/// Core logic for processing messages for a single chat.
#[allow(clippy::too_many_arguments)]
async fn process_group_messages(
    chat_id: &str,
    pool: &PgPool,
    queue: &Arc<GroupQueue>,
    groups: &Arc<RwLock<HashMap<String, RegisteredChat>>>,
    sessions: &Arc<RwLock<HashMap<String, String>>>,
    transports: &Arc<TransportRegistry>,
    assistant_name: &str,
    main_group_folder: &str,
    run_config: &RunConfig,
) -> anyhow::Result<bool> {
    // 1. Look up chat registration
    let group = {
        let g = groups.read().await;
        match g.get(chat_id) {
            Some(group) => group.clone(),
            None => return Ok(true), // unknown chat — skip, not an error
        }
    };

    let is_main = group.folder == main_group_folder;

    // 2. Load agent timestamp and fetch pending messages
    let mut agent_timestamps = message_loop::load_agent_timestamps_pub(pool).await;
    let since = agent_timestamps
        .0
        .get(chat_id)
        .cloned()
        .unwrap_or_default();

    let pending = pool.get_messages_since(chat_id, &since, assistant_name).await?;

    if pending.is_empty() {
        return Ok(true);
    }

    // 3. Check trigger for non-main chats
    if !is_main && group.requires_trigger.unwrap_or(true) {
        let trigger = if group.trigger.is_empty() {
            None
        } else {
            Some(group.trigger.as_str())
        };
        let re = message_loop::build_trigger_regex_pub(assistant_name, trigger);
        let has_trigger = pending.iter().any(|m| re.is_match(m.content.trim()));
        if !has_trigger {
            return Ok(true);
        }
    }

    // 4. Format prompt
    let prompt = message_loop::format_messages_pub(&pending);

    // The cursor only advances once the run below succeeds and its output
    // has been dispatched — not before. A crash or failure mid-run leaves
    // `since` untouched so the next poll re-fetches the same batch.
    let new_cursor = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();

    info!(
        group = group.name.as_str(),
        message_count = pending.len(),
        "processing messages"
    );

    // 5. Resolve runtime, provider, and session
    let runtime = resolve_runtime(&group);
    let provider = resolve_provider(&group, runtime);
    let session_id = {
        let s = sessions.read().await;
        s.get(&group.folder).cloned()
    };

    let input = SandboxInput {
        prompt,
        session_id,
        workspace_folder: group.folder.clone(),
        chat_id: chat_id.to_string(),
        is_main,
        scheduled_task_id: None,
        context_mode: None,
        assistant_name: Some(assistant_name.to_string()),
        provider,
        model: group.model.clone(),
        secrets: None, // secrets are injected by the runner from env/credentials files
    };

    let folder_info = FolderInfo {
        folder: group.folder.clone(),
        name: group.name.clone(),
        container_config: group
            .container_config
            .as_ref()
            .and_then(|v| serde_json::from_value::<ContainerConfig>(v.clone()).ok()),
    };

    // 6. Run the sandbox and collect output
    let sessions_clone: Arc<RwLock<HashMap<String, String>>> = sessions.clone();
    let workspace_folder = group.folder.clone();
    let queue_clone: Arc<GroupQueue> = queue.clone();
    let chat_id_owned = chat_id.to_string();

    // Track whether we sent any output to the user
    let output_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let output_sent_cb = output_sent.clone();

    let transports_cb = transports.clone();
    let pool_cb = pool.clone();
    let assistant_name_cb = assistant_name.to_string();

    let on_output: Option<Arc<OutputCallback>> = Some(Arc::new(move |output: SandboxOutput| {
        let sessions = sessions_clone.clone();
        let workspace_folder = workspace_folder.clone();
        let queue = queue_clone.clone();
        let chat_id = chat_id_owned.clone();
        let transports = transports_cb.clone();
        let pool = pool_cb.clone();
        let assistant_name = assistant_name_cb.clone();
        let output_sent = output_sent_cb.clone();

        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            // Track session ID from the sandbox
            if let Some(ref sid) = output.session_id {
                let mut s = sessions.write().await;
                s.insert(workspace_folder.clone(), sid.clone());
                if let Err(e) = pool.set_session(&workspace_folder, sid).await {
                    warn!(err = %e, "failed to persist session");
                }
            }

            // Handle final result
            if let Some(ref result_text) = output.result {
                let text = strip_internal_blocks(result_text);
                if !text.is_empty() {
                    if let Err(e) = transports.send(&chat_id, &text).await {
                        error!(err = %e, "failed to send agent output");
                    }

                    let bot_msg = nanoclaw_core::NewMessage {
                        id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
                        chat_id: chat_id.clone(),
                        sender: "bot".into(),
                        sender_name: assistant_name.clone(),
                        content: text,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        is_from_me: true,
                        is_bot_message: true,
                    };
                    if let Err(e) = pool.store_message(&bot_msg).await {
                        warn!(err = %e, "failed to store bot response");
                    }

                    output_sent.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }

            // Notify the queue on completion so it can hand the sandbox
            // to the next waiting task or let it idle out.
            if output.status == SandboxStatus::Success {
                queue.notify_idle(&chat_id).await;
            }
        });
        fut
    }));

    let result = run_container_agent(&folder_info, &input, runtime, is_main, run_config, on_output).await;

    // 7. Handle result
    match result {
        Ok(run_result) => {
            if let Some(ref sid) = run_result.output.session_id {
                let mut s = sessions.write().await;
                s.insert(group.folder.clone(), sid.clone());
                if let Err(e) = pool.set_session(&group.folder, sid).await {
                    warn!(err = %e, "failed to persist session");
                }
            }

            if run_result.output.status == SandboxStatus::Error {
                if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                    // Output already reached the user — the batch was
                    // effectively handled, so advance past it instead of
                    // re-running it on retry.
                    warn!(
                        group = group.name.as_str(),
                        "agent error after output sent, advancing cursor past batch"
                    );
                    agent_timestamps.0.insert(chat_id.to_string(), new_cursor);
                    message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
                    return Ok(true);
                }

                if matches!(run_result.failure, Some(nanoclaw_core::SandboxFailure::Permanent(_))) {
                    warn!(
                        group = group.name.as_str(),
                        "permanent sandbox failure, surfacing to user without retry"
                    );
                    agent_timestamps.0.insert(chat_id.to_string(), new_cursor);
                    message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
                    let text = run_result
                        .output
                        .error
                        .clone()
                        .unwrap_or_else(|| "The assistant failed to respond.".to_string());
                    if let Err(e) = transports.send(chat_id, &text).await {
                        error!(chat_id, err = %e, "failed to send permanent failure notice");
                    }
                    return Ok(true);
                }

                warn!(
                    group = group.name.as_str(),
                    "agent error, cursor left unadvanced for retry"
                );
                return Ok(false);
            }

            agent_timestamps.0.insert(chat_id.to_string(), new_cursor);
            message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
            Ok(true)
        }
        Err(e) => {
            error!(group = group.name.as_str(), err = %e, "sandbox run error");

            if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                warn!(
                    group = group.name.as_str(),
                    "agent error after output sent, advancing cursor past batch"
                );
                agent_timestamps.0.insert(chat_id.to_string(), new_cursor);
                message_loop::save_agent_timestamps_pub(pool, &agent_timestamps).await;
                return Ok(true);
            }

            Ok(false)
        }
    }
}

/// Build the `ExhaustionFn` closure that `GroupQueue` invokes when a chat
/// folder's batch is abandoned after `MAX_ATTEMPTS` consecutive failures.
/// Forces the per-chat cursor past the poisoned batch (so it is never
/// re-fetched) and sends a user-visible notice to the chat.
pub fn build_on_exhausted_fn(
    pool: PgPool,
    transports: Arc<TransportRegistry>,
    assistant_name: String,
    max_attempts: u32,
) -> crate::queue::ExhaustionFn {
    Arc::new(move |chat_id: String| {
        let pool = pool.clone();
        let transports = transports.clone();
        let assistant_name = assistant_name.clone();

        Box::pin(async move {
            let mut agent_timestamps = message_loop::load_agent_timestamps_pub(&pool).await;
            let since = agent_timestamps.0.get(&chat_id).cloned().unwrap_or_default();

            let pending = pool
                .get_messages_since(&chat_id, &since, &assistant_name)
                .await
                .unwrap_or_default();

            if let Some(last) = pending.last() {
                agent_timestamps.0.insert(chat_id.clone(), last.timestamp.clone());
                message_loop::save_agent_timestamps_pub(&pool, &agent_timestamps).await;
            }

            let text = format!("The assistant failed to respond after {max_attempts} attempts.");
            if let Err(e) = transports.send(&chat_id, &text).await {
                error!(chat_id, err = %e, "failed to send exhaustion notice to chat");
            }
        })
    })
}

/// Resolve runtime kind from chat configuration.
pub(crate) fn resolve_runtime(group: &RegisteredChat) -> RuntimeKind {
    match group.runtime.as_deref() {
        Some("gemini") => RuntimeKind::Gemini,
        Some("codex") => RuntimeKind::Codex,
        _ => RuntimeKind::Claude, // default
    }
}

/// Resolve the provider string passed to the sandbox (e.g. "anthropic").
fn resolve_provider(group: &RegisteredChat, runtime: RuntimeKind) -> Option<String> {
    let _ = group;
    Some(
        match runtime {
            RuntimeKind::Claude => "anthropic",
            RuntimeKind::Gemini => "code-assist",
            RuntimeKind::Codex => "openai",
        }
        .to_string(),
    )
}

/// Strip `<internal>...</internal>` blocks from agent output.
fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</internal>") {
            rest = &rest[start + end + "</internal>".len()..];
        } else {
            rest = "";
            break;
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_basic() {
        let input = "Hello <internal>reasoning here</internal> World";
        assert_eq!(strip_internal_blocks(input), "Hello  World");
    }

    #[test]
    fn strip_internal_multiple() {
        let input = "A <internal>x</internal> B <internal>y</internal> C";
        assert_eq!(strip_internal_blocks(input), "A  B  C");
    }

    #[test]
    fn strip_internal_none() {
        assert_eq!(strip_internal_blocks("Hello World"), "Hello World");
    }

    #[test]
    fn strip_internal_unclosed() {
        let input = "Hello <internal>never closed";
        assert_eq!(strip_internal_blocks(input), "Hello");
    }

    #[test]
    fn strip_internal_multiline() {
        let input = "Before\n<internal>\nmulti\nline\n</internal>\nAfter";
        assert_eq!(strip_internal_blocks(input), "Before\n\nAfter");
    }

    fn sample_chat(runtime: Option<&str>) -> RegisteredChat {
        RegisteredChat {
            chat_id: "tg:123".into(),
            name: "Test".into(),
            folder: "test".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            requires_trigger: None,
            runtime: runtime.map(|s| s.to_string()),
            model: None,
        }
    }

    #[test]
    fn resolve_runtime_defaults_to_claude() {
        assert_eq!(resolve_runtime(&sample_chat(None)), RuntimeKind::Claude);
    }

    #[test]
    fn resolve_runtime_gemini() {
        assert_eq!(resolve_runtime(&sample_chat(Some("gemini"))), RuntimeKind::Gemini);
    }

    #[test]
    fn resolve_provider_matches_runtime() {
        let chat = sample_chat(Some("codex"));
        assert_eq!(
            resolve_provider(&chat, resolve_runtime(&chat)),
            Some("openai".to_string())
        );
    }
}
