//! IPC types shared between sandbox agents and the `nanoclawd` host.
//!
//! A sandbox writes a JSON file into `<ipc_root>/<folder>/requests/` for every
//! RPC it wants to make. The host polls that directory, validates and
//! authorizes each file, dispatches it, and — for request/response
//! operations — writes a reply to `<ipc_root>/<folder>/results/<requestId>.json`
//! before deleting the request file.

use serde::{Deserialize, Serialize};

/// The full envelope written by a sandbox for every IPC request (spec §4.4/§6).
/// `op` carries the operation-specific payload; everything else is common framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(rename = "workspaceFolder")]
    pub workspace_folder: String,
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub op: IpcOp,
}

/// Operation-specific payload, tagged on the `type` field of the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcOp {
    SendMessage {
        text: String,
        #[serde(rename = "targetChatId")]
        target_chat_id: Option<String>,
    },
    ScheduleTask {
        id: Option<String>,
        prompt: String,
        #[serde(rename = "scheduleType")]
        schedule_type: String,
        #[serde(rename = "scheduleValue")]
        schedule_value: String,
        #[serde(default = "default_context_mode", rename = "contextMode")]
        context_mode: String,
        #[serde(rename = "targetFolder")]
        target_folder: Option<String>,
    },
    ListTasks {
        #[serde(default = "default_scope")]
        scope: String,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RegisterChat {
        #[serde(rename = "chatId")]
        chat_id: String,
        name: String,
        folder: String,
        trigger: String,
        #[serde(default = "default_true", rename = "requiresTrigger")]
        requires_trigger: bool,
    },
}

impl IpcOp {
    /// The snake_case operation name, matching the wire `type` tag — used for
    /// authorization-matrix lookups and audit logging.
    pub fn name(&self) -> &'static str {
        match self {
            IpcOp::SendMessage { .. } => "send_message",
            IpcOp::ScheduleTask { .. } => "schedule_task",
            IpcOp::ListTasks { .. } => "list_tasks",
            IpcOp::PauseTask { .. } => "pause_task",
            IpcOp::ResumeTask { .. } => "resume_task",
            IpcOp::CancelTask { .. } => "cancel_task",
            IpcOp::RegisterChat { .. } => "register_chat",
        }
    }
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_scope() -> String {
    "own".to_string()
}

fn default_true() -> bool {
    true
}

/// Authorization failures a call site can match on, as opposed to the
/// free-form `error: Option<String>` carried by every other `IpcResponse`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("not_authorized")]
    NotAuthorized,
}

/// Response written to `<ipc_root>/<folder>/results/<requestId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl IpcResponse {
    pub fn ok(data: impl Into<Option<serde_json::Value>>) -> Self {
        Self {
            ok: true,
            error: None,
            data: data.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: None,
        }
    }

    pub fn not_authorized() -> Self {
        Self::error(IpcError::NotAuthorized.to_string())
    }
}

/// Context for authorization decisions — derived from the IPC directory path
/// the request file was found under (never from the request body itself, so
/// a sandbox cannot claim to be a different folder than it is mounted as).
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    pub workspace_folder: String,
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(workspace_folder: impl Into<String>, main_folder_name: &str) -> Self {
        let workspace_folder = workspace_folder.into();
        let is_main = workspace_folder == main_folder_name;
        Self {
            workspace_folder,
            is_main,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_roundtrip() {
        let json = r#"{"requestId":"r1","chatId":"tg:1","workspaceFolder":"main","timestamp":"2026-01-01T00:00:00Z","type":"send_message","text":"hi","targetChatId":null}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.op.name(), "send_message");
        match req.op {
            IpcOp::SendMessage { text, target_chat_id } => {
                assert_eq!(text, "hi");
                assert!(target_chat_id.is_none());
            }
            _ => panic!("expected SendMessage"),
        }
    }

    #[test]
    fn schedule_task_defaults_context_mode() {
        let json = r#"{"chatId":"tg:1","workspaceFolder":"main","timestamp":null,"type":"schedule_task","id":null,"prompt":"p","scheduleType":"once","scheduleValue":"2026-01-01T00:00:00Z","targetFolder":null}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        match req.op {
            IpcOp::ScheduleTask { context_mode, .. } => assert_eq!(context_mode, "isolated"),
            _ => panic!("expected ScheduleTask"),
        }
    }

    #[test]
    fn list_tasks_defaults_scope_own() {
        let json = r#"{"chatId":"tg:1","workspaceFolder":"team","timestamp":null,"type":"list_tasks"}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        match req.op {
            IpcOp::ListTasks { scope } => assert_eq!(scope, "own"),
            _ => panic!("expected ListTasks"),
        }
    }

    #[test]
    fn register_chat_defaults_requires_trigger_true() {
        let json = r#"{"chatId":"tg:2","workspaceFolder":"main","timestamp":null,"type":"register_chat","chatId":"tg:2","name":"Team","folder":"team","trigger":"@Andy"}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        match req.op {
            IpcOp::RegisterChat { requires_trigger, .. } => assert!(requires_trigger),
            _ => panic!("expected RegisterChat"),
        }
    }

    #[test]
    fn ipc_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn response_not_authorized_shape() {
        let resp = IpcResponse::not_authorized();
        assert!(!resp.ok);
        assert_eq!(resp.error.as_deref(), Some("not_authorized"));
    }
}
