//! Sandbox wire protocol types shared between `nanoclawd` and the agent
//! binary that runs inside each sandbox.
//!
//! - `SandboxInput`: the JSON envelope written to the sandbox's stdin.
//! - `SandboxOutput`: the JSON extracted from stdout between OUTPUT markers.
//! - `StreamEvent`: incremental streaming events (tool starts, text deltas).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeKind;

/// Sentinel markers for robust output parsing (see spec §4.5/§6).
pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Initial stdin payload written to a freshly spawned sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub workspace_folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Secrets injected via stdin, never written to disk or passed as env.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// A piped follow-up message, one JSON object per line after the initial envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipedMessage {
    pub kind: String,
    pub text: String,
}

impl PipedMessage {
    pub fn user_message(text: impl Into<String>) -> Self {
        Self {
            kind: "user_message".to_string(),
            text: text.into(),
        }
    }
}

/// Output payload extracted from sandbox stdout between OUTPUT markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOutput {
    pub status: SandboxStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<StreamEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Success,
    Error,
}

/// How a failed sandbox run should be treated by the Group Queue's retry
/// policy — distinct from the wire-level `SandboxStatus`, which only ever
/// carries `Success`/`Error` in the output framing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxFailure {
    /// Worth retrying: a flaky exit, a hard-kill by timeout, or an IPC write
    /// failure.
    #[error("transient sandbox failure: {0}")]
    Transient(String),
    /// Not worth retrying: malformed framing, a mount allowlist violation,
    /// or a configuration error. Surfaced to the user instead.
    #[error("permanent sandbox failure: {0}")]
    Permanent(String),
}

/// Incremental streaming event from the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ToolStart {
        #[serde(default, rename = "toolName")]
        tool_name: Option<String>,
        #[serde(default, rename = "toolInput")]
        tool_input: Option<String>,
    },
    TextDelta {
        #[serde(default)]
        text: Option<String>,
    },
}

/// Volume mount specification for sandbox execution.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
    /// Subdirectory names to hide via tmpfs overlay.
    pub exclude: Vec<String>,
}

/// Container image names keyed by provider.
pub fn container_image(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "nanoclaw-agent:latest",
        RuntimeKind::Gemini => "nanoclaw-agent-gemini:latest",
        RuntimeKind::Codex => "nanoclaw-agent-codex:latest",
    }
}

/// Runner source directory name for each provider.
pub fn runner_dir_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "agent-runner",
        RuntimeKind::Gemini => "gemini-runner",
        RuntimeKind::Codex => "codex-runner",
    }
}

/// Container mount path for runner source code.
/// Claude uses a flat layout at `/app/src`, others nest under their own dir.
pub fn runner_container_path(runtime: RuntimeKind) -> String {
    match runtime {
        RuntimeKind::Claude => "/app/src".to_string(),
        _ => format!("/app/{}/src", runner_dir_name(runtime)),
    }
}

/// Parses OUTPUT marker pairs from a byte buffer.
///
/// Returns a vec of extracted JSON strings and the number of bytes consumed.
/// Unconsumed bytes (incomplete marker pair) remain in the caller's buffer.
pub fn extract_output_markers(buf: &str) -> (Vec<String>, usize) {
    let mut results = Vec::new();
    let mut consumed = 0;

    let mut search_from = 0;
    loop {
        let start = match buf[search_from..].find(OUTPUT_START_MARKER) {
            Some(pos) => search_from + pos,
            None => break,
        };

        let after_start = start + OUTPUT_START_MARKER.len();
        let end = match buf[after_start..].find(OUTPUT_END_MARKER) {
            Some(pos) => after_start + pos,
            None => break, // incomplete pair, stop here
        };

        let json_str = buf[after_start..end].trim().to_string();
        results.push(json_str);

        consumed = end + OUTPUT_END_MARKER.len();
        search_from = consumed;
    }

    (results, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_input_serializes_camel_case() {
        let input = SandboxInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            workspace_folder: "main".to_string(),
            chat_id: "tg:123".to_string(),
            is_main: true,
            scheduled_task_id: None,
            context_mode: None,
            assistant_name: Some("Andy".to_string()),
            provider: None,
            model: None,
            secrets: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatId\""));
        assert!(json.contains("\"workspaceFolder\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"model\""));
        assert!(!json.contains("\"secrets\""));
    }

    #[test]
    fn sandbox_output_deserializes_success() {
        let json = r#"{"status":"success","result":"Hello!","sessionId":"sess-456"}"#;
        let output: SandboxOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, SandboxStatus::Success);
        assert_eq!(output.result.as_deref(), Some("Hello!"));
        assert_eq!(output.session_id.as_deref(), Some("sess-456"));
    }

    #[test]
    fn sandbox_output_error_status() {
        let json = r#"{"status":"error","result":null,"error":"Container exited with code 1"}"#;
        let output: SandboxOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, SandboxStatus::Error);
        assert!(output.result.is_none());
        assert!(output.error.is_some());
    }

    #[test]
    fn stream_event_tool_start() {
        let json = r#"{"type":"tool_start","toolName":"Read","toolInput":"/path/to/file"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::ToolStart { tool_name, tool_input } => {
                assert_eq!(tool_name.as_deref(), Some("Read"));
                assert_eq!(tool_input.as_deref(), Some("/path/to/file"));
            }
            _ => panic!("expected ToolStart"),
        }
    }

    #[test]
    fn extract_markers_single_pair() {
        let buf = format!(
            "some noise {}{{\"status\":\"success\",\"result\":\"hi\"}}{}trailing",
            OUTPUT_START_MARKER, OUTPUT_END_MARKER
        );
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], r#"{"status":"success","result":"hi"}"#);
        assert!(consumed > 0);
        assert_eq!(&buf[consumed..], "trailing");
    }

    #[test]
    fn extract_markers_multiple_pairs() {
        let buf = format!(
            "{s}{{\"status\":\"success\",\"result\":null}}{e}{s}{{\"status\":\"success\",\"result\":\"done\"}}{e}",
            s = OUTPUT_START_MARKER,
            e = OUTPUT_END_MARKER,
        );
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 2);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn extract_markers_incomplete_pair() {
        let buf = format!("{s}{{\"status\":\"success\"}}", s = OUTPUT_START_MARKER);
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 0);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn extract_markers_empty_buffer() {
        let (results, consumed) = extract_output_markers("");
        assert_eq!(results.len(), 0);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn container_image_names() {
        assert_eq!(container_image(RuntimeKind::Claude), "nanoclaw-agent:latest");
        assert_eq!(container_image(RuntimeKind::Gemini), "nanoclaw-agent-gemini:latest");
        assert_eq!(container_image(RuntimeKind::Codex), "nanoclaw-agent-codex:latest");
    }

    #[test]
    fn runner_container_paths() {
        assert_eq!(runner_container_path(RuntimeKind::Claude), "/app/src");
        assert_eq!(runner_container_path(RuntimeKind::Gemini), "/app/gemini-runner/src");
        assert_eq!(runner_container_path(RuntimeKind::Codex), "/app/codex-runner/src");
    }

    #[test]
    fn volume_mount_builder() {
        let mount = VolumeMount {
            host_path: "/home/user/projects".to_string(),
            container_path: "/workspace/project".to_string(),
            readonly: true,
            exclude: vec!["node_modules".to_string()],
        };
        assert!(mount.readonly);
        assert_eq!(mount.exclude.len(), 1);
    }
}
