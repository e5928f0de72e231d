pub mod config;
pub mod container;
pub mod ipc;
pub mod runtime;
pub mod store;

pub use config::{Config, OrchestratorConfig, SchedulerConfig, load_config};
pub use container::{
    container_image, extract_output_markers, runner_container_path, runner_dir_name,
    PipedMessage, SandboxFailure, SandboxInput, SandboxOutput, SandboxStatus, StreamEvent,
    VolumeMount, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
};
pub use ipc::{IpcError, IpcGroupContext, IpcOp, IpcRequest, IpcResponse};
pub use runtime::RuntimeKind;
pub use store::{
    ChatInfo, ConversationMessage, NewMessage, PgPool, RegisteredChat, ScheduledTask, TaskRunLog,
    TaskUpdate,
};
