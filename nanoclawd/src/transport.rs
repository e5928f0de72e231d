//! Transport abstraction — the seam between chat platforms and the router.
//!
//! A `Transport` owns a connection to one chat platform (Telegram today; the
//! trait exists so a second platform can be added without touching the
//! router, queue, or IPC dispatcher). Transports are responsible for
//! normalizing inbound messages into Postgres via `PgPool::store_message`,
//! and for sending outbound text through the Outbound Splitter.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// A chat platform the orchestrator can receive from and send to.
///
/// Implementations own their own connection lifecycle (long-poll loop,
/// webhook listener, websocket, etc.) and are expected to run that loop as a
/// background task started by `connect`. `send` must apply the Outbound
/// Splitter before making platform calls so callers never have to reason
/// about platform-specific length limits.
///
/// Trait methods return boxed futures (rather than `async fn`) so the trait
/// stays object-safe for `Arc<dyn Transport>` without an extra proc-macro
/// dependency; `futures::future::BoxFuture` is already on the dependency
/// tree via the container runner.
pub trait Transport: Send + Sync {
    /// Platform name, e.g. "telegram". Used in chat_id prefixes and logs.
    fn name(&self) -> &str;

    /// True if this transport owns (can route messages for) the given
    /// chat_id — determined by the platform-specific id prefix.
    fn owns_chat_id(&self, chat_id: &str) -> bool;

    /// Start the transport's connection/poll loop. Returns once the
    /// transport has established its connection; the ongoing receive loop
    /// runs in the background until `shutdown` fires.
    fn connect(&self, shutdown: watch::Receiver<bool>) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Send `text` to `chat_id`, splitting into multiple platform messages
    /// as needed. Sends are sequential and awaited; this function only
    /// returns once the last segment has either been accepted or permanently
    /// failed after retry.
    fn send<'a>(&'a self, chat_id: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A set of transports, dispatched by `chat_id` prefix.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
        }
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn find(&self, chat_id: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.owns_chat_id(chat_id))
            .cloned()
    }

    /// Send `text` to `chat_id` via whichever registered transport owns it.
    pub async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        match self.find(chat_id) {
            Some(transport) => transport.send(chat_id, text).await,
            None => Err(anyhow::anyhow!(
                "no transport registered for chat_id `{chat_id}`"
            )),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.iter()
    }
}
