//! Telegram transport — long-polls the Bot API for updates and delivers
//! agent replies back through the Outbound Splitter.
//!
//! Chat ids on this transport are namespaced `tg:<chat_id>` so the router
//! can dispatch a `chat_id` to the right transport without a lookup table.
//! Registration state (folder, trigger, runtime/model overrides) lives in
//! Postgres via `RegisteredChat`, not in a transport-local store — the
//! transport only needs enough to accept/normalize inbound updates.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use nanoclaw_core::PgPool;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::outbound::split_message;
use crate::transport::Transport;

pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const CHAT_ID_PREFIX: &str = "tg:";
const SEND_RETRY_ATTEMPTS: u32 = 3;
const SEND_RETRY_BASE_MS: u64 = 500;

pub struct TelegramTransport {
    client: Client,
    bot_token: Option<String>,
    pool: PgPool,
    last_update_id: AtomicI64,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct TelegramApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    date: i64,
    chat: TgChat,
    from: Option<TgUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
    title: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

impl TelegramTransport {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            client: Client::new(),
            bot_token,
            pool,
            last_update_id: AtomicI64::new(0),
            poll_interval,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some()
    }

    fn token(&self) -> anyhow::Result<&str> {
        self.bot_token
            .as_deref()
            .ok_or_else(|| anyhow!("TELEGRAM_BOT_TOKEN is not set"))
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let token = self.token()?;
        let offset = self.last_update_id.load(Ordering::SeqCst) + 1;
        let endpoint = format!("{TELEGRAM_API_BASE}/bot{token}/getUpdates");

        let response = self
            .client
            .get(&endpoint)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", "0".to_string()),
            ])
            .send()
            .await
            .context("getUpdates request failed")?;

        let envelope: TelegramApiEnvelope<Vec<Update>> = response
            .json()
            .await
            .context("failed to parse getUpdates response")?;

        if !envelope.ok {
            return Err(anyhow!(envelope
                .description
                .unwrap_or_else(|| "getUpdates returned ok=false".to_string())));
        }

        for update in envelope.result.unwrap_or_default() {
            self.last_update_id
                .fetch_max(update.update_id, Ordering::SeqCst);
            if let Some(message) = update.message {
                if let Err(e) = self.ingest_message(message).await {
                    warn!(err = %e, "failed to ingest telegram message");
                }
            }
        }

        Ok(())
    }

    async fn ingest_message(&self, message: TgMessage) -> anyhow::Result<()> {
        let Some(text) = message.text else {
            return Ok(());
        };

        let chat_id = format!("{CHAT_ID_PREFIX}{}", message.chat.id);
        let is_group = matches!(message.chat.chat_type.as_str(), "group" | "supergroup");
        let chat_name = message
            .chat
            .title
            .or_else(|| {
                let name = [message.chat.first_name.as_deref(), message.chat.last_name.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                if name.is_empty() { None } else { Some(name) }
            });
        let timestamp = chrono::DateTime::from_timestamp(message.date, 0)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();

        self.pool
            .store_chat_metadata(
                &chat_id,
                &timestamp,
                chat_name.as_deref(),
                Some("telegram"),
                Some(is_group),
            )
            .await?;

        let sender_name = message
            .from
            .as_ref()
            .map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
            .unwrap_or_else(|| "Unknown".to_string());
        let sender = message
            .from
            .map(|u| u.id.to_string())
            .unwrap_or_default();

        let new_message = nanoclaw_core::NewMessage {
            id: message.message_id.to_string(),
            chat_id,
            sender,
            sender_name,
            content: text,
            timestamp,
            is_from_me: false,
            is_bot_message: false,
        };

        self.pool.store_message(&new_message).await?;
        Ok(())
    }

    async fn send_chunk(&self, numeric_chat_id: &str, chunk: &str) -> anyhow::Result<()> {
        let token = self.token()?;
        let endpoint = format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(&endpoint)
                .json(&serde_json::json!({
                    "chat_id": numeric_chat_id,
                    "text": chunk,
                }))
                .send()
                .await
                .context("sendMessage request failed");

            match result {
                Ok(response) => {
                    let envelope: TelegramApiEnvelope<serde_json::Value> = response
                        .json()
                        .await
                        .context("failed to parse sendMessage response")?;
                    if envelope.ok {
                        return Ok(());
                    }
                    let msg = envelope
                        .description
                        .unwrap_or_else(|| "sendMessage returned ok=false".to_string());
                    if attempt >= SEND_RETRY_ATTEMPTS {
                        return Err(anyhow!(msg));
                    }
                    warn!(attempt, err = %msg, "sendMessage failed, retrying");
                }
                Err(e) => {
                    if attempt >= SEND_RETRY_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(attempt, err = %e, "sendMessage transport error, retrying");
                }
            }

            let backoff_ms = SEND_RETRY_BASE_MS * 2u64.pow(attempt - 1);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    fn owns_chat_id(&self, chat_id: &str) -> bool {
        chat_id.starts_with(CHAT_ID_PREFIX)
    }

    fn connect(&self, mut shutdown: watch::Receiver<bool>) -> BoxFuture<'static, anyhow::Result<()>> {
        if !self.is_enabled() {
            return Box::pin(async move {
                info!("telegram transport disabled (no TELEGRAM_BOT_TOKEN)");
                Ok(())
            });
        }

        // SAFETY-FREE: everything this closure touches is owned (Client is
        // Arc-backed internally, token/pool are cloneable), so we rebuild a
        // lightweight handle rather than requiring `Arc<Self>` at the call
        // site.
        let client = self.client.clone();
        let bot_token = self.bot_token.clone();
        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;

        Box::pin(async move {
            let transport = TelegramTransport {
                client,
                bot_token,
                pool,
                last_update_id: AtomicI64::new(0),
                poll_interval,
            };

            info!("telegram transport connected, starting poll loop");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(transport.poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("telegram transport shutting down");
                            return Ok(());
                        }
                    }
                }

                if let Err(e) = transport.poll_once().await {
                    debug!(err = %e, "telegram poll_once error");
                }
            }
        })
    }

    fn send<'a>(&'a self, chat_id: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if text.trim().is_empty() {
                return Err(anyhow!("cannot send an empty telegram message"));
            }
            let numeric_chat_id = chat_id.strip_prefix(CHAT_ID_PREFIX).unwrap_or(chat_id);
            let chunks = split_message(text, TELEGRAM_MAX_TEXT_CHARS);
            for chunk in &chunks {
                self.send_chunk(numeric_chat_id, chunk).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owns_chat_id_matches_prefix() {
        let pool = PgPool::new("postgres://localhost/test".to_string());
        let transport = TelegramTransport::new(pool, Duration::from_secs(1));
        assert!(transport.owns_chat_id("tg:12345"));
        assert!(!transport.owns_chat_id("other:12345"));
    }

    #[test]
    fn disabled_without_bot_token() {
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        let pool = PgPool::new("postgres://localhost/test".to_string());
        let transport = TelegramTransport::new(pool, Duration::from_secs(1));
        assert!(!transport.is_enabled());
    }
}
