use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtimes: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control-plane HTTP bind address (health, config dump, shutdown).
    pub bind: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub postgres_dsn: Option<String>,
    pub ipc_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            postgres_dsn: None,
            ipc_dir: "ipc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub default_runtime: String,
    pub profiles: BTreeMap<String, RuntimeProfile>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "claude".to_string(),
            RuntimeProfile {
                provider: "anthropic".to_string(),
                default_model: "claude-opus-4-6".to_string(),
                required_env: vec!["CLAUDE_CODE_OAUTH_TOKEN".to_string()],
            },
        );
        profiles.insert(
            "gemini".to_string(),
            RuntimeProfile {
                provider: "code-assist".to_string(),
                default_model: "gemini-3.1-pro".to_string(),
                required_env: vec![
                    "GEMINI_REFRESH_TOKEN".to_string(),
                    "GEMINI_OAUTH_CLIENT_ID".to_string(),
                    "GEMINI_OAUTH_CLIENT_SECRET".to_string(),
                ],
            },
        );
        profiles.insert(
            "codex".to_string(),
            RuntimeProfile {
                provider: "openai".to_string(),
                default_model: "gpt-5.3-codex".to_string(),
                required_env: vec![
                    "CODEX_OAUTH_ACCESS_TOKEN".to_string(),
                    "CODEX_OAUTH_REFRESH_TOKEN".to_string(),
                    "CODEX_OAUTH_ID_TOKEN".to_string(),
                    "CODEX_OAUTH_ACCOUNT_ID".to_string(),
                ],
            },
        );

        Self {
            default_runtime: "claude".to_string(),
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub provider: String,
    pub default_model: String,
    pub required_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent sandboxes across all folders.
    pub max_concurrent_containers: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing sandbox stdin (milliseconds).
    pub idle_timeout_ms: u64,
    /// Hard wall-clock timeout per sandbox run (milliseconds).
    pub container_timeout_ms: u64,
    /// Consecutive failures tolerated on a batch before it is abandoned.
    pub max_attempts: u32,
    /// IPC directory poll cadence (milliseconds).
    pub ipc_poll_interval_ms: u64,
    /// Router fallback poll cadence for push-only transports (milliseconds).
    pub router_poll_interval_ms: u64,
    /// Folder name for the privileged main chat.
    pub main_group_folder: String,
    /// Assistant name used to build the default trigger regex.
    pub assistant_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 2,
            poll_interval_ms: 1000,
            idle_timeout_ms: 300_000,
            container_timeout_ms: 1_800_000,
            max_attempts: 3,
            ipc_poll_interval_ms: 500,
            router_poll_interval_ms: 2000,
            main_group_folder: "main".to_string(),
            assistant_name: "Andy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let config = if !path.exists() {
        Config::default().with_env_overrides()
    } else {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let parsed: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        parsed.with_env_overrides()
    };

    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("NANOCLAWD_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(dsn) = std::env::var("NANOCLAW_POSTGRES_DSN") {
            if !dsn.trim().is_empty() {
                self.storage.postgres_dsn = Some(dsn);
            }
        }

        if let Ok(name) = std::env::var("ASSISTANT_NAME") {
            if !name.trim().is_empty() {
                self.orchestrator.assistant_name = name;
            }
        }

        self
    }

    /// Rejects configurations that would make every sandbox run always hit
    /// the hard wall timeout instead of the intended idle-close path.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.orchestrator.idle_timeout_ms >= self.orchestrator.container_timeout_ms {
            bail!(
                "orchestrator.idle_timeout_ms ({}) must be less than orchestrator.container_timeout_ms ({})",
                self.orchestrator.idle_timeout_ms,
                self.orchestrator.container_timeout_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_runtime_profiles() {
        let cfg = Config::default();
        assert!(cfg.runtimes.profiles.contains_key("claude"));
        assert!(cfg.runtimes.profiles.contains_key("gemini"));
        assert!(cfg.runtimes.profiles.contains_key("codex"));
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults are valid");
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.server.request_timeout_ms, 30_000);
        assert!(parsed.runtimes.profiles.contains_key("claude"));
    }

    #[test]
    fn rejects_idle_timeout_at_or_above_container_timeout() {
        let mut cfg = Config::default();
        cfg.orchestrator.idle_timeout_ms = cfg.orchestrator.container_timeout_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn assistant_name_env_override() {
        std::env::set_var("ASSISTANT_NAME", "Custodian");
        let cfg = Config::default().with_env_overrides();
        assert_eq!(cfg.orchestrator.assistant_name, "Custodian");
        std::env::remove_var("ASSISTANT_NAME");
    }
}
