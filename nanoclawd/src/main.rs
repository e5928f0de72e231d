mod container;
mod ipc;
mod message_loop;
mod outbound;
mod process_group;
mod queue;
mod scheduler;
mod scheduler_wiring;
mod telegram;
mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use nanoclaw_core::{load_config, Config, PgPool, RegisteredChat};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use container::runner::RunConfig;
use container::security::{default_allowlist_path, load_allowlist};
use ipc::{IpcDispatcher, IpcDispatcherConfig};
use queue::GroupQueue;
use telegram::TelegramTransport;
use transport::{Transport, TransportRegistry};

/// How long folder workers and transports are given to wind down on shutdown
/// before sandboxes are force-killed (spec §5, `SHUTDOWN_GRACE`).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "nanoclawd", version, about = "NanoClaw host orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the nanoclawd host process.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON and exit.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
}

/// Shared registered-chat snapshot, keyed by chat id (spec §3 `RegisteredChat`).
type Chats = HashMap<String, RegisteredChat>;
/// Shared session state: workspace folder → agent session id (spec §3 `Session`).
type Sessions = HashMap<String, String>;

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<Config>,
    db: Option<PgPool>,
    queue: Arc<GroupQueue>,
    chats: Arc<RwLock<Chats>>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    runtime_profiles: usize,
    postgres_connected: bool,
    orchestrator_enabled: bool,
    registered_chats: usize,
    active_sandboxes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/nanoclaw.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let project_root =
        std::env::current_dir().context("failed to resolve current working directory")?;
    let folders_dir = project_root.join("folders");
    let data_dir = project_root.join("data");
    let ipc_dir = data_dir.join("ipc");

    if let Err(e) = container::runner::ensure_runtime_available().await {
        warn!(err = %e, "container runtime unavailable at startup — sandbox runs will fail");
    } else {
        match container::runner::cleanup_orphans().await {
            Ok(n) if n > 0 => info!(count = n, "cleaned up orphaned sandboxes from a prior run"),
            Ok(_) => {}
            Err(e) => warn!(err = %e, "failed to scan for orphaned sandboxes"),
        }
    }

    let db = if let Some(ref dsn) = config.storage.postgres_dsn {
        if !dsn.trim().is_empty() {
            let pool = PgPool::new(dsn.clone());
            match pool.connect().await {
                Ok(()) => {
                    info!("postgres persistence layer connected");
                    Some(pool)
                }
                Err(e) => {
                    error!(err = %e, "postgres connection failed");
                    return Err(anyhow!("failed to connect to Postgres: {e}"));
                }
            }
        } else {
            None
        }
    } else {
        None
    };

    let queue = Arc::new(GroupQueue::new(
        config.orchestrator.max_concurrent_containers,
        config.orchestrator.max_attempts,
        ipc_dir.clone(),
    ));

    let chats: Arc<RwLock<Chats>> = Arc::new(RwLock::new(HashMap::new()));
    let sessions: Arc<RwLock<Sessions>> = Arc::new(RwLock::new(HashMap::new()));

    if let Some(ref pool) = db {
        match pool.get_all_registered_chats().await {
            Ok(loaded) => {
                info!(count = loaded.len(), "loaded registered chats from Postgres");
                *chats.write().await = loaded;
            }
            Err(e) => warn!(err = %e, "failed to load registered chats, starting empty"),
        }
        match pool.get_all_sessions().await {
            Ok(loaded) => {
                info!(count = loaded.len(), "loaded sessions from Postgres");
                *sessions.write().await = loaded;
            }
            Err(e) => warn!(err = %e, "failed to load sessions, starting empty"),
        }
    }

    let mut transport_registry = TransportRegistry::new();
    let telegram: Arc<TelegramTransport> = if let Some(ref pool) = db {
        let t = Arc::new(TelegramTransport::new(
            pool.clone(),
            Duration::from_millis(config.orchestrator.router_poll_interval_ms),
        ));
        transport_registry.register(t.clone() as Arc<dyn Transport>);
        t
    } else {
        Arc::new(TelegramTransport::new(
            PgPool::new(String::new()),
            Duration::from_millis(config.orchestrator.router_poll_interval_ms),
        ))
    };
    let transports = Arc::new(transport_registry);

    let allowlist = load_allowlist(&default_allowlist_path());

    let run_config = RunConfig {
        project_root: project_root.clone(),
        folders_dir,
        data_dir: data_dir.clone(),
        timezone: config.scheduler.timezone.clone(),
        idle_timeout_ms: config.orchestrator.idle_timeout_ms,
        container_timeout_ms: config.orchestrator.container_timeout_ms,
        ipc_poll_interval_ms: config.orchestrator.ipc_poll_interval_ms,
        allowlist,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        started_at: Instant::now(),
        config: Arc::new(config),
        db: db.clone(),
        queue: queue.clone(),
        chats: chats.clone(),
        shutdown_tx: shutdown_tx.clone(),
    };

    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // Transports — each owns its own connect/poll loop (spec §4.1).
    if telegram.is_enabled() {
        let telegram = telegram.clone();
        let telegram_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = telegram.connect(telegram_shutdown).await {
                error!(err = %e, "telegram transport exited with error");
            }
        }));
    }

    if let Some(ref pool) = db {
        // Outbound/inbound data flow only runs when the store is wired up
        // (spec §2 dependency order: Store → ... → Host wiring).
        let process_fn = process_group::build_process_messages_fn(
            pool.clone(),
            queue.clone(),
            chats.clone(),
            sessions.clone(),
            transports.clone(),
            state.config.orchestrator.assistant_name.clone(),
            state.config.orchestrator.main_group_folder.clone(),
            run_config.clone(),
        );
        queue.set_process_messages_fn(process_fn).await;

        let on_exhausted_fn = process_group::build_on_exhausted_fn(
            pool.clone(),
            transports.clone(),
            state.config.orchestrator.assistant_name.clone(),
            state.config.orchestrator.max_attempts,
        );
        queue.set_on_exhausted_fn(on_exhausted_fn).await;

        let ml_config = message_loop::MessageLoopConfig {
            poll_interval_ms: state.config.orchestrator.poll_interval_ms,
            assistant_name: state.config.orchestrator.assistant_name.clone(),
            main_group_folder: state.config.orchestrator.main_group_folder.clone(),
        };
        let ml_pool = pool.clone();
        let ml_queue = queue.clone();
        let ml_chats = chats.clone();
        let ml_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            message_loop::run_message_loop(ml_config, ml_pool, ml_queue, ml_chats, ml_shutdown).await;
        }));

        let sched_config = scheduler::SchedulerConfig {
            poll_interval: Duration::from_millis(state.config.scheduler.poll_interval_ms),
            timezone: state.config.scheduler.timezone.clone(),
            enabled: state.config.scheduler.enabled,
        };
        let task_callback = scheduler_wiring::build_task_callback(
            pool.clone(),
            queue.clone(),
            chats.clone(),
            sessions.clone(),
            transports.clone(),
            run_config.clone(),
            state.config.scheduler.timezone.clone(),
            state.config.orchestrator.assistant_name.clone(),
        );
        let sched_pool = pool.clone();
        let sched_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            scheduler::run_scheduler_loop(sched_config, sched_pool, task_callback, sched_shutdown).await;
        }));

        let ipc_config = IpcDispatcherConfig {
            ipc_root: ipc_dir.clone(),
            poll_interval: Duration::from_millis(state.config.orchestrator.ipc_poll_interval_ms),
            main_folder: state.config.orchestrator.main_group_folder.clone(),
        };
        let dispatcher = IpcDispatcher::new(ipc_config, pool.clone(), chats.clone(), transports.clone());
        let ipc_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            dispatcher.run(ipc_shutdown).await;
        }));

        info!("orchestrator wired: message loop, scheduler, IPC dispatcher active");
    } else {
        warn!("no Postgres DSN configured — orchestrator disabled, transports run in listen-only mode");
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/config", get(dump_config))
        .route("/v1/shutdown", post(trigger_shutdown))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "nanoclawd listening");
    let mut shutdown_signal_rx = shutdown_rx.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = wait_for_os_signal() => {}
                _ = shutdown_signal_rx.changed() => {}
            }
        })
        .await
        .context("control-plane server exited unexpectedly");

    info!("shutdown cascading to workers");
    let _ = shutdown_tx.send(true);
    queue.shutdown(SHUTDOWN_GRACE).await;
    for handle in background {
        let _ = handle.await;
    }

    result
}

/// Waits for SIGINT or, on unix, SIGTERM — whichever arrives first.
async fn wait_for_os_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "nanoclawd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let chats_count = state.chats.read().await.len();
    let active = state.queue.active_count().await;
    Json(ReadyResponse {
        status: "ready",
        runtime_profiles: state.config.runtimes.profiles.len(),
        postgres_connected: state.db.is_some(),
        orchestrator_enabled: state.db.is_some(),
        registered_chats: chats_count,
        active_sandboxes: active,
    })
}

/// Dumps the fully-resolved, env-overridden config (spec §6 control-plane surface).
async fn dump_config(State(state): State<AppState>) -> Json<Config> {
    Json((*state.config).clone())
}

#[derive(Serialize)]
struct ShutdownResponse {
    status: &'static str,
}

/// Triggers the same graceful-shutdown cascade as SIGINT/SIGTERM.
async fn trigger_shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    warn!("graceful shutdown requested via control plane");
    let _ = state.shutdown_tx.send(true);
    Json(ShutdownResponse { status: "shutting_down" })
}
