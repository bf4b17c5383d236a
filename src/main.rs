use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use scan_relay::config::{EngineSettings, PollSettings, Settings, DEFAULT_READY_MARKER};
use scan_relay::engine::ProcessSupervisor;
use scan_relay::ports::PortRange;
use scan_relay::server::{self, AppState};
use scan_relay::store::{MemorySessionStore, SessionStore};
use scan_relay::{ClientPool, JobMonitor};

/// scan-relay: runs scan engine processes and relays job progress over HTTP.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-relay",
    version,
    about = "Runs scan engine processes and relays job progress over HTTP.",
    long_about = None
)]
struct Cli {
    /// Address the HTTP API binds to.
    #[arg(long, env = "SCAN_RELAY_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Engine launcher script or binary.
    #[arg(long = "engine-bin", env = "ENGINE_BIN", default_value = "engine/zap.sh")]
    engine_bin: PathBuf,

    /// API key handed to every engine process.
    #[arg(long = "api-key", env = "ENGINE_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Root directory for per-process engine sessions.
    #[arg(long = "session-root", env = "ENGINE_SESSION_ROOT", default_value = "engine/sessions")]
    session_root: PathBuf,

    /// Host the engine API listens on.
    #[arg(long = "engine-host", env = "ENGINE_HOST", default_value = "127.0.0.1")]
    engine_host: String,

    /// Engine ports: a range (`9000-9100`) or a first port (`9000`).
    #[arg(long, env = "ENGINE_PORTS", default_value = "9000")]
    ports: PortRange,

    /// Line the engine prints once its API is up.
    #[arg(long = "ready-marker", env = "ENGINE_READY_MARKER", default_value = DEFAULT_READY_MARKER)]
    ready_marker: String,

    /// Engine API request timeout in milliseconds.
    #[arg(long = "request-timeout-ms", env = "ENGINE_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Delay before the first status poll, in milliseconds.
    #[arg(long = "poll-delay-ms", env = "POLL_DELAY_MS", default_value_t = 5_000)]
    poll_delay_ms: u64,

    /// Period between status polls, in milliseconds.
    #[arg(long = "poll-interval-ms", env = "POLL_INTERVAL_MS", default_value_t = 5_000)]
    poll_interval_ms: u64,

    /// Extra attempts for a failing status poll.
    #[arg(long = "poll-max-retries", env = "POLL_MAX_RETRIES", default_value_t = 5)]
    poll_max_retries: u32,

    /// Pause between poll attempts, in milliseconds.
    #[arg(long = "poll-backoff-ms", env = "POLL_BACKOFF_MS", default_value_t = 500)]
    poll_backoff_ms: u64,

    /// Wait between starting the inner crawl and the active scan, in milliseconds.
    #[arg(long = "explore-settle-ms", env = "EXPLORE_SETTLE_MS", default_value_t = 10_000)]
    explore_settle_ms: u64,

    /// Start the shared engine at boot instead of on first spider scan.
    #[arg(long = "warm-shared", env = "WARM_SHARED", default_value_t = false)]
    warm_shared: bool,

    /// Maximum log level.
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings::new()
            .with_engine(EngineSettings {
                binary: self.engine_bin.clone(),
                api_key: self.api_key.clone(),
                session_root: self.session_root.clone(),
                host: self.engine_host.clone(),
                ready_marker: self.ready_marker.clone(),
                request_timeout: Duration::from_millis(self.request_timeout_ms),
            })
            .with_ports(self.ports)
            .with_poll(PollSettings {
                delay: Duration::from_millis(self.poll_delay_ms),
                interval: Duration::from_millis(self.poll_interval_ms),
                max_retries: self.poll_max_retries,
                retry_backoff: Duration::from_millis(self.poll_backoff_ms),
            })
            .with_explore_settle(Duration::from_millis(self.explore_settle_ms))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = cli.settings();
    info!(
        bind = %cli.bind,
        engine = %settings.engine.binary.display(),
        sessions = %settings.engine.session_root.display(),
        ports = %format!("{}-{}", settings.ports.first(), settings.ports.last()),
        poll_interval_ms = cli.poll_interval_ms,
        "scan-relay configuration"
    );

    let supervisor = ProcessSupervisor::new(settings.engine.clone())
        .context("failed to build engine supervisor")?;
    let pool = Arc::new(ClientPool::new(Arc::new(supervisor), settings.ports));
    let sessions = Arc::new(MemorySessionStore::new());
    let store: Arc<dyn SessionStore> = sessions.clone();
    let monitor = JobMonitor::new(pool.clone(), store, settings);

    if cli.warm_shared {
        let shared = pool
            .get_or_create_shared_client()
            .await
            .context("failed to start shared engine")?;
        info!(client_id = %shared.id(), port = shared.port(), "shared engine ready");
    }

    let served = server::spawn_server(
        &cli.bind,
        AppState::new(monitor.clone(), sessions),
        shutdown_signal(),
    )
    .await;

    // a clean exit has already shut the monitors down
    if served.is_err() {
        monitor.shutdown().await;
    }
    served
}
