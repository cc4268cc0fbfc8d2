mod config_commands;
mod db_commands;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    parley_config::{ParleyConfig, Severity},
    parley_gateway::{Exit, Gateway},
    parley_session::SidecarTransport,
    parley_store::{MemoryStore, SqliteStore, Store},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "parley", about = "Parley, a chat-bot gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, short, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
    /// Custom config directory (overrides the user config dir).
    #[arg(long, global = true, env = "PARLEY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Custom data directory (overrides the user data dir).
    #[arg(long, global = true, env = "PARLEY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Keep history, rate windows and usage in memory only.
    #[arg(long, global = true, default_value_t = false)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (default when no subcommand is provided).
    Gateway,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Database management (reset, clear, migrate).
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    // Directory overrides must land before anything resolves a path.
    if let Some(ref dir) = cli.config_dir {
        parley_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        parley_config::set_data_dir(dir.clone());
    }

    match cli.command {
        None | Some(Commands::Gateway) => run_gateway(&cli).await,
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
        Some(Commands::Db { action }) => {
            let config = config_commands::load(cli.config.as_deref())?;
            db_commands::handle_db(action, &config).await
        },
    }
}

async fn run_gateway(cli: &Cli) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "parley starting");

    let mut config = config_commands::load(cli.config.as_deref())?;
    if let Some(ref bind) = cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    preflight(&config)?;

    let store = open_store(&config, cli.ephemeral).await?;
    let transport = Arc::new(SidecarTransport::new(&config.session));
    info!(sidecar = transport.url(), "using chat sidecar");

    let gateway = Gateway::build(&config, store, transport).await?;
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for interrupt, shutting down"),
        }
        signal.cancel();
    });

    match gateway.run(listener, shutdown).await? {
        Exit::Shutdown => {
            info!("parley stopped");
            Ok(())
        },
        Exit::ReconnectExhausted { attempts } => {
            error!(attempts, "chat session could not be restored, exiting");
            Err(parley_common::Error::ReconnectExhausted { attempts }.into())
        },
    }
}

/// Log warnings and refuse to start on validation errors.
fn preflight(config: &ParleyConfig) -> anyhow::Result<()> {
    let result = parley_config::validate(config);
    for d in &result.diagnostics {
        match d.severity {
            Severity::Error => error!(path = d.path, "{}", d.message),
            Severity::Warning => warn!(path = d.path, "{}", d.message),
        }
    }
    if result.has_errors() {
        anyhow::bail!(
            "configuration has {} error(s); run `parley config check` for details",
            result.count(Severity::Error)
        );
    }
    Ok(())
}

async fn open_store(config: &ParleyConfig, ephemeral: bool) -> anyhow::Result<Arc<dyn Store>> {
    if ephemeral {
        info!("ephemeral mode, nothing is persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if config.store.database_url.is_none() {
        std::fs::create_dir_all(parley_config::data_dir())?;
    }
    let url = parley_config::database_url(config);
    let store = SqliteStore::open(&url).await?;
    info!(url = %url, "store opened");
    Ok(Arc::new(store))
}
