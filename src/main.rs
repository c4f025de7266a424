//! Dreams Chat Server
//!
//! Web chat backend: an HTTP API for accounts and conversations, and a
//! WebSocket relay that fans messages out to everyone in a conversation.

mod api;
mod auth;
mod config;
mod relay;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api::AppState;
use auth::AuthService;
use config::{Settings, DEFAULT_CONFIG_FILE};
use relay::{Relay, RelayPolicy};
use server::{RelayServer, ServerConfig};
use store::Store;

/// Dreams Chat Server
///
/// HTTP API plus per-conversation WebSocket relay
#[derive(Parser, Debug)]
#[command(name = "dreams-chat")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (TOML); missing files fall back to defaults
    #[arg(short, long, env = "DREAMS_CHAT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Bind address for both listeners
    #[arg(long, env = "DREAMS_CHAT_BIND")]
    bind: Option<String>,

    /// HTTP API port
    #[arg(long, env = "DREAMS_CHAT_API_PORT")]
    api_port: Option<u16>,

    /// WebSocket relay port
    #[arg(short, long = "ws-port", env = "DREAMS_CHAT_WS_PORT")]
    port: Option<u16>,

    /// SQLite database file
    #[arg(long, env = "DREAMS_CHAT_DATABASE")]
    database: Option<PathBuf>,

    /// Directory served for paths the API does not handle
    #[arg(long, env = "DREAMS_CHAT_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Do not deliver messages back to their sender
    #[arg(long)]
    no_echo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Overlay command line values on top of file settings
    fn apply(&self, settings: &mut Settings) {
        if let Some(bind) = &self.bind {
            settings.server.bind = bind.clone();
        }
        if let Some(port) = self.api_port {
            settings.server.api_port = port;
        }
        if let Some(port) = self.port {
            settings.server.ws_port = port;
        }
        if let Some(path) = &self.database {
            settings.database.path = path.clone();
        }
        if let Some(dir) = &self.static_dir {
            settings.server.static_dir = Some(dir.clone());
        }
        if self.no_echo {
            settings.relay.echo_to_sender = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Dreams Chat v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(&args.config)?;
    args.apply(&mut settings);
    settings.validate()?;

    if !settings.relay.echo_to_sender {
        info!("Echo to sender disabled");
    }

    let store = Store::open(&settings.database.path).await?;
    info!("Database ready at {}", settings.database.path.display());

    let auth = AuthService::from_settings(store.clone(), &settings);
    auth.purge_expired().await?;

    let relay = Arc::new(Relay::new(
        Arc::new(auth.clone()),
        Arc::new(store.clone()),
        RelayPolicy::from(&settings),
    ));
    let ws_server = Arc::new(RelayServer::new(
        ServerConfig::from_settings(&settings),
        Arc::clone(&relay),
    ));
    let state = Arc::new(AppState::new(store, auth, relay));

    // Spawn shutdown signal handler
    let (shutdown_tx, mut api_shutdown) = broadcast::channel::<()>(1);
    let ws_handle = Arc::clone(&ws_server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        ws_handle.shutdown();
        let _ = shutdown_tx.send(());
    });

    let api = api::serve(&settings, state, async move {
        let _ = api_shutdown.recv().await;
    });
    tokio::try_join!(api, ws_server.run())?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
