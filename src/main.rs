use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use wa_gateway::config::OWNER_NUMBER_ENV;
use wa_gateway::monitor::{sample_rss, MemoryMonitor};
use wa_gateway::{
    http, BridgeConnector, GatewayConfig, GatewayState, LightweightStore, LoggingHandler,
    MultiFileAuthState, Settings, Supervisor, SupervisorExit,
};

/// Supervised WhatsApp bot gateway.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the JSON settings file.
    #[arg(long, default_value = "./settings.json")]
    settings: PathBuf,

    /// Directory holding credentials and signal keys.
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// JSON file backing the message store.
    #[arg(long)]
    store_file: Option<PathBuf>,

    /// WebSocket endpoint of the protocol client bridge.
    #[arg(long, env = "WA_BRIDGE_URL")]
    bridge: Option<String>,

    /// Phone number used for pairing codes and owner checks.
    #[arg(long)]
    owner_number: Option<String>,

    /// Serve /qr and /paircode on this address.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Directory served next to the pairing endpoints.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Exit when resident memory exceeds this many MB.
    #[arg(long)]
    memory_ceiling_mb: Option<u64>,

    /// Skip the client version lookup and use the built-in version.
    #[arg(long)]
    no_version_check: bool,

    /// Do not draw QR codes in the terminal.
    #[arg(long)]
    no_terminal_qr: bool,
}

impl Cli {
    fn into_config(self, settings: &Settings) -> GatewayConfig {
        let env_owner = std::env::var(OWNER_NUMBER_ENV).ok();
        let owner = self.owner_number.as_deref();
        let mut config = GatewayConfig::from_settings(settings, owner, env_owner.as_deref())
            .with_http_addr(self.http)
            .with_terminal_qr(!self.no_terminal_qr);
        if let Some(dir) = self.session_dir {
            config = config.with_session_dir(dir);
        }
        if let Some(path) = self.store_file {
            config = config.with_store_path(path);
        }
        if let Some(endpoint) = self.bridge {
            config = config.with_bridge_endpoint(endpoint);
        }
        if let Some(dir) = self.static_dir {
            config = config.with_static_dir(dir);
        }
        if let Some(ceiling) = self.memory_ceiling_mb {
            config = config.with_memory_ceiling_mb(ceiling);
        }
        if self.no_version_check {
            config = config.with_version_url(None);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::panic::set_hook(Box::new(|info| log::error!("panic: {info}")));

    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings)?;
    let config = cli.into_config(&settings);
    log::info!("starting {} (owner {})", config.bot_name, config.owner_number);

    let cancel = CancellationToken::new();
    let state = GatewayState::new();

    let store = Arc::new(LightweightStore::new(&config.store_path, config.max_store_messages));
    if let Err(err) = store.read_from_file() {
        log::warn!("could not load message store: {err}");
    }
    let writer = store.clone().spawn_writer(config.store_write_interval, cancel.clone());

    MemoryMonitor::new(config.memory_ceiling_mb, config.memory_sample_interval).spawn(
        sample_rss,
        cancel.clone(),
        |_| std::process::exit(1),
    );

    let server = config.http_addr.map(|addr| {
        let app = http::router(state.clone(), &config.static_dir);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = http::serve(addr, app, cancel).await {
                log::error!("pairing endpoint stopped: {err}");
            }
        })
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("shutting down"),
                Err(err) => log::error!("failed to listen for ctrl-c: {err}"),
            }
            cancel.cancel();
        }
    });

    let auth = MultiFileAuthState::open(&config.session_dir)?;
    let connector = Arc::new(BridgeConnector::new(config.bridge_endpoint.clone()));
    let handler = Arc::new(LoggingHandler);
    let supervisor = Supervisor::new(config, connector, auth, store, handler, state);

    match supervisor.run(cancel.clone()).await {
        SupervisorExit::Cancelled => {}
        SupervisorExit::LoggedOut => {
            log::warn!("logged out; delete the session directory and restart to pair again");
            cancel.cancelled().await;
        }
        SupervisorExit::RetriesExhausted => cancel.cancel(),
    }

    cancel.cancel();
    if let Err(err) = writer.await {
        log::error!("store writer task failed: {err}");
    }
    if let Some(server) = server {
        let _ = server.await;
    }
    Ok(())
}
