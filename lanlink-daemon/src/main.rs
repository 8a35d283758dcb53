mod config;

use anyhow::{Context, Result};
use clap::Parser;
use lanlink_protocol::{
    CoreEvent, Engine, EventBus, Registry, Scanner, Server, SCAN_DONE,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use config::Config;

/// LAN Link background daemon
#[derive(Debug, Parser)]
#[command(name = "lanlink-daemon", version, about)]
struct Args {
    /// Run a discovery sweep immediately after startup
    #[arg(long)]
    scan: bool,

    /// Override the configured display name for this session
    #[arg(long)]
    name: Option<String>,

    /// Override the configured port for this session
    #[arg(long)]
    port: Option<u16>,
}

/// Main daemon state
struct Daemon {
    engine: Arc<Engine>,
    scanner: Arc<Scanner>,
    events: UnboundedReceiver<CoreEvent>,
}

impl Daemon {
    fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let core = Arc::new(config.core_config());
        let registry = Arc::new(Registry::new());
        let (bus, events) = EventBus::channel();

        let engine = Arc::new(Engine::new(
            Arc::clone(&core),
            Arc::clone(&registry),
            bus.clone(),
        ));
        let scanner = Arc::new(Scanner::new(core, registry, bus));

        Ok(Self {
            engine,
            scanner,
            events,
        })
    }

    /// Run the daemon until a shutdown signal arrives
    async fn run(mut self, scan_on_start: bool) -> Result<()> {
        let config = self.engine.config();
        info!("LAN Link daemon running");
        info!("Device: {} ({})", config.device_name, config.device_id);
        info!("Inbox: {}", config.inbox_dir.display());

        let server = Server::bind(Arc::clone(&self.engine))
            .await
            .context("Failed to bind connection server")?;
        info!("Listening on {}", server.local_addr()?);

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Connection server failed: {}", e);
            }
        });

        if scan_on_start {
            let scanner = Arc::clone(&self.scanner);
            tokio::spawn(async move {
                if let Err(e) = scanner.scan_configured().await {
                    error!("Discovery sweep failed: {}", e);
                }
            });
        }

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => log_event(event),
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    self.scanner.stop();
                    break;
                }
            }
        }

        info!("Daemon shutdown complete");
        Ok(())
    }
}

/// Surface core events in the daemon log
fn log_event(event: CoreEvent) {
    match event {
        CoreEvent::DeviceFound(device) => {
            info!("Device found: {} ({}) at {}", device.name, device.os, device.addr);
        }
        CoreEvent::MessageReceived {
            sender_name, text, ..
        } => {
            info!("Message from {}: {}", sender_name, text);
        }
        CoreEvent::TransferUpdated {
            peer_id,
            transfer_id,
        } => {
            tracing::debug!("Transfer {} with {} updated", transfer_id, peer_id);
        }
        CoreEvent::ConversationSeen { peer_id } => {
            info!("Conversation with {} seen by peer", peer_id);
        }
        CoreEvent::ScanProgress(p) if p == SCAN_DONE => {
            info!("Discovery sweep finished");
        }
        CoreEvent::ScanProgress(p) => {
            tracing::debug!("Discovery sweep {:.0}% dispatched", p * 100.0);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting LAN Link daemon...");

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(name) = args.name {
        config.device.name = name;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }

    info!("Configuration loaded");
    info!("Device name: {}", config.device.name);
    info!("Port: {}", config.network.port);
    if config.network.enable_remote_exec {
        warn!("Remote command execution is ENABLED");
    }

    let daemon = Daemon::new(config).context("Failed to create daemon")?;
    daemon.run(args.scan).await
}
