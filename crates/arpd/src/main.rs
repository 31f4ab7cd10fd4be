//! ARP Neighbor Cache Daemon
//!
//! Main entry point for arpd.
//! Learns IPv4 neighbors on routed ports and syncs them to SONiC databases.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - File and command line configuration
//! - CP-10: System Recovery - Persisted neighbors reloaded on start

use anyhow::Context;
use clap::Parser;
use sonic_arpd::server::forward_notifications;
use sonic_arpd::{
    AfPacketIo, ArpClient, ArpDaemon, ArpDeps, ArpdConfig, MemoryNeighborStore, NeighborStore,
    RedisHardwarePlane, RedisNeighborStore, RedisNotificationSource, StaticTopology,
    config::DEFAULT_CONFIG_PATH,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// SONiC ARP neighbor cache daemon
#[derive(Parser, Debug)]
#[command(name = "arpd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Startup topology file, overrides the configured path
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides RUST_LOG
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Keep restart hints in memory only
    #[arg(long)]
    no_persistence: bool,
}

/// Wait before subscribing again after the notification bus drops
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Keeps the daemon subscribed to hardware-plane notifications
async fn track_topology(host: String, port: u16, channel: String, client: ArpClient) {
    loop {
        match RedisNotificationSource::subscribe(&host, port, &channel).await {
            Ok(source) => {
                info!(%channel, "arpd: Tracking topology notifications");
                forward_notifications(source, client.clone()).await;
            }
            Err(e) => warn!(%channel, error = %e, "arpd: Notification subscribe failed"),
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

/// Initialize structured logging
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    info!("arpd: Starting ARP neighbor cache daemon");

    let mut config = ArpdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(topology) = args.topology {
        config.topology.file = topology;
    }
    if args.no_persistence {
        config.database.persistence_enabled = false;
    }

    let db = &config.database;
    info!(
        redis_host = %db.redis_host,
        redis_port = db.redis_port,
        appl_db = db.appl_db,
        state_db = db.state_db,
        "arpd: Database settings"
    );

    let store: Arc<dyn NeighborStore> = if db.persistence_enabled {
        Arc::new(RedisNeighborStore::new(
            &db.redis_host,
            db.redis_port,
            db.state_db,
        ))
    } else {
        warn!("arpd: Persistence disabled, neighbors will not survive a restart");
        Arc::new(MemoryNeighborStore::new())
    };

    let topology = StaticTopology::load_or_empty(&config.topology.file)
        .with_context(|| format!("loading topology {}", config.topology.file.display()))?;

    let deps = ArpDeps {
        hardware: Arc::new(RedisHardwarePlane::new(
            &db.redis_host,
            db.redis_port,
            db.appl_db,
        )),
        store,
        io: Arc::new(AfPacketIo::new(config.capture.snaplen)),
        topology: Arc::new(topology),
    };

    let (redis_host, redis_port) = (db.redis_host.clone(), db.redis_port);
    let channel = config.topology.notification_channel.clone();
    let client = ArpDaemon::start(config, deps)
        .await
        .context("starting daemon")?;
    tokio::spawn(track_topology(redis_host, redis_port, channel, client));

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("arpd: Received SIGINT, exiting");
    Ok(())
}
