//! Configuration file support for arpd
//!
//! Loads and validates arpd configuration from TOML files.
//! Default location: /etc/sonic/arpd.conf
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated, defaulted settings
//! - CM-2: Baseline Configuration - Documented defaults

use crate::error::{ArpdError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/arpd.conf";

/// Aging state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgingConfig {
    /// Neighbor timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,

    /// Smallest timeout accepted by SetGlobalTimeout
    #[serde(default = "default_min_timeout_secs")]
    pub min_timeout_secs: u32,

    /// Seconds per aging tick
    #[serde(default = "default_granularity_secs")]
    pub granularity_secs: u32,

    /// Entries at or below this counter expire on the next tick
    #[serde(default = "default_min_retain_count")]
    pub min_retain_count: u32,

    /// Number of per-tick retries before expiry
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

/// Startup probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probes sent per interface
    #[serde(default = "default_probe_count")]
    pub count: u32,

    /// Upper bound of the random delay before the first probe
    #[serde(default = "default_probe_initial_delay_max_ms")]
    pub initial_delay_max_ms: u64,

    #[serde(default = "default_probe_interval_min_ms")]
    pub interval_min_ms: u64,

    #[serde(default = "default_probe_interval_max_ms")]
    pub interval_max_ms: u64,
}

/// Bulk query settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Period of the snapshot rebuild
    #[serde(default = "default_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,

    /// Largest page returned by one GetBulk
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

/// Packet capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Control-protocol EtherType excluded from capture
    #[serde(default = "default_control_ethertype")]
    pub control_ethertype: u16,

    #[serde(default = "default_snaplen")]
    pub snaplen: usize,

    /// Minimum spacing of requests triggered by passive IP observation
    #[serde(default = "default_observe_holdoff_ms")]
    pub observe_holdoff_ms: u64,
}

/// Topology settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Startup topology description
    #[serde(default = "default_topology_file")]
    pub file: PathBuf,

    /// Flush neighbors learned on ports that leave a VLAN or LAG
    #[serde(default)]
    pub flush_on_membership_change: bool,

    /// Redis pub/sub channel carrying hardware-plane notifications as JSON
    #[serde(default = "default_notification_channel")]
    pub notification_channel: String,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Database receiving neighbor programming (APPL_DB)
    #[serde(default = "default_appl_db")]
    pub appl_db: i64,

    /// Database holding the restart hint table (STATE_DB)
    #[serde(default = "default_state_db")]
    pub state_db: i64,

    #[serde(default = "default_persistence_enabled")]
    pub persistence_enabled: bool,
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Depth of the dispatcher's message queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Complete arpd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArpdConfig {
    #[serde(default)]
    pub aging: AgingConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

// Default functions
fn default_timeout_secs() -> u32 {
    600
}

fn default_min_timeout_secs() -> u32 {
    300
}

fn default_granularity_secs() -> u32 {
    1
}

fn default_min_retain_count() -> u32 {
    1
}

fn default_retry_count() -> u32 {
    5
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_initial_delay_max_ms() -> u64 {
    1000
}

fn default_probe_interval_min_ms() -> u64 {
    1000
}

fn default_probe_interval_max_ms() -> u64 {
    2000
}

fn default_rebuild_interval_secs() -> u64 {
    600
}

fn default_max_page_size() -> usize {
    1024
}

fn default_control_ethertype() -> u16 {
    // IEEE 802.3 slow protocols (LACP)
    0x8809
}

fn default_snaplen() -> usize {
    1518
}

fn default_observe_holdoff_ms() -> u64 {
    1000
}

fn default_topology_file() -> PathBuf {
    PathBuf::from("/etc/sonic/arpd_topology.toml")
}

fn default_notification_channel() -> String {
    "ARPD_TOPOLOGY_CHANNEL".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_appl_db() -> i64 {
    0
}

fn default_state_db() -> i64 {
    6
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_queue_depth() -> usize {
    1024
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_timeout_secs: default_min_timeout_secs(),
            granularity_secs: default_granularity_secs(),
            min_retain_count: default_min_retain_count(),
            retry_count: default_retry_count(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: default_probe_count(),
            initial_delay_max_ms: default_probe_initial_delay_max_ms(),
            interval_min_ms: default_probe_interval_min_ms(),
            interval_max_ms: default_probe_interval_max_ms(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_secs: default_rebuild_interval_secs(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            control_ethertype: default_control_ethertype(),
            snaplen: default_snaplen(),
            observe_holdoff_ms: default_observe_holdoff_ms(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            file: default_topology_file(),
            flush_on_membership_change: false,
            notification_channel: default_notification_channel(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            appl_db: default_appl_db(),
            state_db: default_state_db(),
            persistence_enabled: default_persistence_enabled(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

impl AgingConfig {
    /// Ticks in a full timeout
    pub fn full_timeout_counter(&self) -> u32 {
        self.timeout_secs / self.granularity_secs.max(1)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.granularity_secs as u64)
    }
}

impl ProbeConfig {
    pub fn initial_delay_max(&self) -> Duration {
        Duration::from_millis(self.initial_delay_max_ms)
    }
}

impl ArpdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content).map_err(|e| {
                    ArpdError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ArpdError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.bulk.rebuild_interval_secs)
    }

    pub fn observe_holdoff(&self) -> Duration {
        Duration::from_millis(self.capture.observe_holdoff_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let aging = &self.aging;
        if aging.granularity_secs == 0 {
            return Err(ArpdError::Config("granularity_secs must be > 0".to_string()));
        }
        if aging.timeout_secs < aging.min_timeout_secs {
            return Err(ArpdError::Config(format!(
                "timeout_secs {} is below min_timeout_secs {}",
                aging.timeout_secs, aging.min_timeout_secs
            )));
        }
        if aging.full_timeout_counter() <= aging.min_retain_count + aging.retry_count {
            return Err(ArpdError::Config(
                "timeout must leave room for the retry window".to_string(),
            ));
        }
        if self.probe.interval_min_ms > self.probe.interval_max_ms {
            return Err(ArpdError::Config(
                "probe interval_min_ms must be <= interval_max_ms".to_string(),
            ));
        }
        if self.bulk.rebuild_interval_secs == 0 {
            return Err(ArpdError::Config(
                "rebuild_interval_secs must be > 0".to_string(),
            ));
        }
        if self.bulk.max_page_size == 0 {
            return Err(ArpdError::Config("max_page_size must be > 0".to_string()));
        }
        if self.dispatcher.queue_depth == 0 {
            return Err(ArpdError::Config("queue_depth must be > 0".to_string()));
        }
        if self.database.redis_port == 0 {
            return Err(ArpdError::Config("redis_port must be > 0".to_string()));
        }
        Ok(())
    }
}
