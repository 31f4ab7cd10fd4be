//! Redis adapter for SONiC database operations
//!
//! Neighbor programming goes to APPL_DB `NEIGH_TABLE`, where orchagent picks
//! it up for the forwarding plane. Restart hints live in STATE_DB.
//! Topology notifications arrive as JSON on a pub/sub channel.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-8: Transmission Confidentiality - Database communication
//! - AU-3: Content of Audit Records - Database operations logged
//! - CP-10: System Recovery - Degraded operation while Redis is down

use crate::error::{ArpdError, Result};
use crate::hardware::{HardwarePlane, NeighborProgram};
use crate::persistence::{NeighborStore, PersistedNeighbor};
use crate::topology::{NotificationSource, TopologyEvent};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, PubSubStream};
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

/// Redis table names matching C++ constants
const APP_NEIGH_TABLE_NAME: &str = "NEIGH_TABLE";
const STATE_ARP_CACHE_TABLE_NAME: &str = "ARP_CACHE_TABLE";

const FAMILY_IPV4: &str = "IPv4";
const RECORD_FIELD: &str = "record";

/// Connect attempts per call while Redis is unreachable
const CONNECT_RETRIES: usize = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Calls fail fast for this long after a failed connect
const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Redis connection established on first use
///
/// A failed connect leaves the cell empty. Calls within [`CONNECT_BACKOFF`]
/// of the failure return an error without dialing; the next one retries.
pub struct LazyConnection {
    url: String,
    manager: OnceCell<ConnectionManager>,
    failed_at: Mutex<Option<Instant>>,
}

impl LazyConnection {
    pub fn new(host: &str, port: u16, db: i64) -> Self {
        Self {
            url: format!("redis://{}:{}/{}", host, port, db),
            manager: OnceCell::new(),
            failed_at: Mutex::new(None),
        }
    }

    fn manager_config() -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT)
    }

    fn in_backoff(&self) -> bool {
        self.failed_at
            .lock()
            .is_some_and(|at| at.elapsed() < CONNECT_BACKOFF)
    }

    async fn get(&self) -> Result<ConnectionManager> {
        if let Some(manager) = self.manager.get() {
            return Ok(manager.clone());
        }
        if self.in_backoff() {
            let backoff = RedisError::from((ErrorKind::IoError, "Redis unreachable, backing off"));
            return Err(backoff.into());
        }
        let result = self
            .manager
            .get_or_try_init(|| async {
                debug!(url = %self.url, "Connecting to Redis");
                let client = Client::open(self.url.as_str())?;
                ConnectionManager::new_with_config(client, Self::manager_config()).await
            })
            .await;
        match result {
            Ok(manager) => {
                *self.failed_at.lock() = None;
                Ok(manager.clone())
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Redis connect failed");
                *self.failed_at.lock() = Some(Instant::now());
                Err(e.into())
            }
        }
    }
}

/// `NEIGH_TABLE:<egress ifindex>:<ip>`
pub fn neigh_key(neighbor: &NeighborProgram) -> String {
    format!(
        "{}:{}:{}",
        APP_NEIGH_TABLE_NAME, neighbor.if_index, neighbor.ip
    )
}

fn neigh_fields(neighbor: &NeighborProgram) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("neigh", neighbor.mac.to_string()),
        ("family", FAMILY_IPV4.to_string()),
    ];
    if let Some(vlan) = neighbor.vlan {
        fields.push(("vlan", vlan.to_string()));
    }
    fields
}

/// `ARP_CACHE_TABLE|<ip>|<l3 ifindex>`
pub fn cache_key(record: &PersistedNeighbor) -> String {
    format!(
        "{}|{}|{}",
        STATE_ARP_CACHE_TABLE_NAME, record.ip, record.l3_if_index
    )
}

/// Hardware Sync through APPL_DB
///
/// # NIST Controls
/// - CM-3: Configuration Change Control - Neighbor programming
pub struct RedisHardwarePlane {
    appl_db: LazyConnection,
}

impl RedisHardwarePlane {
    pub fn new(host: &str, port: u16, db: i64) -> Self {
        Self {
            appl_db: LazyConnection::new(host, port, db),
        }
    }

    async fn write(&self, neighbor: &NeighborProgram, replace: bool) -> Result<()> {
        let key = neigh_key(neighbor);
        let fields = neigh_fields(neighbor);
        let result: Result<()> = async {
            let mut conn = self.appl_db.get().await?;
            if replace {
                // Drop stale fields such as a removed vlan
                let _: () = redis::pipe()
                    .atomic()
                    .del(&key)
                    .hset_multiple(&key, &fields)
                    .query_async(&mut conn)
                    .await?;
            } else {
                let _: () = conn.hset_multiple(&key, &fields).await?;
            }
            Ok(())
        }
        .await;
        result.map_err(|e| ArpdError::hardware(neighbor.ip, e.to_string()))
    }
}

#[async_trait]
impl HardwarePlane for RedisHardwarePlane {
    #[instrument(skip(self), fields(ip = %neighbor.ip, mac = %neighbor.mac))]
    async fn create_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        self.write(neighbor, false).await?;
        debug!(if_index = neighbor.if_index, "Neighbor created");
        Ok(())
    }

    #[instrument(skip(self), fields(ip = %neighbor.ip, mac = %neighbor.mac))]
    async fn update_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        self.write(neighbor, true).await?;
        debug!(if_index = neighbor.if_index, "Neighbor updated");
        Ok(())
    }

    #[instrument(skip(self), fields(ip = %neighbor.ip))]
    async fn delete_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        let key = neigh_key(neighbor);
        let result: Result<()> = async {
            let mut conn = self.appl_db.get().await?;
            let _: () = conn.del(&key).await?;
            Ok(())
        }
        .await;
        result.map_err(|e| ArpdError::hardware(neighbor.ip, e.to_string()))?;
        debug!(key, "Neighbor deleted");
        Ok(())
    }
}

/// Persistence layer in STATE_DB
pub struct RedisNeighborStore {
    state_db: LazyConnection,
}

impl RedisNeighborStore {
    pub fn new(host: &str, port: u16, db: i64) -> Self {
        Self {
            state_db: LazyConnection::new(host, port, db),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.state_db.get().await?;
        let pattern = format!("{}|*", STATE_ARP_CACHE_TABLE_NAME);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        Ok(keys)
    }
}

#[async_trait]
impl NeighborStore for RedisNeighborStore {
    #[instrument(skip(self), fields(ip = %record.ip))]
    async fn save(&self, record: PersistedNeighbor) -> Result<()> {
        let mut conn = self.state_db.get().await?;
        let json = serde_json::to_string(&record)?;
        let _: () = conn.hset(cache_key(&record), RECORD_FIELD, json).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(ip = %record.ip))]
    async fn remove(&self, record: PersistedNeighbor) -> Result<()> {
        let mut conn = self.state_db.get().await?;
        let _: () = conn.del(cache_key(&record)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all(&self) -> Result<Vec<PersistedNeighbor>> {
        let keys = self.keys().await?;
        let mut conn = self.state_db.get().await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let json: Option<String> = conn.hget(&key, RECORD_FIELD).await?;
            match json.map(|j| serde_json::from_str::<PersistedNeighbor>(&j)) {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => warn!(key, error = %e, "Skipping corrupt cache record"),
                None => warn!(key, "Cache record without payload"),
            }
        }
        debug!(count = records.len(), "Loaded persisted neighbors");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<()> {
        let keys = self.keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.state_db.get().await?;
        let _: () = conn.del(&keys).await?;
        debug!(count = keys.len(), "Cleared persisted neighbors");
        Ok(())
    }
}

/// Hardware-plane notifications published as JSON on a pub/sub channel
pub struct RedisNotificationSource {
    channel: String,
    messages: PubSubStream,
}

impl RedisNotificationSource {
    #[instrument(skip(host))]
    pub async fn subscribe(host: &str, port: u16, channel: &str) -> Result<Self> {
        let client = Client::open(format!("redis://{}:{}", host, port))?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!("Subscribed to topology notifications");
        Ok(Self {
            channel: channel.to_string(),
            messages: pubsub.into_on_message(),
        })
    }
}

/// Decodes one notification payload
pub fn parse_notification(payload: &[u8]) -> Result<TopologyEvent> {
    Ok(serde_json::from_slice(payload)?)
}

#[async_trait]
impl NotificationSource for RedisNotificationSource {
    async fn next_event(&mut self) -> Option<TopologyEvent> {
        while let Some(msg) = self.messages.next().await {
            match parse_notification(msg.get_payload_bytes()) {
                Ok(event) => return Some(event),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Dropping malformed notification")
                }
            }
        }
        None
    }
}
