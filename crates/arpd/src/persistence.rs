//! Persistence layer - restart hints for the neighbor cache
//!
//! Only `(ip, l3 interface)` survives a restart. Reloaded records become
//! pre-aged `Unresolved` entries so the aging engine re-verifies them
//! within a few ticks.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CP-10: System Recovery and Reconstitution - Crash-recovery hints
//! - SI-12: Information Management and Retention - Store wiped after reload

use crate::error::Result;
use crate::types::IfIndex;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Stored neighbor record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistedNeighbor {
    pub ip: Ipv4Addr,
    pub l3_if_index: IfIndex,
}

/// Restart hint store
#[async_trait]
pub trait NeighborStore: Send + Sync {
    async fn save(&self, record: PersistedNeighbor) -> Result<()>;

    async fn remove(&self, record: PersistedNeighbor) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<PersistedNeighbor>>;

    async fn clear(&self) -> Result<()>;
}

/// In-process store, used when persistence is disabled and in tests
#[derive(Debug, Default)]
pub struct MemoryNeighborStore {
    records: Mutex<BTreeMap<(Ipv4Addr, IfIndex), PersistedNeighbor>>,
}

impl MemoryNeighborStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with records, as if left over from a previous run
    pub fn with_records(records: impl IntoIterator<Item = PersistedNeighbor>) -> Self {
        let store = Self::default();
        store
            .records
            .lock()
            .extend(records.into_iter().map(|r| ((r.ip, r.l3_if_index), r)));
        store
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.records.lock().keys().any(|(stored, _)| *stored == ip)
    }
}

#[async_trait]
impl NeighborStore for MemoryNeighborStore {
    async fn save(&self, record: PersistedNeighbor) -> Result<()> {
        self.records
            .lock()
            .insert((record.ip, record.l3_if_index), record);
        Ok(())
    }

    async fn remove(&self, record: PersistedNeighbor) -> Result<()> {
        self.records.lock().remove(&(record.ip, record.l3_if_index));
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PersistedNeighbor>> {
        Ok(self.records.lock().values().copied().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}
