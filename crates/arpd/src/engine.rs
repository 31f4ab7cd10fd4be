//! Cache store and aging engine
//!
//! [`ArpEngine`] is owned by the dispatcher task and is the only code that
//! mutates the neighbor cache or the topology mirror. Every forwarding-plane
//! change is made before the matching cache change; a failed hardware call
//! leaves the entry as it was so a later tick retries. The exception is an
//! egress move whose old key was deleted and could not be restored: the
//! entry drops back to unresolved and rediscovery starts.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-7: Information Integrity - Cache never diverges from hardware
//! - AC-3: Access Enforcement - RIB-owned entries are protected from user deletes
//! - AU-12: Audit Record Generation - Every binding change is logged and published
//! - CP-10: System Recovery - Persisted hints reloaded at startup

use crate::cache::{AgingPolicy, NeighborCache};
use crate::capture::PacketIo;
use crate::config::{ArpdConfig, ProbeConfig};
use crate::error::{ArpdError, Result};
use crate::hardware::{HardwarePlane, NeighborProgram};
use crate::persistence::{NeighborStore, PersistedNeighbor};
use crate::receiver::ReceiverSet;
use crate::server::ArpMessage;
use crate::topology::{AddressPlan, MembershipDiff, TopologyEvent, TopologyMirror};
use crate::transmitter::Transmitter;
use crate::types::{
    ActionRequest, BulkPage, IfIndex, MacAddress, NeighborEntry, NeighborEvent, NeighborMac,
    NeighborOwner, NeighborState, Placement,
};
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Where an update's evidence came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Packet seen on a physical port
    Port(IfIndex),
    /// Request against a routed interface with no specific port
    L3Interface(IfIndex),
}

/// Evidence about one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborUpdate {
    pub ip: Ipv4Addr,
    pub mac: NeighborMac,
    pub source: UpdateSource,
    pub owner: NeighborOwner,
}

impl NeighborUpdate {
    /// Binding observed on the wire
    pub fn learned(ip: Ipv4Addr, mac: MacAddress, port: IfIndex) -> Self {
        Self {
            ip,
            mac: NeighborMac::Resolved(mac),
            source: UpdateSource::Port(port),
            owner: NeighborOwner::PassivelyLearned,
        }
    }

    /// Address someone is looking for, binding not yet known
    pub fn placeholder(ip: Ipv4Addr, port: IfIndex) -> Self {
        Self {
            ip,
            mac: NeighborMac::Unresolved,
            source: UpdateSource::Port(port),
            owner: NeighborOwner::PassivelyLearned,
        }
    }
}

/// Collaborators the engine drives
pub struct EngineContext {
    pub hardware: Arc<dyn HardwarePlane>,
    pub store: Arc<dyn NeighborStore>,
    pub io: Arc<dyn PacketIo>,
    /// Dispatcher queue, handed to receive loops
    pub dispatch: mpsc::Sender<ArpMessage>,
    pub events: broadcast::Sender<NeighborEvent>,
}

/// Hardware programming failure
struct ProgramFailure {
    error: ArpdError,
    /// The previous binding was deleted and could not be restored
    cleared: bool,
}

impl From<ArpdError> for ProgramFailure {
    fn from(error: ArpdError) -> Self {
        Self {
            error,
            cleared: false,
        }
    }
}

pub struct ArpEngine {
    cache: NeighborCache,
    policy: AgingPolicy,
    min_timeout_secs: u32,
    topology: TopologyMirror,
    plan: watch::Sender<Arc<AddressPlan>>,
    receivers: ReceiverSet,
    hardware: Arc<dyn HardwarePlane>,
    store: Arc<dyn NeighborStore>,
    transmitter: Transmitter,
    events: broadcast::Sender<NeighborEvent>,
    probe: ProbeConfig,
    max_page_size: usize,
    flush_on_membership_change: bool,
    observe_holdoff: Duration,
    /// Last request triggered by IP observation, per address
    observed: HashMap<Ipv4Addr, Instant>,
}

impl ArpEngine {
    pub fn new(config: &ArpdConfig, topology: TopologyMirror, ctx: EngineContext) -> Self {
        let (plan, plan_rx) = watch::channel(Arc::new(topology.address_plan()));
        let receivers = ReceiverSet::new(
            ctx.io.clone(),
            plan_rx,
            ctx.dispatch,
            config.capture.control_ethertype,
        );
        Self {
            cache: NeighborCache::new(),
            policy: AgingPolicy::from_config(&config.aging),
            min_timeout_secs: config.aging.min_timeout_secs,
            topology,
            plan,
            receivers,
            hardware: ctx.hardware,
            store: ctx.store,
            transmitter: Transmitter::new(ctx.io),
            events: ctx.events,
            probe: config.probe.clone(),
            max_page_size: config.bulk.max_page_size,
            flush_on_membership_change: config.topology.flush_on_membership_change,
            observe_holdoff: config.observe_holdoff(),
            observed: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &NeighborCache {
        &self.cache
    }

    pub fn topology(&self) -> &TopologyMirror {
        &self.topology
    }

    pub fn policy(&self) -> AgingPolicy {
        self.policy
    }

    pub fn receivers(&self) -> &ReceiverSet {
        &self.receivers
    }

    pub fn receivers_mut(&mut self) -> &mut ReceiverSet {
        &mut self.receivers
    }

    /// Reloads persisted hints, then starts receive loops and startup probes
    #[instrument(skip(self))]
    pub async fn bootstrap(&mut self) {
        self.reload_persisted().await;
        let ports: Vec<IfIndex> = self
            .topology
            .ports()
            .map(|p| p.if_index)
            .filter(|p| self.topology.is_receivable(*p))
            .collect();
        for port in ports {
            self.start_port(port);
        }
        info!(
            neighbors = self.cache.len(),
            receive_loops = self.receivers.running(),
            "Bootstrap complete"
        );
    }

    async fn reload_persisted(&mut self) {
        match self.store.load_all().await {
            Ok(records) => {
                for record in records {
                    if self.cache.contains(&record.ip) {
                        continue;
                    }
                    if self.topology.l3_interface(record.l3_if_index).is_none() {
                        debug!(ip = %record.ip, l3 = record.l3_if_index, "Dropping hint for unknown interface");
                        continue;
                    }
                    self.cache.insert(NeighborEntry {
                        ip: record.ip,
                        mac: NeighborMac::Unresolved,
                        port: None,
                        vlan: self.topology.vlan(record.l3_if_index).map(|v| v.vlan_id),
                        l3_if_index: record.l3_if_index,
                        aging_counter: self.policy.reload_counter(),
                        last_resolved_at: None,
                        owner: NeighborOwner::PassivelyLearned,
                        persisted: false,
                    });
                }
                info!(count = self.cache.len(), "Reloaded persisted neighbors");
            }
            Err(e) => warn!(error = %e, "Failed to load persisted neighbors"),
        }
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Failed to clear persisted neighbors");
        }
    }

    fn placement_for(&self, source: UpdateSource) -> Result<Placement> {
        match source {
            UpdateSource::Port(port) => self
                .topology
                .placement_for_port(port)
                .ok_or(ArpdError::NoL3Mapping(port)),
            UpdateSource::L3Interface(l3) => {
                self.topology
                    .l3_interface(l3)
                    .ok_or(ArpdError::NoL3Mapping(l3))?;
                Ok(Placement {
                    port: None,
                    vlan: self.topology.vlan(l3).map(|v| v.vlan_id),
                    l3_if_index: l3,
                })
            }
        }
    }

    fn egress_for(&self, port: Option<IfIndex>, l3_if_index: IfIndex) -> IfIndex {
        port.map(|p| self.topology.egress_index(p))
            .unwrap_or(l3_if_index)
    }

    /// Forwarding-plane view of a resolved entry
    fn program_for(&self, entry: &NeighborEntry) -> Option<NeighborProgram> {
        Some(NeighborProgram {
            ip: entry.ip,
            mac: entry.mac.mac()?,
            vlan: entry.vlan,
            if_index: self.egress_for(entry.port, entry.l3_if_index),
        })
    }

    /// Programs `new`, replacing whatever `old` programmed
    ///
    /// A failed create after the old key was deleted restores `old`. If the
    /// restore fails too, the failure reports the binding as cleared.
    async fn program(
        &self,
        old: Option<NeighborProgram>,
        new: &NeighborProgram,
    ) -> std::result::Result<(), ProgramFailure> {
        match old {
            None => Ok(self.hardware.create_neighbor(new).await?),
            Some(old) if old.if_index == new.if_index => {
                Ok(self.hardware.update_neighbor(new).await?)
            }
            Some(old) => {
                // Key changes with the egress index
                self.hardware.delete_neighbor(&old).await?;
                let Err(error) = self.hardware.create_neighbor(new).await else {
                    return Ok(());
                };
                match self.hardware.create_neighbor(&old).await {
                    Ok(()) => {
                        debug!(ip = %old.ip, if_index = old.if_index, "Previous neighbor restored");
                        Err(error.into())
                    }
                    Err(e) => {
                        warn!(ip = %old.ip, error = %e, "Failed to restore previous neighbor");
                        Err(ProgramFailure {
                            error,
                            cleared: true,
                        })
                    }
                }
            }
        }
    }

    /// Drops the resolution of an entry whose hardware binding is gone
    fn lose_binding(&mut self, ip: Ipv4Addr) {
        let Some(entry) = self.cache.get_mut(&ip) else {
            return;
        };
        entry.mac = NeighborMac::Unresolved;
        let (l3_if_index, port) = (entry.l3_if_index, entry.port);
        warn!(%ip, "Hardware binding lost, neighbor awaiting rediscovery");
        self.emit(NeighborEvent::Updated {
            ip,
            mac: NeighborMac::Unresolved,
            l3_if_index,
            port,
        });
        self.send_discovery(ip);
    }

    fn emit(&self, event: NeighborEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&self, entry: &mut NeighborEntry) {
        if entry.persisted {
            return;
        }
        let record = PersistedNeighbor {
            ip: entry.ip,
            l3_if_index: entry.l3_if_index,
        };
        match self.store.save(record).await {
            Ok(()) => entry.persisted = true,
            Err(e) => warn!(ip = %entry.ip, error = %e, "Failed to persist neighbor"),
        }
    }

    /// Applies packet or resolve evidence for one address
    #[instrument(skip(self), fields(ip = %update.ip, mac = %update.mac))]
    pub async fn apply_update(&mut self, update: NeighborUpdate) -> Result<()> {
        let placement = match self.placement_for(update.source) {
            Ok(placement) => placement,
            Err(e) => {
                error!(source = ?update.source, error = %e, "Update without L3 mapping dropped");
                return Err(e);
            }
        };
        let existing = self.cache.get(&update.ip).cloned();
        let full = self.policy.full;

        if let Some(current) = &existing {
            // Unresolved evidence never downgrades a resolution
            if current.mac.is_resolved() && !update.mac.is_resolved() {
                if let Some(entry) = self.cache.get_mut(&update.ip) {
                    entry.owner = entry.owner.merge(update.owner);
                }
                return Ok(());
            }
            if current.mac == update.mac && current.placement() == placement {
                if let Some(entry) = self.cache.get_mut(&update.ip) {
                    entry.aging_counter = full;
                    entry.owner = entry.owner.merge(update.owner);
                }
                return Ok(());
            }
        }

        let owner = existing
            .as_ref()
            .map_or(update.owner, |e| e.owner.merge(update.owner));
        let mut entry = NeighborEntry {
            ip: update.ip,
            mac: update.mac,
            port: placement.port,
            vlan: placement.vlan,
            l3_if_index: placement.l3_if_index,
            aging_counter: full,
            last_resolved_at: existing.as_ref().and_then(|e| e.last_resolved_at),
            owner,
            persisted: existing.as_ref().is_some_and(|e| e.persisted),
        };

        let event = match update.mac {
            NeighborMac::Unresolved => None,
            NeighborMac::Resolved(mac) => {
                let old = existing.as_ref().and_then(|e| self.program_for(e));
                let was_resolved = old.is_some();
                let new = NeighborProgram {
                    ip: update.ip,
                    mac,
                    vlan: placement.vlan,
                    if_index: self.egress_for(placement.port, placement.l3_if_index),
                };
                if let Err(failure) = self.program(old, &new).await {
                    warn!(error = %failure.error, "Hardware sync failed, update aborted");
                    if failure.cleared {
                        self.lose_binding(update.ip);
                    }
                    return Err(failure.error);
                }
                entry.last_resolved_at = Some(Utc::now());
                Some(if was_resolved {
                    NeighborEvent::Updated {
                        ip: update.ip,
                        mac: update.mac,
                        l3_if_index: placement.l3_if_index,
                        port: placement.port,
                    }
                } else {
                    NeighborEvent::Learned {
                        ip: update.ip,
                        mac,
                        l3_if_index: placement.l3_if_index,
                        port: placement.port,
                    }
                })
            }
        };

        self.persist(&mut entry).await;
        let is_new = self.cache.insert(entry);
        match &event {
            Some(NeighborEvent::Learned { .. }) => info!(new = is_new, "Neighbor learned"),
            Some(_) => info!("Neighbor updated"),
            None => debug!(new = is_new, "Neighbor awaiting resolution"),
        }
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Hardware delete, persistence removal and cache removal
    async fn remove_entry(&mut self, ip: Ipv4Addr) -> Result<NeighborEntry> {
        let entry = self
            .cache
            .get(&ip)
            .cloned()
            .ok_or(ArpdError::NeighborNotFound(ip))?;
        if let Some(program) = self.program_for(&entry) {
            if let Err(e) = self.hardware.delete_neighbor(&program).await {
                warn!(%ip, error = %e, "Hardware delete failed, entry kept");
                return Err(e);
            }
        }
        if entry.persisted {
            let record = PersistedNeighbor {
                ip,
                l3_if_index: entry.l3_if_index,
            };
            if let Err(e) = self.store.remove(record).await {
                warn!(%ip, error = %e, "Failed to remove persisted neighbor");
            }
        }
        self.cache.remove(&ip);
        info!(%ip, l3 = entry.l3_if_index, "Neighbor deleted");
        self.emit(NeighborEvent::Deleted {
            ip,
            l3_if_index: entry.l3_if_index,
        });
        Ok(entry)
    }

    /// Withdraws a RIB entry's binding and restarts discovery
    async fn reset_entry(&mut self, ip: Ipv4Addr) -> Result<()> {
        let Some(entry) = self.cache.get(&ip).cloned() else {
            return Err(ArpdError::NeighborNotFound(ip));
        };
        if let Some(program) = self.program_for(&entry) {
            if let Err(e) = self.hardware.delete_neighbor(&program).await {
                warn!(%ip, error = %e, "Hardware delete failed, reset postponed");
                return Err(e);
            }
        }
        let full = self.policy.full;
        if let Some(entry) = self.cache.get_mut(&ip) {
            entry.mac = NeighborMac::Unresolved;
            entry.aging_counter = full;
        }
        info!(%ip, "RIB neighbor reset for rediscovery");
        self.emit(NeighborEvent::Updated {
            ip,
            mac: NeighborMac::Unresolved,
            l3_if_index: entry.l3_if_index,
            port: entry.port,
        });
        self.send_discovery(ip);
        Ok(())
    }

    /// Expiry at the end of the aging window
    async fn expire(&mut self, ip: Ipv4Addr, owner: NeighborOwner) {
        let result = match owner {
            NeighborOwner::PassivelyLearned => self.remove_entry(ip).await.map(|_| ()),
            NeighborOwner::RibInstalled => self.reset_entry(ip).await,
        };
        if let Err(e) = result {
            debug!(%ip, error = %e, "Expiry deferred to next tick");
        }
    }

    /// Request for an entry: unicast on its port when resolved, otherwise a
    /// broadcast on every port of its L3 interface
    fn send_discovery(&self, ip: Ipv4Addr) {
        let Some(entry) = self.cache.get(&ip) else {
            return;
        };
        if entry.mac.is_resolved() {
            if let Some(port) = entry.port.and_then(|p| self.topology.tx_port(p)) {
                if let Err(e) = self.transmitter.send_request(&port, ip) {
                    warn!(%ip, port = %port.name, error = %e, "Failed to send refresh");
                }
                return;
            }
        }
        let ports = self.topology.tx_ports_for_l3(entry.l3_if_index);
        let sent = self.transmitter.broadcast_request(&ports, ip);
        debug!(%ip, sent, "Discovery broadcast");
    }

    /// One aging step over every entry
    pub async fn tick(&mut self) {
        for ip in self.cache.addresses() {
            let Some(entry) = self.cache.get_mut(&ip) else {
                continue;
            };
            if self.policy.is_expired(entry.aging_counter) {
                let owner = entry.owner;
                self.expire(ip, owner).await;
                continue;
            }
            entry.aging_counter -= 1;
            if self.policy.should_probe(entry.aging_counter) {
                self.send_discovery(ip);
            }
        }
        let holdoff = self.observe_holdoff;
        self.observed.retain(|_, at| at.elapsed() < holdoff);
    }

    fn parse_ip(arg: &str) -> Result<Ipv4Addr> {
        arg.trim()
            .parse()
            .map_err(|_| ArpdError::InvalidAddress(arg.to_string()))
    }

    async fn delete_by_user(&mut self, ip: Ipv4Addr) -> Result<()> {
        let entry = self
            .cache
            .get(&ip)
            .ok_or(ArpdError::NeighborNotFound(ip))?;
        if entry.owner == NeighborOwner::RibInstalled {
            warn!(%ip, "Refusing to delete RIB-installed neighbor");
            return Err(ArpdError::ProtectedEntry(ip));
        }
        self.remove_entry(ip).await.map(|_| ())
    }

    fn refresh(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.cache.contains(&ip) {
            return Err(ArpdError::NeighborNotFound(ip));
        }
        self.send_discovery(ip);
        Ok(())
    }

    /// User action, returns the number of entries affected
    #[instrument(skip(self))]
    pub async fn action(&mut self, request: ActionRequest) -> Result<usize> {
        match &request {
            ActionRequest::DeleteByIp(arg) => {
                let ip = Self::parse_ip(arg)?;
                self.delete_by_user(ip).await.map(|_| 1)
            }
            ActionRequest::RefreshByIp(arg) => {
                let ip = Self::parse_ip(arg)?;
                self.refresh(ip).map(|_| 1)
            }
            ActionRequest::DeleteByInterfaceName(name)
            | ActionRequest::RefreshByInterfaceName(name) => {
                let l3 = self
                    .topology
                    .l3_by_name(name)
                    .map(|l3| l3.if_index)
                    .ok_or_else(|| ArpdError::UnknownInterface(name.clone()))?;
                let delete = matches!(request, ActionRequest::DeleteByInterfaceName(_));
                let mut affected = 0;
                for ip in self.cache.addresses_on(l3) {
                    let result = if delete {
                        self.delete_by_user(ip).await
                    } else {
                        self.refresh(ip)
                    };
                    match result {
                        Ok(()) => affected += 1,
                        Err(ArpdError::ProtectedEntry(_)) => {}
                        Err(e) => warn!(%ip, error = %e, "Action failed for neighbor"),
                    }
                }
                info!(interface = %name, affected, "Interface action applied");
                Ok(affected)
            }
        }
    }

    /// Removal requested by the RIB, regardless of ownership
    #[instrument(skip(self))]
    pub async fn rib_withdraw(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.remove_entry(ip).await.map(|_| ())
    }

    /// Forwarding plane reports the address behind a different port
    #[instrument(skip(self))]
    pub async fn mac_move(&mut self, ip: Ipv4Addr, port: IfIndex) {
        let Some(entry) = self.cache.get(&ip).cloned() else {
            info!("Mac move for unknown neighbor ignored");
            return;
        };
        let Some(placement) = self.topology.placement_for_port(port) else {
            warn!(port, "Mac move to port without L3 mapping ignored");
            return;
        };

        let moved = NeighborEntry {
            port: placement.port,
            vlan: placement.vlan,
            ..entry.clone()
        };
        if let (Some(old), Some(new)) = (self.program_for(&entry), self.program_for(&moved)) {
            if old != new {
                if let Err(failure) = self.program(Some(old), &new).await {
                    warn!(error = %failure.error, "Hardware sync failed, mac move aborted");
                    if failure.cleared {
                        self.lose_binding(ip);
                    }
                    return;
                }
            }
        }
        self.cache.insert(moved);
        info!(port, "Neighbor moved");
        self.emit(NeighborEvent::Updated {
            ip,
            mac: entry.mac,
            l3_if_index: entry.l3_if_index,
            port: placement.port,
        });
    }

    /// Active discovery requested by the RIB
    #[instrument(skip(self))]
    pub async fn resolve(&mut self, ip: Ipv4Addr, if_index: IfIndex) -> Result<()> {
        let Some(l3_if_index) = self.topology.l3_for_interface(if_index) else {
            error!("Resolve on interface without L3 mapping");
            return Err(ArpdError::NoL3Mapping(if_index));
        };
        let subnet = self
            .topology
            .l3_interface(l3_if_index)
            .map(|l3| l3.subnet)
            .ok_or(ArpdError::NoL3Mapping(if_index))?;
        if !subnet.contains_host(ip) {
            return Err(ArpdError::InvalidAddress(format!(
                "{} is not a host address in {}",
                ip, subnet
            )));
        }

        let source = if self.topology.port(if_index).is_some() {
            UpdateSource::Port(if_index)
        } else {
            UpdateSource::L3Interface(l3_if_index)
        };
        self.apply_update(NeighborUpdate {
            ip,
            mac: NeighborMac::Unresolved,
            source,
            owner: NeighborOwner::RibInstalled,
        })
        .await?;
        self.send_discovery(ip);
        Ok(())
    }

    /// Changes the aging timeout, Ok(false) when it already had that value
    #[instrument(skip(self))]
    pub fn set_global_timeout(&mut self, secs: u32) -> Result<bool> {
        let invalid = ArpdError::InvalidTimeout {
            requested: secs,
            minimum: self.min_timeout_secs,
        };
        if secs < self.min_timeout_secs {
            return Err(invalid);
        }
        if secs == self.policy.timeout_secs {
            return Ok(false);
        }
        let policy = self.policy.with_timeout(secs);
        if !policy.is_usable_full(policy.full) {
            return Err(invalid);
        }
        self.policy = policy;
        for entry in self.cache.values_mut() {
            entry.aging_counter = entry.aging_counter.min(policy.full);
        }
        info!(timeout_secs = secs, full = policy.full, "Aging timeout changed");
        Ok(true)
    }

    /// Passive IP observation, requests addresses that are unknown or seen
    /// on an unexpected port
    pub fn observe_ip(&mut self, ip: Ipv4Addr, port: IfIndex) {
        if self
            .observed
            .get(&ip)
            .is_some_and(|at| at.elapsed() < self.observe_holdoff)
        {
            return;
        }
        let Some(target_l3) = self.topology.l3_for_address(ip).map(|l3| l3.if_index) else {
            return;
        };

        let stale = match self.cache.get(&ip) {
            None => true,
            Some(entry) if !entry.mac.is_resolved() => false,
            Some(entry) => {
                self.topology.l3_for_port(port) == Some(target_l3)
                    && (entry.port != Some(port)
                        || entry.vlan != self.topology.vlan_for_port(port))
            }
        };
        if !stale {
            return;
        }

        self.observed.insert(ip, Instant::now());
        let ports = self.topology.tx_ports_for_l3(target_l3);
        let sent = self.transmitter.broadcast_request(&ports, ip);
        debug!(%ip, port, sent, "Request triggered by IP observation");
    }

    fn state_of(&self, entry: &NeighborEntry) -> NeighborState {
        NeighborState {
            ip: entry.ip,
            mac: entry.mac,
            port: entry
                .port
                .and_then(|p| self.topology.port(p))
                .map(|p| p.name.clone()),
            vlan: entry.vlan,
            interface: self
                .topology
                .l3_interface(entry.l3_if_index)
                .map(|l3| l3.name.clone())
                .unwrap_or_default(),
            remaining_secs: self.policy.remaining_secs(entry.aging_counter),
            last_resolved_at: entry.last_resolved_at,
            owner: entry.owner,
        }
    }

    pub fn get(&self, ip: Ipv4Addr) -> Result<NeighborState> {
        self.cache
            .get(&ip)
            .map(|e| self.state_of(e))
            .ok_or(ArpdError::NeighborNotFound(ip))
    }

    pub fn get_bulk(&self, from: usize, count: usize) -> BulkPage {
        let count = count.min(self.max_page_size);
        let (entries, next_index) = self.cache.page(from, count);
        BulkPage {
            entries: entries.into_iter().map(|e| self.state_of(e)).collect(),
            next_index,
        }
    }

    pub fn rebuild_snapshot(&mut self) {
        self.cache.rebuild_order();
        debug!(entries = self.cache.order_len(), "Bulk snapshot rebuilt");
    }

    fn publish_plan(&self) {
        self.plan
            .send_replace(Arc::new(self.topology.address_plan()));
    }

    /// Starts a port's receive loop and its startup probes
    fn start_port(&mut self, port: IfIndex) {
        let Some(p) = self.topology.port(port).cloned() else {
            return;
        };
        if !self.topology.is_receivable(port) {
            return;
        }
        if let Err(e) = self.receivers.start(&p) {
            warn!(port = %p.name, error = %e, "Failed to start receive loop");
            return;
        }
        if let Some(tx) = self.topology.tx_port(port) {
            self.transmitter.spawn_probes(tx, self.probe.clone());
        }
    }

    async fn stop_unreceivable(&mut self, ports: impl IntoIterator<Item = IfIndex>) {
        for port in ports {
            if self.receivers.is_running(port) && !self.topology.is_receivable(port) {
                self.receivers.stop(port).await;
            }
        }
    }

    /// Removes every entry on an L3 interface, RIB-owned included
    async fn flush_interface(&mut self, l3_if_index: IfIndex) {
        for ip in self.cache.addresses_on(l3_if_index) {
            if let Err(e) = self.remove_entry(ip).await {
                warn!(%ip, error = %e, "Flush failed for neighbor");
            }
        }
    }

    async fn apply_membership(&mut self, diff: MembershipDiff) {
        self.publish_plan();
        for member in diff.departed {
            let ports = self.topology.member_ports(member);
            let ports = if ports.is_empty() {
                std::collections::BTreeSet::from([member])
            } else {
                ports
            };
            if self.flush_on_membership_change {
                for port in &ports {
                    for ip in self.cache.addresses_on_port(*port) {
                        let owner = self.cache.get(&ip).map(|e| e.owner);
                        if let Some(owner) = owner {
                            self.expire(ip, owner).await;
                        }
                    }
                }
            }
            self.stop_unreceivable(ports).await;
        }
        for member in diff.joined {
            for port in self.topology.member_ports(member) {
                if !self.receivers.is_running(port) {
                    self.start_port(port);
                }
            }
        }
    }

    /// Hardware-plane notification
    #[instrument(skip(self))]
    pub async fn handle_topology(&mut self, event: TopologyEvent) {
        match event {
            TopologyEvent::LinkState { port, up } => {
                let was_receivable = self.topology.is_receivable(port);
                let Some(previous) = self.topology.set_link_state(port, up) else {
                    return;
                };
                if previous == up {
                    return;
                }
                if up {
                    self.start_port(port);
                } else if was_receivable {
                    self.receivers.stop(port).await;
                }
            }
            TopologyEvent::L3InterfaceCreated(l3) => {
                let if_index = l3.if_index;
                self.topology.add_l3_interface(l3);
                self.publish_plan();
                for port in self.topology.member_ports(if_index) {
                    self.start_port(port);
                }
            }
            TopologyEvent::L3InterfaceDeleted { if_index } => {
                self.flush_interface(if_index).await;
                let ports = self.topology.member_ports(if_index);
                self.topology.remove_l3_interface(if_index);
                self.publish_plan();
                self.stop_unreceivable(ports).await;
            }
            TopologyEvent::VlanCreated(vlan) | TopologyEvent::VlanUpdated(vlan) => {
                let diff = self.topology.upsert_vlan(vlan);
                self.apply_membership(diff).await;
            }
            TopologyEvent::VlanDeleted { if_index } => {
                let diff = self.topology.remove_vlan(if_index);
                self.apply_membership(diff).await;
            }
            TopologyEvent::LagCreated(lag) | TopologyEvent::LagUpdated(lag) => {
                let diff = self.topology.upsert_lag(lag);
                self.apply_membership(diff).await;
            }
            TopologyEvent::LagDeleted { if_index } => {
                let diff = self.topology.remove_lag(if_index);
                self.apply_membership(diff).await;
            }
            TopologyEvent::MacMove { ip, port } => self.mac_move(ip, port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{HardwareCall, HardwareOp, LoopbackIo, MockHardwarePlane};
    use crate::packet::{ArpOp, EthernetFrame, Payload};
    use crate::persistence::MemoryNeighborStore;
    use crate::topology::tests::sample_snapshot;
    use crate::types::VlanId;
    use pretty_assertions::assert_eq;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 10, 10, 10);
    const HOST_MAC: MacAddress = MacAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const OTHER_MAC: MacAddress = MacAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

    struct Harness {
        engine: ArpEngine,
        hardware: Arc<MockHardwarePlane>,
        store: Arc<MemoryNeighborStore>,
        io: Arc<LoopbackIo>,
        events: broadcast::Receiver<NeighborEvent>,
        _dispatch: mpsc::Receiver<ArpMessage>,
    }

    fn harness_with(config: ArpdConfig, store: MemoryNeighborStore) -> Harness {
        let hardware = Arc::new(MockHardwarePlane::new());
        let store = Arc::new(store);
        let io = Arc::new(LoopbackIo::new());
        let (dispatch, dispatch_rx) = mpsc::channel(64);
        let (events, events_rx) = broadcast::channel(64);
        let engine = ArpEngine::new(
            &config,
            TopologyMirror::from_snapshot(sample_snapshot()),
            EngineContext {
                hardware: hardware.clone(),
                store: store.clone(),
                io: io.clone(),
                dispatch,
                events,
            },
        );
        Harness {
            engine,
            hardware,
            store,
            io,
            events: events_rx,
            _dispatch: dispatch_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(ArpdConfig::default(), MemoryNeighborStore::new())
    }

    /// Requests transmitted so far as `(port name, target)`
    fn requests(io: &LoopbackIo) -> Vec<(String, Ipv4Addr)> {
        io.injected()
            .into_iter()
            .filter_map(|(port, frame)| match EthernetFrame::parse(&frame).ok()?.payload {
                Payload::Arp(arp) if arp.op == ArpOp::Request => Some((port, arp.target_ip)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_learn_programs_hardware_and_persists() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();

        let state = h.engine.get(HOST).unwrap();
        assert_eq!(state.mac, NeighborMac::Resolved(HOST_MAC));
        assert_eq!(state.port.as_deref(), Some("Ethernet0"));
        assert_eq!(state.interface, "Ethernet0");
        assert!(state.remaining_secs <= 600);
        assert!(state.last_resolved_at.is_some());

        assert_eq!(
            h.hardware.calls(),
            vec![HardwareCall::Create(NeighborProgram {
                ip: HOST,
                mac: HOST_MAC,
                vlan: None,
                if_index: 1,
            })]
        );
        assert!(h.store.contains(HOST));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            NeighborEvent::Learned { ip, .. } if ip == HOST
        ));
    }

    #[tokio::test]
    async fn test_identical_update_is_idempotent() {
        let mut h = harness();
        let update = NeighborUpdate::learned(HOST, HOST_MAC, 1);
        h.engine.apply_update(update).await.unwrap();
        h.engine.tick().await;
        assert_eq!(h.engine.cache().get(&HOST).unwrap().aging_counter, 599);

        h.engine.apply_update(update).await.unwrap();
        assert_eq!(h.hardware.calls().len(), 1);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.engine.cache().get(&HOST).unwrap().aging_counter, 600);
    }

    #[tokio::test]
    async fn test_mac_change_updates_hardware() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, OTHER_MAC, 1))
            .await
            .unwrap();
        assert!(matches!(h.hardware.calls()[1], HardwareCall::Update(p) if p.mac == OTHER_MAC));
        let _ = h.events.try_recv();
        assert!(matches!(
            h.events.try_recv().unwrap(),
            NeighborEvent::Updated { .. }
        ));
    }

    #[tokio::test]
    async fn test_lag_member_uses_lag_egress() {
        let mut h = harness();
        let ip = Ipv4Addr::new(172, 16, 0, 2);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 5))
            .await
            .unwrap();
        assert!(matches!(h.hardware.calls()[0], HardwareCall::Create(p) if p.if_index == 200));
        assert_eq!(h.engine.get(ip).unwrap().interface, "PortChannel1");
    }

    #[tokio::test]
    async fn test_vlan_member_carries_vlan() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 3))
            .await
            .unwrap();
        assert!(matches!(
            h.hardware.calls()[0],
            HardwareCall::Create(p) if p.vlan == VlanId::new(100) && p.if_index == 3
        ));
    }

    #[tokio::test]
    async fn test_unmapped_port_fails_closed() {
        let mut h = harness();
        let err = h
            .engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, ArpdError::NoL3Mapping(42)));
        assert!(h.engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_hardware_failure_aborts_update() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::placeholder(HOST, 1))
            .await
            .unwrap();
        h.hardware.set_failing(true);

        let err = h
            .engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            h.engine.cache().get(&HOST).unwrap().mac,
            NeighborMac::Unresolved
        );

        h.hardware.set_failing(false);
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        assert!(h.engine.cache().get(&HOST).unwrap().mac.is_resolved());
    }

    #[tokio::test]
    async fn test_unresolved_evidence_keeps_resolution() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine.resolve(HOST, 1).await.unwrap();

        let entry = h.engine.cache().get(&HOST).unwrap();
        assert_eq!(entry.mac, NeighborMac::Resolved(HOST_MAC));
        assert_eq!(entry.owner, NeighborOwner::RibInstalled);
        assert_eq!(h.hardware.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_a_refresh_at_half_timeout() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();

        for _ in 0..299 {
            h.engine.tick().await;
        }
        assert!(requests(&h.io).is_empty());

        h.engine.tick().await;
        assert_eq!(requests(&h.io), vec![("Ethernet0".to_string(), HOST)]);
    }

    #[tokio::test]
    async fn test_passive_entry_ages_out() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();

        let mut last = h.engine.cache().get(&HOST).unwrap().aging_counter;
        while let Some(entry) = h.engine.cache().get(&HOST) {
            assert!(entry.aging_counter <= last);
            last = entry.aging_counter;
            h.engine.tick().await;
            if let Some(entry) = h.engine.cache().get(&HOST) {
                assert_eq!(entry.aging_counter, last - 1);
            }
        }

        assert!(matches!(h.hardware.calls().last(), Some(HardwareCall::Delete(_))));
        assert!(!h.store.contains(HOST));
        // Retry window plus the half, quarter, minute and thirty second marks
        assert_eq!(requests(&h.io).len(), 5 + 4);
    }

    #[tokio::test]
    async fn test_scenario_b_resolve_without_mapping() {
        let mut h = harness();
        let err = h.engine.resolve(HOST, 77).await.unwrap_err();
        assert!(matches!(err, ArpdError::NoL3Mapping(77)));
        assert!(h.engine.cache().is_empty());
        assert!(h.io.injected().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_rejects_foreign_subnet() {
        let mut h = harness();
        let err = h
            .engine
            .resolve(Ipv4Addr::new(192, 168, 100, 5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ArpdError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_resolve_broadcasts_on_vlan_members() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine.resolve(ip, 100).await.unwrap();

        let entry = h.engine.cache().get(&ip).unwrap();
        assert_eq!(entry.owner, NeighborOwner::RibInstalled);
        assert_eq!(entry.l3_if_index, 100);
        assert_eq!(
            requests(&h.io),
            vec![("Ethernet4".to_string(), ip), ("Ethernet8".to_string(), ip)]
        );
    }

    #[tokio::test]
    async fn test_scenario_c_rib_entry_resets() {
        let mut h = harness();
        h.engine.resolve(HOST, 1).await.unwrap();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine.cache.get_mut(&HOST).unwrap().aging_counter = 1;
        h.io.clear_injected();

        h.engine.tick().await;

        let entry = h.engine.cache().get(&HOST).unwrap();
        assert_eq!(entry.mac, NeighborMac::Unresolved);
        assert_eq!(entry.aging_counter, 600);
        assert_eq!(entry.owner, NeighborOwner::RibInstalled);
        assert!(matches!(h.hardware.calls().last(), Some(HardwareCall::Delete(_))));
        assert_eq!(requests(&h.io), vec![("Ethernet0".to_string(), HOST)]);
    }

    #[tokio::test]
    async fn test_expiry_waits_for_hardware() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine.cache.get_mut(&HOST).unwrap().aging_counter = 1;
        h.hardware.set_failing(true);

        h.engine.tick().await;
        assert!(h.engine.cache().contains(&HOST));

        h.hardware.set_failing(false);
        h.engine.tick().await;
        assert!(!h.engine.cache().contains(&HOST));
    }

    #[tokio::test]
    async fn test_ownership_protection() {
        let mut h = harness();
        h.engine.resolve(HOST, 1).await.unwrap();
        let err = h
            .engine
            .action(ActionRequest::DeleteByIp(HOST.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArpdError::ProtectedEntry(_)));
        assert!(h.engine.cache().contains(&HOST));

        h.engine.rib_withdraw(HOST).await.unwrap();
        assert!(!h.engine.cache().contains(&HOST));
    }

    #[tokio::test]
    async fn test_actions() {
        let mut h = harness();
        let second = Ipv4Addr::new(10, 10, 10, 11);
        let rib = Ipv4Addr::new(10, 10, 10, 12);
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine
            .apply_update(NeighborUpdate::learned(second, OTHER_MAC, 1))
            .await
            .unwrap();
        h.engine.resolve(rib, 1).await.unwrap();
        h.io.clear_injected();

        let refreshed = h
            .engine
            .action(ActionRequest::RefreshByInterfaceName("Ethernet0".into()))
            .await
            .unwrap();
        assert_eq!(refreshed, 3);
        assert_eq!(requests(&h.io).len(), 3);

        let deleted = h
            .engine
            .action(ActionRequest::DeleteByInterfaceName("Ethernet0".into()))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(h.engine.cache().len(), 1);

        assert!(matches!(
            h.engine
                .action(ActionRequest::DeleteByIp("not-an-ip".into()))
                .await,
            Err(ArpdError::InvalidAddress(_))
        ));
        assert!(matches!(
            h.engine
                .action(ActionRequest::RefreshByInterfaceName("Ethernet99".into()))
                .await,
            Err(ArpdError::UnknownInterface(_))
        ));
        assert!(matches!(
            h.engine.action(ActionRequest::RefreshByIp(HOST.to_string())).await,
            Err(ArpdError::NeighborNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_global_timeout() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();

        assert!(matches!(
            h.engine.set_global_timeout(10),
            Err(ArpdError::InvalidTimeout { requested: 10, minimum: 300 })
        ));
        assert_eq!(h.engine.set_global_timeout(600).unwrap(), false);
        assert_eq!(h.engine.set_global_timeout(400).unwrap(), true);
        assert_eq!(h.engine.policy().full, 400);
        assert_eq!(h.engine.cache().get(&HOST).unwrap().aging_counter, 400);
    }

    #[tokio::test]
    async fn test_reload_from_persistence() {
        let store = MemoryNeighborStore::with_records([
            PersistedNeighbor {
                ip: HOST,
                l3_if_index: 1,
            },
            PersistedNeighbor {
                ip: Ipv4Addr::new(10, 99, 0, 1),
                l3_if_index: 99,
            },
        ]);
        let mut h = harness_with(ArpdConfig::default(), store);
        h.engine.bootstrap().await;

        assert!(h.store.is_empty());
        assert_eq!(h.engine.cache().len(), 1);
        let entry = h.engine.cache().get(&HOST).unwrap();
        assert_eq!(entry.mac, NeighborMac::Unresolved);
        assert_eq!(entry.aging_counter, 7);
        assert!(!entry.persisted);

        h.engine.tick().await;
        assert!(requests(&h.io).iter().any(|(_, ip)| *ip == HOST));

        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        assert!(h.store.contains(HOST));
    }

    #[tokio::test]
    async fn test_bootstrap_starts_receive_loops() {
        let mut h = harness();
        h.engine.bootstrap().await;
        assert_eq!(h.engine.receivers().running(), 5);
        assert!(h.io.is_capturing("Ethernet0"));
    }

    #[tokio::test]
    async fn test_link_down_stops_loop() {
        let mut h = harness();
        h.engine.bootstrap().await;
        h.engine
            .handle_topology(TopologyEvent::LinkState { port: 1, up: false })
            .await;
        assert!(!h.engine.receivers().is_running(1));
        assert!(!h.io.is_capturing("Ethernet0"));

        h.engine
            .handle_topology(TopologyEvent::LinkState { port: 1, up: true })
            .await;
        assert!(h.engine.receivers().is_running(1));
    }

    #[tokio::test]
    async fn test_l3_delete_flushes_interface() {
        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(HOST, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine.resolve(Ipv4Addr::new(10, 10, 10, 12), 1).await.unwrap();
        h.engine
            .handle_topology(TopologyEvent::L3InterfaceDeleted { if_index: 1 })
            .await;
        assert!(h.engine.cache().is_empty());
        assert!(h.engine.topology().l3_interface(1).is_none());
    }

    #[tokio::test]
    async fn test_membership_flush_is_configurable() {
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        let shrink = || crate::topology::Vlan {
            if_index: 100,
            vlan_id: VlanId::new(100).unwrap(),
            name: "Vlan100".to_string(),
            untagged: [3].into_iter().collect(),
        };

        let mut h = harness();
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.engine
            .handle_topology(TopologyEvent::VlanUpdated(shrink()))
            .await;
        assert!(h.engine.cache().contains(&ip));

        let mut config = ArpdConfig::default();
        config.topology.flush_on_membership_change = true;
        let mut h = harness_with(config, MemoryNeighborStore::new());
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.engine
            .handle_topology(TopologyEvent::VlanUpdated(shrink()))
            .await;
        assert!(!h.engine.cache().contains(&ip));
    }

    #[tokio::test]
    async fn test_mac_move() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.engine
            .handle_topology(TopologyEvent::MacMove { ip, port: 3 })
            .await;
        assert_eq!(h.engine.get(ip).unwrap().port.as_deref(), Some("Ethernet8"));
        assert!(matches!(h.hardware.calls().last(), Some(HardwareCall::Create(p)) if p.if_index == 3));

        h.engine
            .handle_topology(TopologyEvent::MacMove {
                ip: Ipv4Addr::new(192, 168, 100, 99),
                port: 3,
            })
            .await;
        assert_eq!(h.engine.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_egress_change_failure_keeps_cache_with_hardware() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.hardware.clear();
        h.io.clear_injected();
        h.hardware.set_failing_op(HardwareOp::Create, true);

        let err = h
            .engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 3))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            h.hardware.calls().as_slice(),
            [HardwareCall::Delete(p)] if p.if_index == 2
        ));
        let entry = h.engine.cache().get(&ip).unwrap();
        assert_eq!(entry.mac, NeighborMac::Unresolved);
        assert_eq!(entry.l3_if_index, 100);
        assert_eq!(
            requests(&h.io),
            vec![
                ("Ethernet4".to_string(), ip),
                ("Ethernet8".to_string(), ip)
            ]
        );

        // Same evidence as before the failure programs hardware again
        h.hardware.set_failing_op(HardwareOp::Create, false);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        assert!(matches!(
            h.hardware.calls().last(),
            Some(HardwareCall::Create(p)) if p.if_index == 2 && p.ip == ip
        ));
        assert_eq!(h.engine.get(ip).unwrap().port.as_deref(), Some("Ethernet4"));
    }

    #[tokio::test]
    async fn test_failed_mac_move_drops_resolution() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.hardware.clear();
        h.hardware.set_failing_op(HardwareOp::Create, true);

        h.engine
            .handle_topology(TopologyEvent::MacMove { ip, port: 3 })
            .await;
        assert_eq!(h.hardware.calls().len(), 1);
        let state = h.engine.get(ip).unwrap();
        assert_eq!(state.mac, NeighborMac::Unresolved);
        assert_eq!(state.port.as_deref(), Some("Ethernet4"));

        h.hardware.set_failing_op(HardwareOp::Create, false);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 3))
            .await
            .unwrap();
        assert!(matches!(
            h.hardware.calls().last(),
            Some(HardwareCall::Create(p)) if p.if_index == 3
        ));
    }

    #[tokio::test]
    async fn test_egress_change_failure_without_delete_keeps_binding() {
        let mut h = harness();
        let ip = Ipv4Addr::new(192, 168, 100, 5);
        h.engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 2))
            .await
            .unwrap();
        h.hardware.set_failing_op(HardwareOp::Delete, true);

        assert!(h
            .engine
            .apply_update(NeighborUpdate::learned(ip, HOST_MAC, 3))
            .await
            .is_err());
        let state = h.engine.get(ip).unwrap();
        assert_eq!(state.mac, NeighborMac::Resolved(HOST_MAC));
        assert_eq!(state.port.as_deref(), Some("Ethernet4"));
        assert_eq!(h.hardware.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_observe_ip_requests_unknown_once() {
        let mut h = harness();
        h.engine.observe_ip(HOST, 1);
        h.engine.observe_ip(HOST, 1);
        assert_eq!(requests(&h.io), vec![("Ethernet0".to_string(), HOST)]);

        let known = Ipv4Addr::new(10, 10, 10, 11);
        h.engine
            .apply_update(NeighborUpdate::learned(known, HOST_MAC, 1))
            .await
            .unwrap();
        h.engine.observe_ip(known, 1);
        assert_eq!(requests(&h.io).len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_pages() {
        let mut h = harness();
        for i in 1..=5 {
            h.engine
                .apply_update(NeighborUpdate::learned(
                    Ipv4Addr::new(10, 10, 10, i),
                    HOST_MAC,
                    1,
                ))
                .await
                .unwrap();
        }
        h.engine.rebuild_snapshot();

        let first = h.engine.get_bulk(0, 2);
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_index, 2);
        let last = h.engine.get_bulk(4, 2);
        assert_eq!(last.entries.len(), 1);
        assert!(last.is_last());

        let empty = h.engine.get_bulk(2, 0);
        assert!(empty.entries.is_empty());
        assert_eq!(empty.next_index, 2);
    }
}
