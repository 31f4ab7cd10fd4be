//! Topology mirror - local copy of port, VLAN, LAG and L3 interface state
//!
//! The mirror is owned by the dispatcher and mutated only through the
//! notification entry points below. Receive loops see a read-only
//! [`AddressPlan`] derived from it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Interface inventory
//! - SC-7: Boundary Protection - Subnet membership drives packet validation

use crate::error::{ArpdError, Result};
use crate::transmitter::TxPort;
use crate::types::{IfIndex, MacAddress, Placement, Subnet, VlanId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Page size used when draining bulk topology queries
pub const TOPOLOGY_QUERY_PAGE: usize = 64;

/// Routed interface: a port, VLAN or LAG with an IPv4 address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3Interface {
    /// Index of the underlying port, VLAN or LAG
    pub if_index: IfIndex,
    pub name: String,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub if_index: IfIndex,
    pub name: String,
    pub mac: MacAddress,
    #[serde(default = "default_oper_up")]
    pub oper_up: bool,
    /// Owning LAG, maintained from LAG membership
    #[serde(default, skip_serializing)]
    pub lag: Option<IfIndex>,
}

fn default_oper_up() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub if_index: IfIndex,
    pub vlan_id: VlanId,
    pub name: String,
    #[serde(default)]
    pub untagged: BTreeSet<IfIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lag {
    pub if_index: IfIndex,
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<IfIndex>,
}

/// Hardware-plane notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyEvent {
    LinkState { port: IfIndex, up: bool },
    L3InterfaceCreated(L3Interface),
    L3InterfaceDeleted { if_index: IfIndex },
    VlanCreated(Vlan),
    VlanUpdated(Vlan),
    VlanDeleted { if_index: IfIndex },
    LagCreated(Lag),
    LagUpdated(Lag),
    LagDeleted { if_index: IfIndex },
    MacMove { ip: Ipv4Addr, port: IfIndex },
}

/// Ports that left and joined a VLAN or LAG
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub departed: BTreeSet<IfIndex>,
    pub joined: BTreeSet<IfIndex>,
}

impl MembershipDiff {
    fn between(old: &BTreeSet<IfIndex>, new: &BTreeSet<IfIndex>) -> Self {
        Self {
            departed: old.difference(new).copied().collect(),
            joined: new.difference(old).copied().collect(),
        }
    }
}

/// Complete topology as returned by the startup bulk queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    #[serde(default, rename = "port")]
    pub ports: Vec<Port>,
    #[serde(default, rename = "vlan")]
    pub vlans: Vec<Vlan>,
    #[serde(default, rename = "lag")]
    pub lags: Vec<Lag>,
    #[serde(default, rename = "l3_interface")]
    pub l3_interfaces: Vec<L3Interface>,
}

/// Read-only addressing view shared with receive loops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPlan {
    port_subnets: HashMap<IfIndex, Subnet>,
    subnets: Vec<Subnet>,
    own: HashSet<Ipv4Addr>,
}

impl AddressPlan {
    /// Subnet of the L3 interface a port belongs to
    pub fn subnet_for_port(&self, port: IfIndex) -> Option<Subnet> {
        self.port_subnets.get(&port).copied()
    }

    /// One of this node's configured L3 addresses
    pub fn is_own(&self, ip: Ipv4Addr) -> bool {
        self.own.contains(&ip)
    }

    /// Locally attached subnet holding `ip` as a host address
    pub fn local_subnet_of(&self, ip: Ipv4Addr) -> Option<Subnet> {
        self.subnets.iter().copied().find(|s| s.contains_host(ip))
    }
}

/// Hardware-plane bulk query interface, used once at startup
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn query_ports(&self, start: usize, count: usize) -> Result<Vec<Port>>;
    async fn query_vlans(&self, start: usize, count: usize) -> Result<Vec<Vlan>>;
    async fn query_lags(&self, start: usize, count: usize) -> Result<Vec<Lag>>;
    async fn query_l3_interfaces(&self, start: usize, count: usize) -> Result<Vec<L3Interface>>;
}

/// Hardware-plane notification bus
#[async_trait]
pub trait NotificationSource: Send {
    /// Next notification, `None` once the bus is gone
    async fn next_event(&mut self) -> Option<TopologyEvent>;
}

#[async_trait]
impl NotificationSource for mpsc::Receiver<TopologyEvent> {
    async fn next_event(&mut self) -> Option<TopologyEvent> {
        self.recv().await
    }
}

async fn drain_pages<T, F, Fut>(mut query: F) -> Result<Vec<T>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut all = Vec::new();
    loop {
        let page = query(all.len(), TOPOLOGY_QUERY_PAGE).await?;
        let done = page.len() < TOPOLOGY_QUERY_PAGE;
        all.extend(page);
        if done {
            return Ok(all);
        }
    }
}

/// Runs every paginated bulk query to completion
pub async fn fetch_topology(source: &dyn TopologySource) -> Result<TopologySnapshot> {
    Ok(TopologySnapshot {
        ports: drain_pages(|start, count| source.query_ports(start, count)).await?,
        vlans: drain_pages(|start, count| source.query_vlans(start, count)).await?,
        lags: drain_pages(|start, count| source.query_lags(start, count)).await?,
        l3_interfaces: drain_pages(|start, count| source.query_l3_interfaces(start, count))
            .await?,
    })
}

/// Topology source backed by a TOML description
///
/// ```toml
/// [[port]]
/// if_index = 1
/// name = "Ethernet0"
/// mac = "00:11:22:33:44:55"
///
/// [[l3_interface]]
/// if_index = 1
/// name = "Ethernet0"
/// subnet = { addr = "10.10.10.20", netmask = "255.255.255.0" }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    snapshot: TopologySnapshot,
}

impl StaticTopology {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self { snapshot }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let snapshot = toml::from_str(content)
            .map_err(|e| ArpdError::Config(format!("Invalid topology: {}", e)))?;
        Ok(Self::new(snapshot))
    }

    /// Loads the topology file, an absent file yields an empty topology
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Topology file not found, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(ArpdError::Io(e)),
        }
    }
}

fn page_of<T: Clone>(items: &[T], start: usize, count: usize) -> Vec<T> {
    items.iter().skip(start).take(count).cloned().collect()
}

#[async_trait]
impl TopologySource for StaticTopology {
    async fn query_ports(&self, start: usize, count: usize) -> Result<Vec<Port>> {
        Ok(page_of(&self.snapshot.ports, start, count))
    }

    async fn query_vlans(&self, start: usize, count: usize) -> Result<Vec<Vlan>> {
        Ok(page_of(&self.snapshot.vlans, start, count))
    }

    async fn query_lags(&self, start: usize, count: usize) -> Result<Vec<Lag>> {
        Ok(page_of(&self.snapshot.lags, start, count))
    }

    async fn query_l3_interfaces(&self, start: usize, count: usize) -> Result<Vec<L3Interface>> {
        Ok(page_of(&self.snapshot.l3_interfaces, start, count))
    }
}

/// Process-scoped topology state
#[derive(Debug, Default)]
pub struct TopologyMirror {
    ports: BTreeMap<IfIndex, Port>,
    vlans: BTreeMap<IfIndex, Vlan>,
    lags: BTreeMap<IfIndex, Lag>,
    l3_interfaces: BTreeMap<IfIndex, L3Interface>,
}

impl TopologyMirror {
    pub fn from_snapshot(snapshot: TopologySnapshot) -> Self {
        let mut mirror = Self::default();
        for port in snapshot.ports {
            mirror.ports.insert(port.if_index, port);
        }
        for vlan in snapshot.vlans {
            mirror.vlans.insert(vlan.if_index, vlan);
        }
        for lag in snapshot.lags {
            mirror.upsert_lag(lag);
        }
        for l3 in snapshot.l3_interfaces {
            mirror.add_l3_interface(l3);
        }
        info!(
            ports = mirror.ports.len(),
            vlans = mirror.vlans.len(),
            lags = mirror.lags.len(),
            l3_interfaces = mirror.l3_interfaces.len(),
            "Topology mirror loaded"
        );
        mirror
    }

    pub fn port(&self, if_index: IfIndex) -> Option<&Port> {
        self.ports.get(&if_index)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn vlan(&self, if_index: IfIndex) -> Option<&Vlan> {
        self.vlans.get(&if_index)
    }

    pub fn lag(&self, if_index: IfIndex) -> Option<&Lag> {
        self.lags.get(&if_index)
    }

    pub fn l3_interface(&self, if_index: IfIndex) -> Option<&L3Interface> {
        self.l3_interfaces.get(&if_index)
    }

    pub fn l3_interfaces(&self) -> impl Iterator<Item = &L3Interface> {
        self.l3_interfaces.values()
    }

    pub fn l3_by_name(&self, name: &str) -> Option<&L3Interface> {
        self.l3_interfaces.values().find(|l3| l3.name == name)
    }

    /// L3 interface whose subnet holds `ip`
    pub fn l3_for_address(&self, ip: Ipv4Addr) -> Option<&L3Interface> {
        self.l3_interfaces
            .values()
            .find(|l3| l3.subnet.contains_host(ip))
    }

    /// VLAN whose untagged members include the port or its LAG
    fn vlan_containing(&self, port: IfIndex) -> Option<&Vlan> {
        let lag = self.ports.get(&port).and_then(|p| p.lag);
        self.vlans.values().find(|vlan| {
            vlan.untagged.contains(&port) || lag.is_some_and(|lag| vlan.untagged.contains(&lag))
        })
    }

    /// Owning L3 interface of a physical port: the port itself, its LAG or its VLAN
    pub fn l3_for_port(&self, port: IfIndex) -> Option<IfIndex> {
        if self.l3_interfaces.contains_key(&port) {
            return Some(port);
        }
        if let Some(lag) = self.ports.get(&port).and_then(|p| p.lag) {
            if self.l3_interfaces.contains_key(&lag) {
                return Some(lag);
            }
        }
        self.vlan_containing(port)
            .map(|vlan| vlan.if_index)
            .filter(|vlan| self.l3_interfaces.contains_key(vlan))
    }

    pub fn vlan_for_port(&self, port: IfIndex) -> Option<VlanId> {
        self.vlan_containing(port).map(|vlan| vlan.vlan_id)
    }

    /// Topology placement of a binding seen on `port`
    pub fn placement_for_port(&self, port: IfIndex) -> Option<Placement> {
        let l3_if_index = self.l3_for_port(port)?;
        Some(Placement {
            port: Some(port),
            vlan: self.vlan_for_port(port),
            l3_if_index,
        })
    }

    /// L3 interface for an arbitrary interface index (routed interface or member port)
    pub fn l3_for_interface(&self, if_index: IfIndex) -> Option<IfIndex> {
        if self.l3_interfaces.contains_key(&if_index) {
            return Some(if_index);
        }
        if self.ports.contains_key(&if_index) {
            return self.l3_for_port(if_index);
        }
        None
    }

    /// Egress index for the forwarding plane: the LAG when the port is a member
    pub fn egress_index(&self, port: IfIndex) -> IfIndex {
        self.ports
            .get(&port)
            .and_then(|p| p.lag)
            .unwrap_or(port)
    }

    /// Physical ports under an interface index, LAGs expanded to members
    pub fn member_ports(&self, if_index: IfIndex) -> BTreeSet<IfIndex> {
        if self.ports.contains_key(&if_index) {
            return BTreeSet::from([if_index]);
        }
        if let Some(lag) = self.lags.get(&if_index) {
            return lag.members.clone();
        }
        if let Some(vlan) = self.vlans.get(&if_index) {
            return vlan
                .untagged
                .iter()
                .flat_map(|member| self.member_ports(*member))
                .collect();
        }
        BTreeSet::new()
    }

    /// Port is up and routed, so it needs a receive loop
    pub fn is_receivable(&self, port: IfIndex) -> bool {
        self.ports.get(&port).is_some_and(|p| p.oper_up) && self.l3_for_port(port).is_some()
    }

    /// Transmit descriptor for a port, sourcing from its L3 interface address
    pub fn tx_port(&self, port: IfIndex) -> Option<TxPort> {
        let p = self.ports.get(&port)?;
        let l3 = self.l3_interfaces.get(&self.l3_for_port(port)?)?;
        Some(TxPort {
            if_index: p.if_index,
            name: p.name.clone(),
            mac: p.mac,
            ip: l3.subnet.addr,
        })
    }

    fn first_up_member(&self, lag: &Lag) -> Option<IfIndex> {
        lag.members
            .iter()
            .copied()
            .find(|m| self.ports.get(m).is_some_and(|p| p.oper_up))
    }

    /// Ports a broadcast for an L3 interface goes out on
    ///
    /// A LAG is reached through one operational member, a VLAN through each
    /// untagged member.
    pub fn tx_ports_for_l3(&self, l3_if_index: IfIndex) -> Vec<TxPort> {
        let direct = |member: IfIndex| -> Option<IfIndex> {
            if let Some(lag) = self.lags.get(&member) {
                return self.first_up_member(lag);
            }
            self.ports
                .get(&member)
                .filter(|p| p.oper_up)
                .map(|p| p.if_index)
        };

        let targets: Vec<IfIndex> = if let Some(vlan) = self.vlans.get(&l3_if_index) {
            vlan.untagged.iter().filter_map(|m| direct(*m)).collect()
        } else {
            direct(l3_if_index).into_iter().collect()
        };

        targets.into_iter().filter_map(|p| self.tx_port(p)).collect()
    }

    pub fn own_addresses(&self) -> HashSet<Ipv4Addr> {
        self.l3_interfaces.values().map(|l3| l3.subnet.addr).collect()
    }

    pub fn address_plan(&self) -> AddressPlan {
        let port_subnets = self
            .ports
            .keys()
            .filter_map(|port| {
                let l3 = self.l3_interfaces.get(&self.l3_for_port(*port)?)?;
                Some((*port, l3.subnet))
            })
            .collect();
        AddressPlan {
            port_subnets,
            subnets: self.l3_interfaces.values().map(|l3| l3.subnet).collect(),
            own: self.own_addresses(),
        }
    }

    /// Records a link state change, returns the previous state
    pub fn set_link_state(&mut self, port: IfIndex, up: bool) -> Option<bool> {
        let Some(p) = self.ports.get_mut(&port) else {
            warn!(port, "Link state for unknown port");
            return None;
        };
        let previous = p.oper_up;
        p.oper_up = up;
        debug!(port, name = %p.name, up, "Link state updated");
        Some(previous)
    }

    pub fn add_l3_interface(&mut self, l3: L3Interface) {
        info!(if_index = l3.if_index, name = %l3.name, subnet = %l3.subnet, "L3 interface added");
        self.l3_interfaces.insert(l3.if_index, l3);
    }

    pub fn remove_l3_interface(&mut self, if_index: IfIndex) -> Option<L3Interface> {
        let removed = self.l3_interfaces.remove(&if_index);
        if let Some(l3) = &removed {
            info!(if_index, name = %l3.name, "L3 interface removed");
        }
        removed
    }

    pub fn upsert_vlan(&mut self, vlan: Vlan) -> MembershipDiff {
        let old = self
            .vlans
            .get(&vlan.if_index)
            .map(|v| v.untagged.clone())
            .unwrap_or_default();
        let diff = MembershipDiff::between(&old, &vlan.untagged);
        debug!(vlan = %vlan.vlan_id, ?diff, "VLAN membership updated");
        self.vlans.insert(vlan.if_index, vlan);
        diff
    }

    pub fn remove_vlan(&mut self, if_index: IfIndex) -> MembershipDiff {
        let old = self
            .vlans
            .remove(&if_index)
            .map(|v| v.untagged)
            .unwrap_or_default();
        MembershipDiff::between(&old, &BTreeSet::new())
    }

    pub fn upsert_lag(&mut self, lag: Lag) -> MembershipDiff {
        let old = self
            .lags
            .get(&lag.if_index)
            .map(|l| l.members.clone())
            .unwrap_or_default();
        let diff = MembershipDiff::between(&old, &lag.members);
        for port in &diff.departed {
            if let Some(p) = self.ports.get_mut(port) {
                p.lag = None;
            }
        }
        for port in &lag.members {
            if let Some(p) = self.ports.get_mut(port) {
                p.lag = Some(lag.if_index);
            }
        }
        debug!(lag = %lag.name, ?diff, "LAG membership updated");
        self.lags.insert(lag.if_index, lag);
        diff
    }

    pub fn remove_lag(&mut self, if_index: IfIndex) -> MembershipDiff {
        let old = self
            .lags
            .remove(&if_index)
            .map(|l| l.members)
            .unwrap_or_default();
        for port in &old {
            if let Some(p) = self.ports.get_mut(port) {
                p.lag = None;
            }
        }
        MembershipDiff::between(&old, &BTreeSet::new())
    }
}
