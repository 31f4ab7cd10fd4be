//! Core types for the ARP neighbor cache
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Neighbor entries as network components
//! - IA-3: Device Identification - IPv4 to MAC bindings
//! - SI-4: System Monitoring - Neighbor state tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Hardware-plane interface index (port, VLAN or LAG)
pub type IfIndex = u32;

/// MAC address representation
///
/// # NIST Controls
/// - IA-3: Device Identification - MAC addresses for device identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Zero MAC address (unknown target hardware address in requests)
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);

    /// Broadcast MAC address
    pub const BROADCAST: Self = Self([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    /// Creates a MAC from a 6-byte slice, None if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// Group bit set (includes broadcast)
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    /// Parse MAC from colon-separated string (e.g., "00:11:22:33:44:55")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid MAC address: {}", s))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

/// Resolution state of a neighbor's hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborMac {
    /// Discovery in progress, no binding known
    Unresolved,
    /// Binding confirmed by packet evidence
    Resolved(MacAddress),
}

impl NeighborMac {
    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(self, NeighborMac::Resolved(_))
    }

    pub fn mac(&self) -> Option<MacAddress> {
        match self {
            NeighborMac::Resolved(mac) => Some(*mac),
            NeighborMac::Unresolved => None,
        }
    }
}

impl fmt::Display for NeighborMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NeighborMac::Unresolved => f.write_str("incomplete"),
            NeighborMac::Resolved(mac) => mac.fmt(f),
        }
    }
}

/// Who is responsible for an entry's lifetime
///
/// Ordering is significant: `RibInstalled` ranks above `PassivelyLearned`
/// so [`NeighborOwner::merge`] never downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborOwner {
    PassivelyLearned,
    RibInstalled,
}

impl NeighborOwner {
    /// Upgrade-only combination of current and incoming ownership
    #[inline]
    pub fn merge(self, incoming: NeighborOwner) -> NeighborOwner {
        self.max(incoming)
    }
}

/// IEEE 802.1Q VLAN identifier (1-4094)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub fn new(id: u16) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&id).then_some(Self(id))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for VlanId {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id).ok_or_else(|| format!("invalid VLAN ID: {} (must be 1-4094)", id))
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// IPv4 interface address with its netmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self { addr, netmask }
    }

    /// Builds a subnet from a prefix length, None if it exceeds 32
    pub fn from_prefix(addr: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
        Some(Self::new(addr, Ipv4Addr::from(mask)))
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.netmask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask))
    }

    /// `ip & mask == addr & mask`
    #[inline]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// In the subnet and usable as a neighbor address
    pub fn contains_host(&self, ip: Ipv4Addr) -> bool {
        if !self.contains(ip) {
            return false;
        }
        // /31 and /32 have no network or broadcast address
        if self.prefix_len() >= 31 {
            return true;
        }
        ip != self.network() && ip != self.broadcast()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len())
    }
}

/// Where a binding sits in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Physical port the neighbor was seen on, None for interface-level requests
    pub port: Option<IfIndex>,
    pub vlan: Option<VlanId>,
    pub l3_if_index: IfIndex,
}

/// One IPv4-to-MAC binding plus its aging/ownership metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: NeighborMac,
    pub port: Option<IfIndex>,
    pub vlan: Option<VlanId>,
    pub l3_if_index: IfIndex,
    /// Ticks remaining before the next state transition
    pub aging_counter: u32,
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub owner: NeighborOwner,
    /// Whether the persistence store currently holds this entry
    pub persisted: bool,
}

impl NeighborEntry {
    pub fn placement(&self) -> Placement {
        Placement {
            port: self.port,
            vlan: self.vlan,
            l3_if_index: self.l3_if_index,
        }
    }
}

/// Query view of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborState {
    pub ip: Ipv4Addr,
    pub mac: NeighborMac,
    pub port: Option<String>,
    pub vlan: Option<VlanId>,
    pub interface: String,
    /// Seconds until the next aging transition
    pub remaining_secs: u64,
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub owner: NeighborOwner,
}

/// One page of a bulk read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPage {
    pub entries: Vec<NeighborState>,
    /// Index to pass for the next page, 0 when the table is exhausted
    pub next_index: usize,
}

impl BulkPage {
    pub fn is_last(&self) -> bool {
        self.next_index == 0
    }
}

/// User action on the cache, each carrying a single string argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arg")]
pub enum ActionRequest {
    DeleteByIp(String),
    DeleteByInterfaceName(String),
    RefreshByIp(String),
    RefreshByInterfaceName(String),
}

impl ActionRequest {
    pub fn argument(&self) -> &str {
        match self {
            ActionRequest::DeleteByIp(arg)
            | ActionRequest::DeleteByInterfaceName(arg)
            | ActionRequest::RefreshByIp(arg)
            | ActionRequest::RefreshByInterfaceName(arg) => arg,
        }
    }
}

/// Cache change notification
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Every binding change is published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NeighborEvent {
    Learned {
        ip: Ipv4Addr,
        mac: MacAddress,
        l3_if_index: IfIndex,
        port: Option<IfIndex>,
    },
    Updated {
        ip: Ipv4Addr,
        mac: NeighborMac,
        l3_if_index: IfIndex,
        port: Option<IfIndex>,
    },
    Deleted {
        ip: Ipv4Addr,
        l3_if_index: IfIndex,
    },
}
