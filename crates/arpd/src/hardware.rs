//! Hardware Sync - neighbor programming in the forwarding plane
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-3: Configuration Change Control - Every forwarding change is acknowledged
//! - SI-7: Software, Firmware, and Information Integrity - Failed programming
//!   aborts the cache transition so cache and hardware never diverge

use crate::error::Result;
use crate::types::{IfIndex, MacAddress, VlanId};
use async_trait::async_trait;
use std::net::Ipv4Addr;

/// One neighbor as the forwarding plane sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborProgram {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    pub vlan: Option<VlanId>,
    /// Egress index: the physical port, or its LAG when the port is a member
    pub if_index: IfIndex,
}

/// Forwarding-plane command interface
///
/// Implementations return an error when the plane rejects the operation or
/// cannot be reached; callers abort the transition that triggered the call.
#[async_trait]
pub trait HardwarePlane: Send + Sync {
    async fn create_neighbor(&self, neighbor: &NeighborProgram) -> Result<()>;

    async fn update_neighbor(&self, neighbor: &NeighborProgram) -> Result<()>;

    async fn delete_neighbor(&self, neighbor: &NeighborProgram) -> Result<()>;
}
