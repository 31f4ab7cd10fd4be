//! ARP Neighbor Cache Daemon for SONiC
//!
//! This crate learns IPv4-to-MAC bindings from ARP traffic on routed ports,
//! ages them, actively refreshes them and keeps the forwarding plane's
//! neighbor table in sync with the cache.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! This module implements the following security controls:
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | RIB-installed entries refuse user deletes |
//! | AU-3 | Content of Audit Records | Structured logging with neighbor details |
//! | AU-12 | Audit Record Generation | All binding changes logged and broadcast |
//! | CM-6 | Configuration Settings | TOML configuration with validation |
//! | CM-8 | System Component Inventory | Topology mirror of ports, VLANs, LAGs |
//! | CP-10 | System Recovery | Persisted neighbors reloaded at startup |
//! | IA-3 | Device Identification | MAC address tracking |
//! | SC-5 | DoS Protection | Bounded queue, capture filtering |
//! | SC-7 | Boundary Protection | Only subnet-local bindings are learned |
//! | SI-7 | Information Integrity | Hardware programmed before the cache changes |
//! | SI-10 | Input Validation | ARP sender/target validation |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +-------------------------------+     +-----------------+
//! |  Routed ports   |     |             arpd              |     |  Redis (SONiC)  |
//! |                 |     |                               |     |                 |
//! |  AF_PACKET      |---->|  receive loops (one per port) |     |    APPL_DB      |
//! |                 |     |          |                    |     |   NEIGH_TABLE   |
//! |                 |     |          v                    |     |                 |
//! |  ARP requests   |<----|  dispatcher -> ArpEngine -----|---->|   STATE_DB      |
//! |  (refresh/probe)|     |     ^    ticker, rebuilder    |     |  ARP_CACHE_TABLE|
//! +-----------------+     |     |                         |     +-----------------+
//!                         |  ArpClient (RIB, user, query) |
//!                         +-------------------------------+
//! ```

pub mod cache;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod mock;
pub mod packet;
pub mod persistence;
pub mod receiver;
pub mod redis_adapter;
pub mod server;
pub mod topology;
pub mod transmitter;
pub mod types;

pub use capture::{AfPacketIo, CaptureFilter, FrameSource, PacketIo};
pub use config::ArpdConfig;
pub use engine::{ArpEngine, NeighborUpdate, UpdateSource};
pub use error::{ArpdError, Result};
pub use hardware::{HardwarePlane, NeighborProgram};
pub use persistence::{MemoryNeighborStore, NeighborStore, PersistedNeighbor};
pub use redis_adapter::{RedisHardwarePlane, RedisNeighborStore, RedisNotificationSource};
pub use server::{ArpClient, ArpDaemon, ArpDeps, ArpMessage, TickGate};
pub use topology::{
    NotificationSource, StaticTopology, TopologyEvent, TopologyMirror, TopologySnapshot,
    TopologySource,
};
pub use types::{
    ActionRequest, BulkPage, IfIndex, MacAddress, NeighborEntry, NeighborEvent, NeighborMac,
    NeighborOwner, NeighborState,
};
