//! Error types for arpd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - SI-10: Information Input Validation - Rejected requests carry the reason

use crate::packet::PacketError;
use crate::types::IfIndex;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur in arpd
///
/// None of these are fatal to the daemon. Hardware and persistence failures
/// abort the single cache transition that triggered them.
#[derive(Debug, Error)]
pub enum ArpdError {
    /// Redis connection or operation failed
    /// NIST: SC-8 (Transmission Confidentiality) - Database communication errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested aging timeout is below the configured floor
    #[error("Invalid timeout {requested}s: minimum is {minimum}s")]
    InvalidTimeout { requested: u32, minimum: u32 },

    /// Address string could not be parsed or is outside the interface subnet
    /// NIST: SI-10 (Information Input Validation)
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Interface index has no routed (L3) mapping
    #[error("No L3 interface mapped to index {0}")]
    NoL3Mapping(IfIndex),

    /// Interface name does not match any L3 interface
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    /// No cache entry for the address
    #[error("Neighbor not found: {0}")]
    NeighborNotFound(Ipv4Addr),

    /// Entry is owned by the RIB and cannot be removed by user action
    #[error("Neighbor {0} is installed by the RIB and cannot be deleted")]
    ProtectedEntry(Ipv4Addr),

    /// Bulk snapshot is being rebuilt, caller should retry
    #[error("ARP cache busy, retry")]
    CacheBusy,

    /// Forwarding plane rejected or could not apply a neighbor operation
    #[error("Hardware sync failed for {ip}: {reason}")]
    HardwareSync { ip: Ipv4Addr, reason: String },

    /// Frame could not be decoded
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Raw socket setup failed
    #[error("Capture error on {port}: {reason}")]
    Capture { port: String, reason: String },

    /// Dispatcher queue or reply channel is gone
    #[error("Dispatcher channel closed")]
    ChannelClosed,
}

impl ArpdError {
    /// Creates a hardware sync error.
    pub fn hardware(ip: Ipv4Addr, reason: impl Into<String>) -> Self {
        Self::HardwareSync {
            ip,
            reason: reason.into(),
        }
    }

    /// Creates a capture error.
    pub fn capture(port: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Capture {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArpdError::CacheBusy
                | ArpdError::HardwareSync { .. }
                | ArpdError::Redis(_)
                | ArpdError::ChannelClosed
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ArpdError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ArpdError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ArpdError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ArpdError::ChannelClosed
    }
}

/// Result type alias for arpd operations
pub type Result<T> = std::result::Result<T, ArpdError>;
