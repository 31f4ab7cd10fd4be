//! ARP request and probe transmission
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Requests only leave through routed ports
//! - SI-4: System Monitoring - Transmission failures are logged

use crate::capture::PacketIo;
use crate::config::ProbeConfig;
use crate::error::Result;
use crate::packet::{ArpPacket, build_arp_frame};
use crate::types::{IfIndex, MacAddress};
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Port an ARP frame is sent on, with the addresses it is sourced from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPort {
    pub if_index: IfIndex,
    pub name: String,
    pub mac: MacAddress,
    /// Address of the L3 interface the port belongs to
    pub ip: Ipv4Addr,
}

/// Builds and injects ARP frames
#[derive(Clone)]
pub struct Transmitter {
    io: Arc<dyn PacketIo>,
}

impl Transmitter {
    pub fn new(io: Arc<dyn PacketIo>) -> Self {
        Self { io }
    }

    /// Who-has `target` from the port's own addresses, broadcast destination
    #[instrument(skip(self, port), fields(port = %port.name))]
    pub fn send_request(&self, port: &TxPort, target: Ipv4Addr) -> Result<()> {
        let arp = ArpPacket::request(port.mac, port.ip, target);
        let frame = build_arp_frame(port.mac, MacAddress::BROADCAST, &arp);
        self.io.inject(&port.name, &frame)?;
        debug!(%target, "ARP request sent");
        Ok(())
    }

    /// Address probe for the port's own address
    #[instrument(skip(self, port), fields(port = %port.name))]
    pub fn send_probe(&self, port: &TxPort) -> Result<()> {
        let arp = ArpPacket::probe(port.mac, port.ip);
        let frame = build_arp_frame(port.mac, MacAddress::BROADCAST, &arp);
        self.io.inject(&port.name, &frame)?;
        debug!(ip = %port.ip, "ARP probe sent");
        Ok(())
    }

    /// Sends a request on every port, returns how many went out
    pub fn broadcast_request(&self, ports: &[TxPort], target: Ipv4Addr) -> usize {
        ports
            .iter()
            .filter(|port| match self.send_request(port, target) {
                Ok(()) => true,
                Err(e) => {
                    warn!(port = %port.name, %target, error = %e, "Failed to send ARP request");
                    false
                }
            })
            .count()
    }

    /// Jittered probe burst for a port that just came up
    pub fn spawn_probes(&self, port: TxPort, probe: ProbeConfig) -> JoinHandle<()> {
        let tx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(jitter(0, probe.initial_delay_max_ms)).await;
            for sent in 1..=probe.count {
                if let Err(e) = tx.send_probe(&port) {
                    warn!(port = %port.name, error = %e, "Failed to send ARP probe");
                }
                if sent < probe.count {
                    let interval = jitter(probe.interval_min_ms, probe.interval_max_ms);
                    tokio::time::sleep(interval).await;
                }
            }
        })
    }
}

fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::LoopbackIo;
    use crate::packet::{ArpOp, EthernetFrame, Payload};

    fn tx_port(name: &str) -> TxPort {
        TxPort {
            if_index: 1,
            name: name.to_string(),
            mac: MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            ip: Ipv4Addr::new(10, 10, 10, 20),
        }
    }

    fn decode(frame: &[u8]) -> (EthernetFrame, ArpPacket) {
        let eth = EthernetFrame::parse(frame).unwrap();
        match eth.payload {
            Payload::Arp(arp) => (eth, arp),
            other => panic!("expected ARP, got {:?}", other),
        }
    }

    #[test]
    fn test_request_is_broadcast_from_port() {
        let io = Arc::new(LoopbackIo::new());
        let tx = Transmitter::new(io.clone());
        tx.send_request(&tx_port("Ethernet0"), Ipv4Addr::new(10, 10, 10, 10))
            .unwrap();

        let sent = io.injected();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Ethernet0");
        let (eth, arp) = decode(&sent[0].1);
        assert!(eth.dst_mac.is_broadcast());
        assert_eq!(arp.op, ArpOp::Request);
        assert_eq!(arp.sender_ip, Ipv4Addr::new(10, 10, 10, 20));
        assert_eq!(arp.target_ip, Ipv4Addr::new(10, 10, 10, 10));
    }

    #[test]
    fn test_probe_uses_unspecified_sender() {
        let io = Arc::new(LoopbackIo::new());
        let tx = Transmitter::new(io.clone());
        tx.send_probe(&tx_port("Ethernet0")).unwrap();

        let (_, arp) = decode(&io.injected()[0].1);
        assert_eq!(arp.sender_ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(arp.target_ip, Ipv4Addr::new(10, 10, 10, 20));
    }

    #[test]
    fn test_broadcast_counts_failures() {
        let io = Arc::new(LoopbackIo::new());
        io.fail_port("Ethernet4");
        let tx = Transmitter::new(io.clone());
        let sent = tx.broadcast_request(
            &[tx_port("Ethernet0"), tx_port("Ethernet4")],
            Ipv4Addr::new(10, 10, 10, 10),
        );
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_spawn_probes_sends_count() {
        let io = Arc::new(LoopbackIo::new());
        let tx = Transmitter::new(io.clone());
        let probe = ProbeConfig {
            count: 3,
            initial_delay_max_ms: 5,
            interval_min_ms: 1,
            interval_max_ms: 2,
        };
        tx.spawn_probes(tx_port("Ethernet0"), probe).await.unwrap();
        assert_eq!(io.injected().len(), 3);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(10, 20);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(jitter(5, 5), Duration::from_millis(5));
    }
}
