//! Packet receiver and ARP protocol validation
//!
//! One receive loop runs per operationally-up, L3-mapped port. Loops only
//! read the shared [`AddressPlan`]; every cache change is a message to the
//! dispatcher.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - ARP sender/target checks
//! - SC-7: Boundary Protection - Only subnet-local bindings are learned
//! - SC-5: Denial of Service Protection - Receive errors never stop a loop

use crate::capture::{CaptureFilter, FrameSource, PacketIo};
use crate::engine::NeighborUpdate;
use crate::error::Result;
use crate::packet::{ArpOp, ArpPacket, EthernetFrame, Payload};
use crate::server::ArpMessage;
use crate::topology::{AddressPlan, Port};
use crate::types::{IfIndex, MacAddress, Subnet};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Pause after a capture error before reading again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What a received ARP packet means for the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpVerdict {
    /// Learn the sender binding
    Learn { ip: Ipv4Addr, mac: MacAddress },
    /// Learn the sender and start discovery of the target
    LearnAndDiscover {
        ip: Ipv4Addr,
        mac: MacAddress,
        target: Ipv4Addr,
    },
    /// Start discovery of the target
    Discover(Ipv4Addr),
    /// Someone is probing one of our addresses
    OwnAddressProbe(Ipv4Addr),
    /// Valid but nothing to do
    Ignore(&'static str),
    /// Failed validation
    Drop(&'static str),
    /// Sender and target are both our addresses
    SelfLoop,
}

/// Classifies an ARP packet received on an interface with `subnet`
pub fn classify_arp(arp: &ArpPacket, subnet: Subnet, plan: &AddressPlan) -> ArpVerdict {
    if arp.sender_mac.is_zero() || arp.sender_mac.is_multicast() {
        return ArpVerdict::Drop("invalid sender hardware address");
    }

    let learn = |ip: Ipv4Addr, mac: MacAddress| {
        if subnet.contains_host(ip) {
            ArpVerdict::Learn { ip, mac }
        } else {
            ArpVerdict::Drop("sender outside interface subnet")
        }
    };

    match arp.op {
        ArpOp::Reply => {
            if !subnet.contains(arp.sender_ip) || !subnet.contains(arp.target_ip) {
                return ArpVerdict::Drop("reply outside interface subnet");
            }
            if plan.is_own(arp.sender_ip) {
                return ArpVerdict::Ignore("reply from own address");
            }
            learn(arp.sender_ip, arp.sender_mac)
        }
        ArpOp::Request => {
            let sender_unspecified = arp.sender_ip.is_unspecified();
            match (plan.is_own(arp.sender_ip), plan.is_own(arp.target_ip)) {
                (true, true) => ArpVerdict::SelfLoop,
                (true, false) => ArpVerdict::Ignore("reflected own request"),
                (false, true) if sender_unspecified => {
                    ArpVerdict::OwnAddressProbe(arp.target_ip)
                }
                (false, true) => learn(arp.sender_ip, arp.sender_mac),
                (false, false) if sender_unspecified => {
                    if subnet.contains_host(arp.target_ip) {
                        ArpVerdict::Discover(arp.target_ip)
                    } else {
                        ArpVerdict::Ignore("probe target outside interface subnet")
                    }
                }
                // Gratuitous
                (false, false) if arp.sender_ip == arp.target_ip => {
                    learn(arp.sender_ip, arp.sender_mac)
                }
                (false, false) => match learn(arp.sender_ip, arp.sender_mac) {
                    ArpVerdict::Learn { ip, mac } if subnet.contains_host(arp.target_ip) => {
                        ArpVerdict::LearnAndDiscover {
                            ip,
                            mac,
                            target: arp.target_ip,
                        }
                    }
                    verdict => verdict,
                },
            }
        }
    }
}

/// Address worth checking against the cache when seen in an IPv4 header
fn is_observable(ip: Ipv4Addr, plan: &AddressPlan) -> bool {
    !ip.is_multicast()
        && !ip.is_broadcast()
        && !ip.is_unspecified()
        && !plan.is_own(ip)
        && plan.local_subnet_of(ip).is_some()
}

/// Turns one captured frame into dispatcher messages
pub fn interpret_frame(frame: &[u8], port: IfIndex, plan: &AddressPlan) -> Vec<ArpMessage> {
    let Some(subnet) = plan.subnet_for_port(port) else {
        trace!(port, "Frame on port without L3 mapping");
        return Vec::new();
    };

    let eth = match EthernetFrame::parse(frame) {
        Ok(eth) => eth,
        Err(e) => {
            trace!(port, error = %e, "Malformed frame");
            return Vec::new();
        }
    };

    match eth.payload {
        Payload::Arp(arp) => match classify_arp(&arp, subnet, plan) {
            ArpVerdict::Learn { ip, mac } => {
                vec![ArpMessage::Update(NeighborUpdate::learned(ip, mac, port))]
            }
            ArpVerdict::LearnAndDiscover { ip, mac, target } => vec![
                ArpMessage::Update(NeighborUpdate::learned(ip, mac, port)),
                ArpMessage::Update(NeighborUpdate::placeholder(target, port)),
            ],
            ArpVerdict::Discover(target) => {
                vec![ArpMessage::Update(NeighborUpdate::placeholder(target, port))]
            }
            ArpVerdict::OwnAddressProbe(target) => {
                info!(port, %target, sender_mac = %arp.sender_mac, "ARP probe for own address");
                Vec::new()
            }
            ArpVerdict::Ignore(reason) => {
                trace!(port, sender = %arp.sender_ip, reason, "ARP ignored");
                Vec::new()
            }
            ArpVerdict::Drop(reason) => {
                info!(
                    port,
                    sender = %arp.sender_ip,
                    target = %arp.target_ip,
                    reason,
                    "ARP dropped"
                );
                Vec::new()
            }
            ArpVerdict::SelfLoop => {
                error!(
                    port,
                    sender = %arp.sender_ip,
                    sender_mac = %arp.sender_mac,
                    "ARP with own sender and target addresses, possible loop"
                );
                Vec::new()
            }
        },
        Payload::Ipv4 { src, dst } => [src, dst]
            .into_iter()
            .filter(|ip| is_observable(*ip, plan))
            .map(|ip| ArpMessage::ObserveIp { ip, port })
            .collect(),
        Payload::Other => Vec::new(),
    }
}

/// Static inputs of one receive loop
#[derive(Clone)]
pub struct ReceiveContext {
    pub port: IfIndex,
    pub port_name: String,
    pub filter: CaptureFilter,
    pub plan: watch::Receiver<Arc<AddressPlan>>,
    pub dispatch: mpsc::Sender<ArpMessage>,
}

/// Reads frames until told to stop, acknowledging the stop only after the
/// capture handle has been released
#[instrument(skip_all, fields(port = %ctx.port_name))]
pub async fn receive_loop(
    mut source: Box<dyn FrameSource>,
    ctx: ReceiveContext,
    mut control: mpsc::Receiver<oneshot::Sender<()>>,
) {
    debug!("Receive loop started");
    let ack = 'receive: loop {
        let frame = tokio::select! {
            ack = control.recv() => break 'receive ack,
            frame = source.next_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Capture error");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };

        if !ctx.filter.admits(&frame) {
            continue;
        }

        let messages = {
            let plan = ctx.plan.borrow();
            interpret_frame(&frame, ctx.port, &plan)
        };
        for message in messages {
            tokio::select! {
                ack = control.recv() => break 'receive ack,
                sent = ctx.dispatch.send(message) => {
                    if sent.is_err() {
                        debug!("Dispatcher gone, receive loop exiting");
                        break 'receive None;
                    }
                }
            }
        }
    };

    drop(source);
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    debug!("Receive loop stopped");
}

struct ReceiverHandle {
    control: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Receive loops by port
pub struct ReceiverSet {
    io: Arc<dyn PacketIo>,
    plan: watch::Receiver<Arc<AddressPlan>>,
    dispatch: mpsc::Sender<ArpMessage>,
    control_ethertype: u16,
    handles: HashMap<IfIndex, ReceiverHandle>,
}

impl ReceiverSet {
    pub fn new(
        io: Arc<dyn PacketIo>,
        plan: watch::Receiver<Arc<AddressPlan>>,
        dispatch: mpsc::Sender<ArpMessage>,
        control_ethertype: u16,
    ) -> Self {
        Self {
            io,
            plan,
            dispatch,
            control_ethertype,
            handles: HashMap::new(),
        }
    }

    pub fn is_running(&self, port: IfIndex) -> bool {
        self.handles.contains_key(&port)
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Opens the port's capture and spawns its loop, no-op if already running
    pub fn start(&mut self, port: &Port) -> Result<()> {
        if self.is_running(port.if_index) {
            return Ok(());
        }
        let source = self.io.open_capture(&port.name)?;
        let (control, control_rx) = mpsc::channel(1);
        let ctx = ReceiveContext {
            port: port.if_index,
            port_name: port.name.clone(),
            filter: CaptureFilter::new(port.mac, self.control_ethertype),
            plan: self.plan.clone(),
            dispatch: self.dispatch.clone(),
        };
        let task = tokio::spawn(receive_loop(source, ctx, control_rx));
        self.handles
            .insert(port.if_index, ReceiverHandle { control, task });
        info!(port = %port.name, "Receive loop running");
        Ok(())
    }

    /// Stops the port's loop and waits until its capture handle is closed
    pub async fn stop(&mut self, port: IfIndex) -> bool {
        let Some(handle) = self.handles.remove(&port) else {
            return false;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.control.send(ack_tx).await.is_ok() && ack_rx.await.is_ok() {
            debug!(port, "Receive loop acknowledged stop");
        } else {
            // Loop already exited on its own
            handle.task.abort();
        }
        true
    }

    pub async fn stop_all(&mut self) {
        let ports: Vec<IfIndex> = self.handles.keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::LoopbackIo;
    use crate::packet::build_arp_frame;
    use crate::topology::TopologyMirror;
    use crate::topology::tests::sample_snapshot;
    use pretty_assertions::assert_eq;

    const OWN_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 10, 20);
    const HOST: Ipv4Addr = Ipv4Addr::new(10, 10, 10, 10);
    const HOST_MAC: MacAddress = MacAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn plan() -> AddressPlan {
        TopologyMirror::from_snapshot(sample_snapshot()).address_plan()
    }

    fn subnet() -> Subnet {
        Subnet::from_prefix(OWN_IP, 24).unwrap()
    }

    fn request(sender: Ipv4Addr, target: Ipv4Addr) -> ArpPacket {
        ArpPacket::request(HOST_MAC, sender, target)
    }

    fn reply(sender: Ipv4Addr, target: Ipv4Addr) -> ArpPacket {
        ArpPacket {
            op: ArpOp::Reply,
            ..request(sender, target)
        }
    }

    #[test]
    fn test_request_for_own_address_learns_sender() {
        assert_eq!(
            classify_arp(&request(HOST, OWN_IP), subnet(), &plan()),
            ArpVerdict::Learn {
                ip: HOST,
                mac: HOST_MAC
            }
        );
    }

    #[test]
    fn test_probe_for_own_address_is_informational() {
        assert_eq!(
            classify_arp(&request(Ipv4Addr::UNSPECIFIED, OWN_IP), subnet(), &plan()),
            ArpVerdict::OwnAddressProbe(OWN_IP)
        );
    }

    #[test]
    fn test_own_sender_ignored_and_self_loop() {
        assert!(matches!(
            classify_arp(&request(OWN_IP, HOST), subnet(), &plan()),
            ArpVerdict::Ignore(_)
        ));
        assert_eq!(
            classify_arp(&request(OWN_IP, OWN_IP), subnet(), &plan()),
            ArpVerdict::SelfLoop
        );
    }

    #[test]
    fn test_third_party_requests() {
        let other = Ipv4Addr::new(10, 10, 10, 30);
        assert_eq!(
            classify_arp(&request(HOST, HOST), subnet(), &plan()),
            ArpVerdict::Learn {
                ip: HOST,
                mac: HOST_MAC
            }
        );
        assert_eq!(
            classify_arp(&request(Ipv4Addr::UNSPECIFIED, other), subnet(), &plan()),
            ArpVerdict::Discover(other)
        );
        assert_eq!(
            classify_arp(&request(HOST, other), subnet(), &plan()),
            ArpVerdict::LearnAndDiscover {
                ip: HOST,
                mac: HOST_MAC,
                target: other
            }
        );
    }

    #[test]
    fn test_reply_subnet_validation() {
        assert_eq!(
            classify_arp(&reply(HOST, OWN_IP), subnet(), &plan()),
            ArpVerdict::Learn {
                ip: HOST,
                mac: HOST_MAC
            }
        );
        assert!(matches!(
            classify_arp(&reply(Ipv4Addr::new(10, 10, 11, 1), OWN_IP), subnet(), &plan()),
            ArpVerdict::Drop(_)
        ));
        assert!(matches!(
            classify_arp(&reply(HOST, Ipv4Addr::new(8, 8, 8, 8)), subnet(), &plan()),
            ArpVerdict::Drop(_)
        ));
    }

    #[test]
    fn test_off_subnet_sender_dropped() {
        assert!(matches!(
            classify_arp(&request(Ipv4Addr::new(192, 168, 1, 1), OWN_IP), subnet(), &plan()),
            ArpVerdict::Drop(_)
        ));
    }

    #[test]
    fn test_multicast_sender_mac_dropped() {
        let mut arp = request(HOST, OWN_IP);
        arp.sender_mac = MacAddress([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert!(matches!(
            classify_arp(&arp, subnet(), &plan()),
            ArpVerdict::Drop(_)
        ));
    }

    fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut frame = vec![0u8; 34];
        frame[6..12].copy_from_slice(&HOST_MAC.0);
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        frame[14] = 0x45;
        frame[26..30].copy_from_slice(&src.octets());
        frame[30..34].copy_from_slice(&dst.octets());
        frame
    }

    #[test]
    fn test_interpret_ipv4_observes_local_addresses() {
        let frame = ipv4_frame(HOST, Ipv4Addr::new(8, 8, 8, 8));
        let messages = interpret_frame(&frame, 1, &plan());
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            ArpMessage::ObserveIp { ip, port: 1 } if ip == HOST
        ));

        let frame = ipv4_frame(HOST, OWN_IP);
        assert_eq!(interpret_frame(&frame, 1, &plan()).len(), 1);
    }

    #[test]
    fn test_interpret_unmapped_port() {
        let arp = request(HOST, OWN_IP);
        let frame = build_arp_frame(HOST_MAC, MacAddress::BROADCAST, &arp);
        assert!(interpret_frame(&frame, 99, &plan()).is_empty());
    }

    #[tokio::test]
    async fn test_receive_loop_dispatches_and_stops() {
        let io = Arc::new(LoopbackIo::new());
        let (_plan_tx, plan_rx) = watch::channel(Arc::new(plan()));
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(16);
        let mut receivers = ReceiverSet::new(io.clone(), plan_rx, dispatch_tx, 0x8809);

        let mirror = TopologyMirror::from_snapshot(sample_snapshot());
        let port = mirror.port(1).unwrap().clone();
        receivers.start(&port).unwrap();
        assert!(io.is_capturing("Ethernet0"));

        let arp = request(HOST, OWN_IP);
        io.feed(
            "Ethernet0",
            build_arp_frame(HOST_MAC, MacAddress::BROADCAST, &arp),
        );
        match dispatch_rx.recv().await {
            Some(ArpMessage::Update(update)) => assert_eq!(update.ip, HOST),
            other => panic!("unexpected message {:?}", other),
        }

        assert!(receivers.stop(1).await);
        assert!(!io.is_capturing("Ethernet0"));
        assert!(!receivers.is_running(1));
    }
}
