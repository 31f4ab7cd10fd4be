//! Raw frame capture and injection on physical ports
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Per-port link-layer access
//! - AC-3: Access Enforcement - AF_PACKET sockets require CAP_NET_RAW
//! - SC-5: Denial of Service Protection - Non-blocking sockets driven by epoll

use crate::error::Result;
use crate::packet::{ETH_HEADER_LEN, ETHERTYPE_VLAN, VLAN_TAG_LEN};
use crate::types::MacAddress;
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};

/// Source of raw Ethernet frames received on one port
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next frame addressed to or flooded through the port
    async fn next_frame(&mut self) -> Result<Vec<u8>>;
}

/// Link-layer access used by receive loops and the transmitter
pub trait PacketIo: Send + Sync {
    /// Opens a capture handle on the named port
    fn open_capture(&self, port_name: &str) -> Result<Box<dyn FrameSource>>;

    /// Transmits one complete Ethernet frame on the named port
    fn inject(&self, port_name: &str, frame: &[u8]) -> Result<()>;
}

/// Frames a receive loop never looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    pub own_mac: MacAddress,
    pub control_ethertype: u16,
}

impl CaptureFilter {
    pub fn new(own_mac: MacAddress, control_ethertype: u16) -> Self {
        Self {
            own_mac,
            control_ethertype,
        }
    }

    /// False for our own transmissions and control-protocol frames
    pub fn admits(&self, frame: &[u8]) -> bool {
        if frame.len() < ETH_HEADER_LEN {
            return false;
        }
        if frame[6..12] == self.own_mac.0 {
            return false;
        }
        let mut ethertype = BigEndian::read_u16(&frame[12..14]);
        if ethertype == ETHERTYPE_VLAN && frame.len() >= ETH_HEADER_LEN + VLAN_TAG_LEN {
            ethertype = BigEndian::read_u16(&frame[16..18]);
        }
        ethertype != self.control_ethertype
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{FrameSource, PacketIo};
    use crate::error::{ArpdError, Result};
    use async_trait::async_trait;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, instrument, trace};

    /// AF_PACKET socket bound to a single interface
    ///
    /// # NIST Controls
    /// - AC-3: Access Enforcement - Kernel enforces CAP_NET_RAW
    #[derive(Debug)]
    pub struct PacketSocket {
        fd: OwnedFd,
        if_index: i32,
    }

    impl PacketSocket {
        /// Opens a non-blocking raw socket receiving every protocol on `port_name`
        #[instrument]
        pub fn open(port_name: &str) -> Result<Self> {
            let if_index = nix::net::if_::if_nametoindex(port_name)
                .map_err(|e| ArpdError::capture(port_name, format!("if_nametoindex: {}", e)))?
                as i32;
            let protocol = (libc::ETH_P_ALL as u16).to_be();

            let raw = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    protocol as libc::c_int,
                )
            };
            if raw < 0 {
                return Err(ArpdError::capture(
                    port_name,
                    format!("socket: {}", io::Error::last_os_error()),
                ));
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = protocol;
            addr.sll_ifindex = if_index;
            let ret = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(ArpdError::capture(
                    port_name,
                    format!("bind: {}", io::Error::last_os_error()),
                ));
            }

            debug!(port = port_name, if_index, "Packet socket bound");
            Ok(Self { fd, if_index })
        }

        /// Reads one frame, Ok(None) for frames this host transmitted
        pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let ret = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut from_len,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if from.sll_pkttype == libc::PACKET_OUTGOING {
                return Ok(None);
            }
            Ok(Some(ret as usize))
        }

        pub fn send(&self, frame: &[u8]) -> io::Result<()> {
            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_ifindex = self.if_index;
            addr.sll_halen = 6;
            addr.sll_addr[..6].copy_from_slice(&frame[..6]);
            let ret = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl AsRawFd for PacketSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    /// Async capture handle using tokio's epoll integration
    pub struct AsyncCapture {
        inner: AsyncFd<PacketSocket>,
        buffer: Vec<u8>,
    }

    impl AsyncCapture {
        pub fn new(socket: PacketSocket, snaplen: usize) -> Result<Self> {
            Ok(Self {
                inner: AsyncFd::new(socket)?,
                buffer: vec![0u8; snaplen],
            })
        }
    }

    #[async_trait]
    impl FrameSource for AsyncCapture {
        async fn next_frame(&mut self) -> Result<Vec<u8>> {
            let Self { inner, buffer } = self;
            loop {
                let mut guard = inner.readable().await?;
                match guard.try_io(|socket| socket.get_ref().recv(buffer)) {
                    Ok(Ok(Some(len))) => return Ok(buffer[..len].to_vec()),
                    Ok(Ok(None)) => {
                        trace!("Skipping outgoing frame");
                        continue;
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    /// AF_PACKET based link-layer access
    #[derive(Debug, Clone)]
    pub struct AfPacketIo {
        snaplen: usize,
    }

    impl AfPacketIo {
        pub fn new(snaplen: usize) -> Self {
            Self { snaplen }
        }
    }

    impl PacketIo for AfPacketIo {
        fn open_capture(&self, port_name: &str) -> Result<Box<dyn FrameSource>> {
            let socket = PacketSocket::open(port_name)?;
            Ok(Box::new(AsyncCapture::new(socket, self.snaplen)?))
        }

        fn inject(&self, port_name: &str, frame: &[u8]) -> Result<()> {
            // Fresh socket per transmission
            let socket = PacketSocket::open(port_name)?;
            socket.send(frame)?;
            trace!(port = port_name, len = frame.len(), "Frame injected");
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stub for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod unsupported {
    use super::{FrameSource, PacketIo};
    use crate::error::{ArpdError, Result};

    #[derive(Debug, Clone)]
    pub struct AfPacketIo;

    impl AfPacketIo {
        pub fn new(_snaplen: usize) -> Self {
            Self
        }
    }

    impl PacketIo for AfPacketIo {
        fn open_capture(&self, port_name: &str) -> Result<Box<dyn FrameSource>> {
            Err(ArpdError::capture(port_name, "AF_PACKET requires Linux"))
        }

        fn inject(&self, port_name: &str, _frame: &[u8]) -> Result<()> {
            Err(ArpdError::capture(port_name, "AF_PACKET requires Linux"))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ArpPacket, build_arp_frame};
    use std::net::Ipv4Addr;

    const OWN: MacAddress = MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const PEER: MacAddress = MacAddress([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

    fn arp_from(src: MacAddress) -> Vec<u8> {
        let arp = ArpPacket::request(src, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        build_arp_frame(src, MacAddress::BROADCAST, &arp)
    }

    #[test]
    fn test_filter_drops_own_frames() {
        let filter = CaptureFilter::new(OWN, 0x8809);
        assert!(!filter.admits(&arp_from(OWN)));
        assert!(filter.admits(&arp_from(PEER)));
    }

    #[test]
    fn test_filter_drops_control_ethertype() {
        let filter = CaptureFilter::new(OWN, 0x8809);
        let mut frame = arp_from(PEER);
        frame[12] = 0x88;
        frame[13] = 0x09;
        assert!(!filter.admits(&frame));

        let mut tagged = vec![0u8; 64];
        tagged[6..12].copy_from_slice(&PEER.0);
        tagged[12..14].copy_from_slice(&[0x81, 0x00]);
        tagged[16..18].copy_from_slice(&[0x88, 0x09]);
        assert!(!filter.admits(&tagged));
    }

    #[test]
    fn test_filter_drops_runt() {
        let filter = CaptureFilter::new(OWN, 0x8809);
        assert!(!filter.admits(&[0u8; 10]));
    }
}
