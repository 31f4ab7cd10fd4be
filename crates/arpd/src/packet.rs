//! Ethernet / ARP / IPv4 frame codec
//!
//! Only the pieces arpd needs: Ethernet II with an optional single 802.1Q
//! tag, RFC 826 ARP for Ethernet/IPv4, and the IPv4 source/destination
//! addresses for passive observation.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Every header field is length checked

use crate::types::MacAddress;
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_HLEN_ETHERNET: u8 = 6;
pub const ARP_PLEN_IPV4: u8 = 4;

pub const ETH_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
const ARP_PACKET_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Minimum Ethernet frame size without FCS
pub const ETH_MIN_FRAME_LEN: usize = 60;

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("truncated {layer}: need {needed} bytes, have {actual}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("unsupported ARP hardware type {0}")]
    UnsupportedHardwareType(u16),

    #[error("unsupported ARP protocol type {0:#06x}")]
    UnsupportedProtocolType(u16),

    #[error("bad ARP address lengths hlen={hlen} plen={plen}")]
    BadAddressLength { hlen: u8, plen: u8 },

    #[error("unknown ARP opcode {0}")]
    UnknownOpcode(u16),

    #[error("not an IPv4 header (version {0})")]
    BadIpVersion(u8),
}

fn ensure(layer: &'static str, buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::Truncated {
            layer,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// ARP operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOp {
    type Error = PacketError;

    fn try_from(op: u16) -> Result<Self, Self::Error> {
        match op {
            1 => Ok(ArpOp::Request),
            2 => Ok(ArpOp::Reply),
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }
}

/// Ethernet/IPv4 ARP payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Broadcast who-has for `target_ip`
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    /// Address probe: sender protocol address 0.0.0.0
    pub fn probe(sender_mac: MacAddress, target_ip: Ipv4Addr) -> Self {
        Self::request(sender_mac, Ipv4Addr::UNSPECIFIED, target_ip)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure("ARP packet", buf, ARP_PACKET_LEN)?;

        let htype = BigEndian::read_u16(&buf[0..2]);
        if htype != ARP_HTYPE_ETHERNET {
            return Err(PacketError::UnsupportedHardwareType(htype));
        }
        let ptype = BigEndian::read_u16(&buf[2..4]);
        if ptype != ETHERTYPE_IPV4 {
            return Err(PacketError::UnsupportedProtocolType(ptype));
        }
        let (hlen, plen) = (buf[4], buf[5]);
        if hlen != ARP_HLEN_ETHERNET || plen != ARP_PLEN_IPV4 {
            return Err(PacketError::BadAddressLength { hlen, plen });
        }
        let op = ArpOp::try_from(BigEndian::read_u16(&buf[6..8]))?;

        Ok(Self {
            op,
            sender_mac: mac_at(buf, 8),
            sender_ip: ipv4_at(buf, 14),
            target_mac: mac_at(buf, 18),
            target_ip: ipv4_at(buf, 24),
        })
    }

    /// Writes the 28-byte ARP body into `buf`
    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], ARP_HTYPE_ETHERNET);
        BigEndian::write_u16(&mut buf[2..4], ETHERTYPE_IPV4);
        buf[4] = ARP_HLEN_ETHERNET;
        buf[5] = ARP_PLEN_IPV4;
        BigEndian::write_u16(&mut buf[6..8], self.op as u16);
        buf[8..14].copy_from_slice(self.sender_mac.as_bytes());
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(self.target_mac.as_bytes());
        buf[24..28].copy_from_slice(&self.target_ip.octets());
    }
}

#[inline]
fn mac_at(buf: &[u8], offset: usize) -> MacAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&buf[offset..offset + 6]);
    MacAddress(bytes)
}

#[inline]
fn ipv4_at(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(BigEndian::read_u32(&buf[offset..offset + 4]))
}

/// Network-layer content of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Arp(ArpPacket),
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    Other,
}

/// Decoded Ethernet frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub vlan_tag: Option<u16>,
    /// EtherType after any 802.1Q tag
    pub ethertype: u16,
    pub payload: Payload,
}

impl EthernetFrame {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure("Ethernet header", buf, ETH_HEADER_LEN)?;

        let dst_mac = mac_at(buf, 0);
        let src_mac = mac_at(buf, 6);
        let mut ethertype = BigEndian::read_u16(&buf[12..14]);
        let mut offset = ETH_HEADER_LEN;
        let mut vlan_tag = None;

        if ethertype == ETHERTYPE_VLAN {
            ensure("802.1Q tag", buf, ETH_HEADER_LEN + VLAN_TAG_LEN)?;
            vlan_tag = Some(BigEndian::read_u16(&buf[14..16]) & 0x0fff);
            ethertype = BigEndian::read_u16(&buf[16..18]);
            offset += VLAN_TAG_LEN;
        }

        let body = &buf[offset..];
        let payload = match ethertype {
            ETHERTYPE_ARP => Payload::Arp(ArpPacket::parse(body)?),
            ETHERTYPE_IPV4 => {
                let (src, dst) = parse_ipv4_addresses(body)?;
                Payload::Ipv4 { src, dst }
            }
            _ => Payload::Other,
        };

        Ok(Self {
            dst_mac,
            src_mac,
            vlan_tag,
            ethertype,
            payload,
        })
    }
}

fn parse_ipv4_addresses(buf: &[u8]) -> Result<(Ipv4Addr, Ipv4Addr), PacketError> {
    ensure("IPv4 header", buf, IPV4_MIN_HEADER_LEN)?;
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::BadIpVersion(version));
    }
    Ok((ipv4_at(buf, 12), ipv4_at(buf, 16)))
}

/// Builds a complete Ethernet II + ARP frame, padded to the minimum frame size
pub fn build_arp_frame(src_mac: MacAddress, dst_mac: MacAddress, arp: &ArpPacket) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_MIN_FRAME_LEN];
    frame[0..6].copy_from_slice(dst_mac.as_bytes());
    frame[6..12].copy_from_slice(src_mac.as_bytes());
    BigEndian::write_u16(&mut frame[12..14], ETHERTYPE_ARP);
    arp.write(&mut frame[ETH_HEADER_LEN..ETH_HEADER_LEN + ARP_PACKET_LEN]);
    frame
}
