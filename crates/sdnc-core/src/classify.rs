//! Packet classification.
//!
//! Turns a raw Ethernet frame received from a switch into the canonical
//! fields the policy evaluator and QoS arbiter work on. Classification is
//! pure and deterministic.

use crate::error::MalformedPacketError;
use crate::flow::{MatchField, MatchValue};
use crate::ids::SwitchId;
use byteorder::{ByteOrder, NetworkEndian};
use sdnc_types::{IpAddress, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ARP_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Transport layer of a classified packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    /// IP payload of another protocol number.
    Other(u8),
    /// No transport layer (ARP, or a non-first IP fragment).
    None,
    /// Unrecognised ether type.
    Unknown,
}

impl TransportProtocol {
    fn from_ip_proto(proto: u8) -> Self {
        match proto {
            IP_PROTO_TCP => TransportProtocol::Tcp,
            IP_PROTO_UDP => TransportProtocol::Udp,
            IP_PROTO_ICMP => TransportProtocol::Icmp,
            IP_PROTO_ICMPV6 => TransportProtocol::Icmpv6,
            other => TransportProtocol::Other(other),
        }
    }

    /// IP protocol number, for protocols carried in IP.
    pub fn ip_proto(&self) -> Option<u8> {
        match self {
            TransportProtocol::Tcp => Some(IP_PROTO_TCP),
            TransportProtocol::Udp => Some(IP_PROTO_UDP),
            TransportProtocol::Icmp => Some(IP_PROTO_ICMP),
            TransportProtocol::Icmpv6 => Some(IP_PROTO_ICMPV6),
            TransportProtocol::Other(p) => Some(*p),
            TransportProtocol::None | TransportProtocol::Unknown => None,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Icmp => write!(f, "icmp"),
            TransportProtocol::Icmpv6 => write!(f, "icmpv6"),
            TransportProtocol::Other(p) => write!(f, "proto-{}", p),
            TransportProtocol::None => write!(f, "none"),
            TransportProtocol::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArpOperation {
    Request,
    Reply,
    Other(u16),
}

/// ARP payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpInfo {
    pub operation: ArpOperation,
    pub sender_mac: MacAddress,
    pub sender_ip: IpAddress,
    pub target_mac: MacAddress,
    pub target_ip: IpAddress,
}

/// Canonical view of one packet-in. For ARP, `source_addr`/`dest_addr` are
/// the sender and target protocol addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPacket {
    pub source_switch: SwitchId,
    pub ingress_port: u32,
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub vlan_id: Option<u16>,
    pub ether_type: u16,
    pub source_addr: Option<IpAddress>,
    pub dest_addr: Option<IpAddress>,
    pub transport_protocol: TransportProtocol,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub arp: Option<ArpInfo>,
    /// Length of the whole frame in bytes.
    pub frame_len: usize,
}

impl ClassifiedPacket {
    pub fn is_arp(&self) -> bool {
        self.ether_type == ETH_TYPE_ARP
    }

    pub fn is_ip(&self) -> bool {
        matches!(self.ether_type, ETH_TYPE_IPV4 | ETH_TYPE_IPV6)
    }

    /// Value of a match field in this packet, if the packet carries it.
    pub fn field(&self, field: MatchField) -> Option<MatchValue> {
        match field {
            MatchField::InPort => Some(MatchValue::Int(u64::from(self.ingress_port))),
            MatchField::EthType => Some(MatchValue::Int(u64::from(self.ether_type))),
            MatchField::SrcMac => Some(MatchValue::Mac(self.src_mac)),
            MatchField::DstMac => Some(MatchValue::Mac(self.dst_mac)),
            MatchField::SrcAddr => self.source_addr.map(MatchValue::Ip),
            MatchField::DstAddr => self.dest_addr.map(MatchValue::Ip),
            MatchField::IpProto => self
                .transport_protocol
                .ip_proto()
                .map(|p| MatchValue::Int(u64::from(p))),
            MatchField::SrcPort => self.source_port.map(|p| MatchValue::Int(u64::from(p))),
            MatchField::DstPort => self.dest_port.map(|p| MatchValue::Int(u64::from(p))),
            MatchField::VlanId => self.vlan_id.map(|v| MatchValue::Int(u64::from(v))),
        }
    }
}

fn need(layer: &'static str, buf: &[u8], needed: usize) -> Result<(), MalformedPacketError> {
    if buf.len() < needed {
        Err(MalformedPacketError::Truncated {
            layer,
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn mac_at(buf: &[u8], offset: usize) -> MacAddress {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&buf[offset..offset + 6]);
    MacAddress::new(bytes)
}

fn ipv4_at(buf: &[u8], offset: usize) -> IpAddress {
    IpAddress::from(Ipv4Addr::from(NetworkEndian::read_u32(&buf[offset..offset + 4])))
}

fn ipv6_at(buf: &[u8], offset: usize) -> IpAddress {
    IpAddress::from(Ipv6Addr::from(NetworkEndian::read_u128(&buf[offset..offset + 16])))
}

/// Network and transport fields extracted below the Ethernet header.
#[derive(Default)]
struct Upper {
    source_addr: Option<IpAddress>,
    dest_addr: Option<IpAddress>,
    protocol: Option<TransportProtocol>,
    source_port: Option<u16>,
    dest_port: Option<u16>,
    arp: Option<ArpInfo>,
}

/// Classifies a raw Ethernet frame received on `ingress_port` of `switch`.
pub fn classify(
    switch: SwitchId,
    ingress_port: u32,
    frame: &[u8],
) -> Result<ClassifiedPacket, MalformedPacketError> {
    need("ethernet", frame, ETH_HEADER_LEN)?;

    let dst_mac = mac_at(frame, 0);
    let src_mac = mac_at(frame, 6);
    let mut ether_type = NetworkEndian::read_u16(&frame[12..14]);
    let mut offset = ETH_HEADER_LEN;
    let mut vlan_id = None;

    if ether_type == ETH_TYPE_VLAN {
        need("vlan", frame, offset + VLAN_TAG_LEN)?;
        vlan_id = Some(NetworkEndian::read_u16(&frame[offset..offset + 2]) & 0x0fff);
        ether_type = NetworkEndian::read_u16(&frame[offset + 2..offset + 4]);
        offset += VLAN_TAG_LEN;
    }

    let payload = &frame[offset..];
    let upper = match ether_type {
        ETH_TYPE_ARP => parse_arp(payload)?,
        ETH_TYPE_IPV4 => parse_ipv4(payload)?,
        ETH_TYPE_IPV6 => parse_ipv6(payload)?,
        _ => Upper {
            protocol: Some(TransportProtocol::Unknown),
            ..Upper::default()
        },
    };

    Ok(ClassifiedPacket {
        source_switch: switch,
        ingress_port,
        src_mac,
        dst_mac,
        vlan_id,
        ether_type,
        source_addr: upper.source_addr,
        dest_addr: upper.dest_addr,
        transport_protocol: upper.protocol.unwrap_or(TransportProtocol::None),
        source_port: upper.source_port,
        dest_port: upper.dest_port,
        arp: upper.arp,
        frame_len: frame.len(),
    })
}

fn parse_arp(buf: &[u8]) -> Result<Upper, MalformedPacketError> {
    need("arp", buf, ARP_LEN)?;

    let htype = NetworkEndian::read_u16(&buf[0..2]);
    let ptype = NetworkEndian::read_u16(&buf[2..4]);
    if htype != 1 || ptype != ETH_TYPE_IPV4 || buf[4] != 6 || buf[5] != 4 {
        return Err(MalformedPacketError::InvalidHeader {
            layer: "arp",
            reason: format!("unsupported hardware/protocol type {}/{:#06x}", htype, ptype),
        });
    }

    let operation = match NetworkEndian::read_u16(&buf[6..8]) {
        1 => ArpOperation::Request,
        2 => ArpOperation::Reply,
        other => ArpOperation::Other(other),
    };
    let arp = ArpInfo {
        operation,
        sender_mac: mac_at(buf, 8),
        sender_ip: ipv4_at(buf, 14),
        target_mac: mac_at(buf, 18),
        target_ip: ipv4_at(buf, 24),
    };

    Ok(Upper {
        source_addr: Some(arp.sender_ip),
        dest_addr: Some(arp.target_ip),
        arp: Some(arp),
        ..Upper::default()
    })
}

fn parse_ipv4(buf: &[u8]) -> Result<Upper, MalformedPacketError> {
    need("ipv4", buf, IPV4_MIN_HEADER_LEN)?;

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(MalformedPacketError::InvalidHeader {
            layer: "ipv4",
            reason: format!("version {}", version),
        });
    }
    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(MalformedPacketError::InvalidHeader {
            layer: "ipv4",
            reason: format!("header length {}", header_len),
        });
    }
    need("ipv4", buf, header_len)?;

    let fragment_offset = NetworkEndian::read_u16(&buf[6..8]) & 0x1fff;
    let proto = buf[9];

    let mut upper = Upper {
        source_addr: Some(ipv4_at(buf, 12)),
        dest_addr: Some(ipv4_at(buf, 16)),
        ..Upper::default()
    };
    if fragment_offset == 0 {
        upper.protocol = Some(TransportProtocol::from_ip_proto(proto));
        parse_ports(proto, &buf[header_len..], &mut upper)?;
    }
    Ok(upper)
}

fn parse_ipv6(buf: &[u8]) -> Result<Upper, MalformedPacketError> {
    need("ipv6", buf, IPV6_HEADER_LEN)?;

    let version = buf[0] >> 4;
    if version != 6 {
        return Err(MalformedPacketError::InvalidHeader {
            layer: "ipv6",
            reason: format!("version {}", version),
        });
    }

    let mut upper = Upper {
        source_addr: Some(ipv6_at(buf, 8)),
        dest_addr: Some(ipv6_at(buf, 24)),
        ..Upper::default()
    };

    let mut next = buf[6];
    let mut rest = &buf[IPV6_HEADER_LEN..];
    loop {
        match next {
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                need("ipv6 extension", rest, 2)?;
                let len = (usize::from(rest[1]) + 1) * 8;
                need("ipv6 extension", rest, len)?;
                next = rest[0];
                rest = &rest[len..];
            }
            // fragment
            44 => {
                need("ipv6 fragment", rest, 8)?;
                let offset = NetworkEndian::read_u16(&rest[2..4]) >> 3;
                if offset != 0 {
                    return Ok(upper);
                }
                next = rest[0];
                rest = &rest[8..];
            }
            // authentication header
            51 => {
                need("ipv6 auth", rest, 2)?;
                let len = (usize::from(rest[1]) + 2) * 4;
                need("ipv6 auth", rest, len)?;
                next = rest[0];
                rest = &rest[len..];
            }
            // no next header
            59 => {
                upper.protocol = Some(TransportProtocol::None);
                return Ok(upper);
            }
            proto => {
                upper.protocol = Some(TransportProtocol::from_ip_proto(proto));
                parse_ports(proto, rest, &mut upper)?;
                return Ok(upper);
            }
        }
    }
}

fn parse_ports(proto: u8, buf: &[u8], upper: &mut Upper) -> Result<(), MalformedPacketError> {
    let layer = match proto {
        IP_PROTO_TCP => "tcp",
        IP_PROTO_UDP => "udp",
        _ => return Ok(()),
    };
    need(layer, buf, 4)?;
    upper.source_port = Some(NetworkEndian::read_u16(&buf[0..2]));
    upper.dest_port = Some(NetworkEndian::read_u16(&buf[2..4]));
    Ok(())
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    fn ethernet(dst: [u8; 6], src: [u8; 6], ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// ARP request from `sender` asking for `target`.
    pub fn arp_request(sender_mac: [u8; 6], sender: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
        let mut arp = Vec::with_capacity(ARP_LEN);
        arp.extend_from_slice(&1u16.to_be_bytes());
        arp.extend_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
        arp.extend_from_slice(&[6, 4]);
        arp.extend_from_slice(&1u16.to_be_bytes());
        arp.extend_from_slice(&sender_mac);
        arp.extend_from_slice(&sender.octets());
        arp.extend_from_slice(&[0; 6]);
        arp.extend_from_slice(&target.octets());
        ethernet([0xff; 6], sender_mac, ETH_TYPE_ARP, &arp)
    }

    /// IPv4 UDP datagram with `payload_len` zero bytes of payload.
    pub fn ipv4_udp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload_len: usize,
    ) -> Vec<u8> {
        let total = IPV4_MIN_HEADER_LEN + 8 + payload_len;
        let mut ip = Vec::with_capacity(total);
        ip.push(0x45);
        ip.push(0);
        ip.extend_from_slice(&u16::try_from(total).unwrap_or(u16::MAX).to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0x40, 0]);
        ip.push(64);
        ip.push(IP_PROTO_UDP);
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        ip.extend_from_slice(&src_port.to_be_bytes());
        ip.extend_from_slice(&dst_port.to_be_bytes());
        ip.extend_from_slice(&u16::try_from(8 + payload_len).unwrap_or(u16::MAX).to_be_bytes());
        ip.extend_from_slice(&[0, 0]);
        ip.resize(total, 0);
        ethernet(
            [0x02, 0, 0, 0, 0, 0x02],
            [0x02, 0, 0, 0, 0, 0x01],
            ETH_TYPE_IPV4,
            &ip,
        )
    }

    /// Frame with an arbitrary ether type and payload.
    pub fn raw(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        ethernet([0x02, 0, 0, 0, 0, 0x02], [0x02, 0, 0, 0, 0, 0x01], ether_type, payload)
    }
}
