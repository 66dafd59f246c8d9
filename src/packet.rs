//! Packet normalizer: turns a raw frame into the minimal [`Packet`] record the
//! flow stages need. Decoding is best effort. A header that is missing,
//! truncated or malformed leaves its layer as `None` and never stops the run.

use std::fmt;

use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;

use crate::capture::{LinkLayer, RawFrame};

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const NULL_HEADER_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkLayer {
    pub src_addr: String,
    pub dst_addr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportLayer {
    pub protocol: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    /// Payload bytes carried by the segment or datagram
    pub payload_len: u64,
    pub syn: bool,
    pub fin: bool,
}

/// A decoded packet, reduced to the fields flow accounting reads.
///
/// `transport` is only ever `Some` when `network` is.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub index: u64,
    pub timestamp: f64,
    /// Seconds since the previous frame of the capture, never negative
    pub inter_arrival_delta: f64,
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
}

impl Packet {
    pub fn has_network_layer(&self) -> bool {
        self.network.is_some()
    }

    pub fn has_transport_layer(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport_len(&self) -> u64 {
        self.transport.as_ref().map_or(0, |t| t.payload_len)
    }

    pub fn syn_flag(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.syn)
    }

    pub fn fin_flag(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.fin)
    }
}

/// Decodes a frame with TCP as the only transport. A UDP datagram keeps its
/// network layer but has no transport layer.
pub fn normalize(frame: &RawFrame) -> Packet {
    normalize_with(frame, false)
}

/// Like [`normalize`], with UDP datagrams also decoded into a transport
/// layer when `include_udp` is set.
pub fn normalize_with(frame: &RawFrame, include_udp: bool) -> Packet {
    let (network, transport) = match network_bytes(frame.link, &frame.data) {
        Some(ip) => decode_ip(ip, include_udp),
        None => (None, None),
    };
    Packet {
        index: frame.number,
        timestamp: frame.timestamp,
        inter_arrival_delta: frame.time_delta.max(0.0),
        network,
        transport,
    }
}

/// Strips the link-layer header, returning the bytes of an IP packet.
fn network_bytes(link: LinkLayer, data: &[u8]) -> Option<&[u8]> {
    match link {
        LinkLayer::Ethernet => {
            let eth = EthernetPacket::new(data)?;
            let mut ethertype = eth.get_ethertype();
            let mut offset = ETHERNET_HEADER_LEN;
            if ethertype == EtherTypes::Vlan {
                let vlan = VlanPacket::new(data.get(offset..)?)?;
                ethertype = vlan.get_ethertype();
                offset += VLAN_TAG_LEN;
            }
            ip_ethertype(ethertype).then(|| data.get(offset..)).flatten()
        }
        LinkLayer::LinuxSll => {
            let proto = data.get(14..SLL_HEADER_LEN)?;
            let ethertype = EtherType(u16::from_be_bytes([proto[0], proto[1]]));
            ip_ethertype(ethertype).then(|| data.get(SLL_HEADER_LEN..)).flatten()
        }
        // family codes for IPv6 differ between BSDs, so trust the version nibble
        LinkLayer::Null => data.get(NULL_HEADER_LEN..),
        LinkLayer::RawIp => Some(data),
        LinkLayer::Unsupported(_) => None,
    }
}

fn ip_ethertype(ethertype: EtherType) -> bool {
    ethertype == EtherTypes::Ipv4 || ethertype == EtherTypes::Ipv6
}

fn decode_ip(bytes: &[u8], include_udp: bool) -> (Option<NetworkLayer>, Option<TransportLayer>) {
    match bytes.first().map(|b| b >> 4) {
        Some(4) => decode_ipv4(bytes, include_udp),
        Some(6) => decode_ipv6(bytes, include_udp),
        _ => (None, None),
    }
}

fn decode_ipv4(bytes: &[u8], include_udp: bool) -> (Option<NetworkLayer>, Option<TransportLayer>) {
    let Some(ipv4) = Ipv4Packet::new(bytes) else {
        return (None, None);
    };
    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > bytes.len() {
        return (None, None);
    }
    let network = NetworkLayer {
        src_addr: ipv4.get_source().to_string(),
        dst_addr: ipv4.get_destination().to_string(),
    };
    // later fragments carry no transport header
    if ipv4.get_fragment_offset() != 0 {
        return (Some(network), None);
    }
    let total_len = ipv4.get_total_length() as usize;
    let end = if total_len >= header_len { total_len.min(bytes.len()) } else { bytes.len() };
    let transport = decode_transport(ipv4.get_next_level_protocol(), &bytes[header_len..end], include_udp);
    (Some(network), transport)
}

fn decode_ipv6(bytes: &[u8], include_udp: bool) -> (Option<NetworkLayer>, Option<TransportLayer>) {
    let Some(ipv6) = Ipv6Packet::new(bytes) else {
        return (None, None);
    };
    let network = NetworkLayer {
        src_addr: ipv6.get_source().to_string(),
        dst_addr: ipv6.get_destination().to_string(),
    };
    let end = (IPV6_HEADER_LEN + ipv6.get_payload_length() as usize).min(bytes.len());
    let transport = decode_transport(ipv6.get_next_header(), &bytes[IPV6_HEADER_LEN..end], include_udp);
    (Some(network), transport)
}

fn decode_transport(protocol: IpNextHeaderProtocol, segment: &[u8], include_udp: bool) -> Option<TransportLayer> {
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(segment)?;
            let header_len = tcp.get_data_offset() as usize * 4;
            if header_len < TCP_MIN_HEADER_LEN || header_len > segment.len() {
                return None;
            }
            let flags = tcp.get_flags();
            Some(TransportLayer {
                protocol: Transport::Tcp,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                payload_len: (segment.len() - header_len) as u64,
                syn: flags & TcpFlags::SYN != 0,
                fin: flags & TcpFlags::FIN != 0,
            })
        }
        IpNextHeaderProtocols::Udp if include_udp => {
            let udp = UdpPacket::new(segment)?;
            let datagram_len = (udp.get_length() as usize).min(segment.len());
            Some(TransportLayer {
                protocol: Transport::Udp,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload_len: datagram_len.saturating_sub(UDP_HEADER_LEN) as u64,
                syn: false,
                fin: false,
            })
        }
        _ => None,
    }
}
