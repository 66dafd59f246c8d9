use std::fmt;

use crate::config::KeyMode;
use crate::packet::{Packet, Transport};

/// Which side of its flow a packet travelled.
///
/// Forward means the source address sorts before the destination address
/// byte-wise. It is a stable labelling, not the connection initiator.
/// Equal addresses count as backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn of(src_addr: &str, dst_addr: &str) -> Self {
        if src_addr.as_bytes() < dst_addr.as_bytes() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: String,
    /// 0 unless the key mode distinguishes ports
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Canonical flow identity. Both directions of a conversation map to the same
/// key because the endpoints are stored in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowKey {
    /// The whole capture as one flow
    Capture,
    Conversation {
        low: Endpoint,
        high: Endpoint,
        transport: Transport,
    },
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::Capture => write!(f, "capture"),
            FlowKey::Conversation { low, high, transport } => {
                write!(f, "{} <-> {} ({})", low, high, transport)
            }
        }
    }
}

/// Key and direction for a packet, or `None` when it lacks a network or
/// transport layer and cannot be placed in a flow.
pub fn resolve(packet: &Packet, mode: KeyMode) -> Option<(FlowKey, Direction)> {
    let network = packet.network.as_ref()?;
    let transport = packet.transport.as_ref()?;
    let direction = Direction::of(&network.src_addr, &network.dst_addr);

    let (src_port, dst_port) = match mode {
        KeyMode::SingleFlow => return Some((FlowKey::Capture, direction)),
        KeyMode::AddressPair => (0, 0),
        KeyMode::FiveTuple => (transport.src_port, transport.dst_port),
    };
    let src = Endpoint {
        addr: network.src_addr.clone(),
        port: src_port,
    };
    let dst = Endpoint {
        addr: network.dst_addr.clone(),
        port: dst_port,
    };
    let (low, high) = if src <= dst { (src, dst) } else { (dst, src) };
    Some((
        FlowKey::Conversation {
            low,
            high,
            transport: transport.protocol,
        },
        direction,
    ))
}
