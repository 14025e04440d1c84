use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Not;

/// Transport protocol of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Which half of a bidirectional flow a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the endpoint that opened the connection.
    Original,
    /// Sent back by the responder.
    Reply,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Original => Direction::Reply,
            Direction::Reply => Direction::Original,
        }
    }

    /// Stable index for per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Original => 0,
            Direction::Reply => 1,
        }
    }
}

impl Not for Direction {
    type Output = Direction;

    fn not(self) -> Direction {
        self.reverse()
    }
}

/// Addresses and ports identifying one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub protocol: Protocol,
}

impl Tuple {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, protocol: Protocol) -> Self {
        Self { src, dst, protocol }
    }

    pub fn tcp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(src, dst, Protocol::Tcp)
    }

    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(src, dst, Protocol::Udp)
    }

    /// The same flow as seen from the other end.
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            protocol: self.protocol,
        }
    }
}

/// Bit mask selecting which tuple fields take part in a match.
///
/// A set bit means "must be equal"; a zero mask field matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleMask {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub protocol: bool,
}

impl TupleMask {
    /// Every field must match exactly.
    pub fn exact() -> Self {
        Self {
            src_ip: Ipv4Addr::BROADCAST,
            src_port: u16::MAX,
            dst_ip: Ipv4Addr::BROADCAST,
            dst_port: u16::MAX,
            protocol: true,
        }
    }

    /// Only destination port and protocol matter (the usual helper pattern).
    pub fn service() -> Self {
        Self {
            src_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            dst_port: u16::MAX,
            protocol: true,
        }
    }
}

/// A tuple plus mask, used to decide which helper serves a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TuplePattern {
    pub tuple: Tuple,
    pub mask: TupleMask,
}

impl TuplePattern {
    pub fn new(tuple: Tuple, mask: TupleMask) -> Self {
        Self { tuple, mask }
    }

    /// Matches any flow of `protocol` towards `port`.
    pub fn service(protocol: Protocol, port: u16) -> Self {
        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self {
            tuple: Tuple::new(any, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), protocol),
            mask: TupleMask::service(),
        }
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        let mask = &self.mask;
        let pattern = &self.tuple;

        masked_eq(*tuple.src.ip(), *pattern.src.ip(), mask.src_ip)
            && (tuple.src.port() ^ pattern.src.port()) & mask.src_port == 0
            && masked_eq(*tuple.dst.ip(), *pattern.dst.ip(), mask.dst_ip)
            && (tuple.dst.port() ^ pattern.dst.port()) & mask.dst_port == 0
            && (!mask.protocol || tuple.protocol == pattern.protocol)
    }
}

fn masked_eq(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(a) ^ u32::from(b)) & mask == 0
}
