//! Owned IPv4 packet buffers and resizing.
//!
//! A `Packet` starts at the IPv4 header and may be shared between several
//! owners (for example a copy kept for retransmission). Every write goes
//! through copy-on-write, so a shared buffer is never modified in place.
//! `resize` consumes the packet and hands back the new one, which makes
//! header views borrowed before the call unusable afterwards.

use crate::checksum;
use crate::error::PacketError;
use natmangle_core::EngineConfig;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket, UdpPacket};
use std::sync::Arc;

/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;

/// TCP header size without options.
pub const TCP_HEADER_LEN: usize = 20;

/// An IPv4 datagram carrying TCP or UDP (other protocols pass through).
#[derive(Clone, Debug)]
pub struct Packet {
    buf: Arc<Vec<u8>>,
}

impl Packet {
    /// Validate and wrap a raw IPv4 datagram.
    ///
    /// Bytes beyond the IPv4 total length (link-layer padding) are dropped.
    pub fn new(mut bytes: Vec<u8>) -> Result<Self, PacketError> {
        let total_len = {
            let ip = Ipv4Packet::new_checked(&bytes[..])
                .map_err(|_| PacketError::Malformed("truncated IPv4 header"))?;
            if ip.version() != 4 {
                return Err(PacketError::Malformed("not an IPv4 packet"));
            }
            match ip.next_header() {
                IpProtocol::Tcp => {
                    TcpPacket::new_checked(ip.payload())
                        .map_err(|_| PacketError::Malformed("truncated TCP header"))?;
                }
                IpProtocol::Udp => {
                    let udp = UdpPacket::new_checked(ip.payload())
                        .map_err(|_| PacketError::Malformed("truncated UDP header"))?;
                    if udp.len() as usize != ip.payload().len() {
                        return Err(PacketError::Malformed("UDP length disagrees with IPv4"));
                    }
                }
                _ => {}
            }
            ip.total_len() as usize
        };

        bytes.truncate(total_len);
        Ok(Self {
            buf: Arc::new(bytes),
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether another `Packet` shares this buffer.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buf) > 1
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        Arc::try_unwrap(self.buf).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    pub fn ipv4(&self) -> Ipv4Packet<&[u8]> {
        Ipv4Packet::new_unchecked(&self.buf[..])
    }

    pub fn protocol(&self) -> IpProtocol {
        self.ipv4().next_header()
    }

    pub fn src_addr(&self) -> Ipv4Address {
        self.ipv4().src_addr()
    }

    pub fn dst_addr(&self) -> Ipv4Address {
        self.ipv4().dst_addr()
    }

    /// Length of the IPv4 header including options.
    pub fn header_len(&self) -> usize {
        self.ipv4().header_len() as usize
    }

    /// The TCP or UDP segment (everything after the IPv4 header).
    pub fn segment(&self) -> &[u8] {
        &self.buf[self.header_len()..]
    }

    pub fn tcp(&self) -> Result<TcpPacket<&[u8]>, PacketError> {
        if self.protocol() != IpProtocol::Tcp {
            return Err(PacketError::NotTcp);
        }
        Ok(TcpPacket::new_unchecked(self.segment()))
    }

    pub fn udp(&self) -> Result<UdpPacket<&[u8]>, PacketError> {
        if self.protocol() != IpProtocol::Udp {
            return Err(PacketError::NotUdp);
        }
        Ok(UdpPacket::new_unchecked(self.segment()))
    }

    /// Byte offset of the transport payload from the start of the packet.
    pub fn payload_offset(&self) -> Result<usize, PacketError> {
        let transport_header = match self.protocol() {
            IpProtocol::Tcp => self.tcp()?.header_len() as usize,
            IpProtocol::Udp => UDP_HEADER_LEN,
            _ => return Err(PacketError::Malformed("no TCP or UDP payload")),
        };
        Ok(self.header_len() + transport_header)
    }

    /// The application payload carried by TCP or UDP.
    pub fn payload(&self) -> Result<&[u8], PacketError> {
        let offset = self.payload_offset()?;
        Ok(&self.buf[offset..])
    }

    /// Mutable access to the raw bytes, copying a shared buffer first.
    pub(crate) fn bytes_mut(&mut self) -> Result<&mut Vec<u8>, PacketError> {
        let len = self.buf.len();
        self.make_private(len)?;
        Ok(Arc::make_mut(&mut self.buf))
    }

    /// Mutable access to the transport segment.
    pub(crate) fn segment_mut(&mut self) -> Result<&mut [u8], PacketError> {
        let header_len = self.header_len();
        let bytes = self.bytes_mut()?;
        Ok(&mut bytes[header_len..])
    }

    /// Give this packet its own buffer of at least `capacity` bytes if the
    /// current one is shared.
    fn make_private(&mut self, capacity: usize) -> Result<(), PacketError> {
        if Arc::get_mut(&mut self.buf).is_some() {
            return Ok(());
        }

        let mut copy = Vec::new();
        copy.try_reserve_exact(capacity.max(self.buf.len()))
            .map_err(|_| PacketError::OutOfMemory)?;
        copy.extend_from_slice(&self.buf);
        tracing::trace!("NAT: copied shared packet ({} bytes) before write", copy.len());
        self.buf = Arc::new(copy);
        Ok(())
    }

    /// Grow or shrink the packet to `new_len` bytes in total.
    ///
    /// Added bytes are zeroed at the tail and removed bytes are cut from
    /// the tail; moving payload around is up to the caller. The IPv4 total
    /// length (and its header checksum) and, for UDP, the UDP length field
    /// are updated. Sequence numbers and transport checksums are not.
    pub fn resize(mut self, new_len: usize, config: &EngineConfig) -> Result<Packet, PacketError> {
        let max = config.max_packet_len.min(u16::MAX as usize);
        if new_len > max {
            return Err(PacketError::TooLarge { len: new_len, max });
        }

        let protocol = self.protocol();
        let header_len = self.header_len();
        let min_len = match protocol {
            IpProtocol::Tcp => header_len + self.tcp()?.header_len() as usize,
            IpProtocol::Udp => header_len + UDP_HEADER_LEN,
            _ => header_len,
        };
        if new_len < min_len {
            return Err(PacketError::Malformed("resize would cut into headers"));
        }

        let old_len = self.len();
        let growing = new_len > old_len;
        let wanted_capacity = if growing {
            new_len
                .checked_add(config.tailroom)
                .ok_or(PacketError::OutOfMemory)?
        } else {
            new_len
        };
        self.make_private(wanted_capacity)?;

        let bytes = Arc::make_mut(&mut self.buf);
        if new_len > bytes.capacity() {
            let additional = wanted_capacity.saturating_sub(bytes.len());
            bytes
                .try_reserve_exact(additional)
                .map_err(|_| PacketError::OutOfMemory)?;
            tracing::trace!(
                "NAT: expanded packet buffer {} -> {} bytes",
                old_len,
                bytes.capacity()
            );
        }
        bytes.resize(new_len, 0);

        let mut ip = Ipv4Packet::new_unchecked(&mut bytes[..]);
        let old_total = ip.total_len();
        let new_total = new_len as u16;
        ip.set_total_len(new_total);
        let check = checksum::update_u16(ip.checksum(), old_total, new_total);
        ip.set_checksum(check);

        if protocol == IpProtocol::Udp {
            let mut udp = UdpPacket::new_unchecked(&mut bytes[header_len..]);
            udp.set_len((new_len - header_len) as u16);
        }

        Ok(self)
    }

    /// Recompute the TCP or UDP checksum over the whole segment.
    ///
    /// A UDP datagram sent without a checksum keeps it disabled.
    pub(crate) fn fill_transport_checksum(&mut self) -> Result<(), PacketError> {
        let src = IpAddress::Ipv4(self.src_addr());
        let dst = IpAddress::Ipv4(self.dst_addr());
        let protocol = self.protocol();
        let segment = self.segment_mut()?;

        match protocol {
            IpProtocol::Tcp => {
                TcpPacket::new_unchecked(segment).fill_checksum(&src, &dst);
            }
            IpProtocol::Udp => {
                let mut udp = UdpPacket::new_unchecked(segment);
                if udp.checksum() != 0 {
                    udp.fill_checksum(&src, &dst);
                }
            }
            _ => return Err(PacketError::Malformed("no TCP or UDP checksum")),
        }
        Ok(())
    }
}
