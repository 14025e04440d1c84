//! Payload substitution for TCP and UDP packets.
//!
//! A helper describes what to replace with a [`MangleRequest`]; this module
//! resizes the packet, moves the trailing payload, writes the replacement,
//! recomputes the transport checksum and, for TCP, records the length change
//! so later segments can be shifted in sequence space.

use crate::conntrack::Connection;
use crate::error::PacketError;
use crate::packet::Packet;
use natmangle_core::{Direction, EngineConfig};

/// Replace `match_len` payload bytes at `match_offset` with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangleRequest {
    /// Offset from the start of the transport payload.
    pub match_offset: usize,
    pub match_len: usize,
    pub replacement: Vec<u8>,
}

impl MangleRequest {
    pub fn new(match_offset: usize, match_len: usize, replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            match_offset,
            match_len,
            replacement: replacement.into(),
        }
    }

    pub fn insert(offset: usize, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(offset, 0, bytes)
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::new(offset, len, Vec::new())
    }

    /// Net change in payload length.
    pub fn delta(&self) -> isize {
        self.replacement.len() as isize - self.match_len as isize
    }

    fn check(&self, payload_len: usize) -> Result<(), PacketError> {
        match self.match_offset.checked_add(self.match_len) {
            Some(end) if end <= payload_len => Ok(()),
            _ => Err(PacketError::MatchOutOfRange {
                offset: self.match_offset,
                len: self.match_len,
                payload_len,
            }),
        }
    }
}

/// Rewrite part of a TCP payload and record the resulting sequence shift.
pub fn mangle_tcp(
    conn: &Connection,
    dir: Direction,
    packet: Packet,
    request: &MangleRequest,
    config: &EngineConfig,
) -> Result<Packet, PacketError> {
    let seq = packet.tcp()?.seq_number().0 as u32;

    let mut packet = splice(packet, request, config)?;
    packet.fill_transport_checksum()?;

    let delta = request.delta();
    if delta != 0 {
        // Bounded by the 64 KiB packet limit.
        conn.record_event(dir, seq, delta as i32);
    }

    tracing::debug!(
        "NAT: mangled TCP {:?} seq={} at +{} ({} -> {} bytes)",
        dir,
        seq,
        request.match_offset,
        request.match_len,
        request.replacement.len()
    );

    Ok(packet)
}

/// Rewrite part of a UDP payload. UDP has no stream position to track.
pub fn mangle_udp(
    packet: Packet,
    request: &MangleRequest,
    config: &EngineConfig,
) -> Result<Packet, PacketError> {
    packet.udp()?;

    let mut packet = splice(packet, request, config)?;
    packet.fill_transport_checksum()?;

    tracing::debug!(
        "NAT: mangled UDP at +{} ({} -> {} bytes)",
        request.match_offset,
        request.match_len,
        request.replacement.len()
    );

    Ok(packet)
}

/// Resize the packet and move bytes so that `request.replacement` sits
/// where the matched bytes used to be.
fn splice(
    mut packet: Packet,
    request: &MangleRequest,
    config: &EngineConfig,
) -> Result<Packet, PacketError> {
    let payload_offset = packet.payload_offset()?;
    request.check(packet.len() - payload_offset)?;

    let old_len = packet.len();
    let new_len = old_len - request.match_len + request.replacement.len();
    let match_start = payload_offset + request.match_offset;
    let old_tail = match_start + request.match_len;
    let new_tail = match_start + request.replacement.len();

    if new_len < old_len {
        // Close the gap before the tail is cut off.
        let bytes = packet.bytes_mut()?;
        bytes.copy_within(old_tail..old_len, new_tail);
        packet = packet.resize(new_len, config)?;
    } else {
        packet = packet.resize(new_len, config)?;
        let bytes = packet.bytes_mut()?;
        bytes.copy_within(old_tail..old_len, new_tail);
    }

    let bytes = packet.bytes_mut()?;
    bytes[match_start..new_tail].copy_from_slice(&request.replacement);
    Ok(packet)
}
