//! Packet builders shared by the unit tests.

use crate::packet::Packet;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket, UdpRepr};
use std::net::{Ipv4Addr, SocketAddrV4};

pub(crate) const CLIENT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), 40000);
pub(crate) const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 21);

fn emit_ipv4(
    bytes: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpProtocol,
    payload_len: usize,
) {
    let ip_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: proto,
        payload_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(bytes);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
}

/// TCP segment with ACK set, raw `options` (multiple of four bytes).
pub(crate) fn tcp_between(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    options: &[u8],
    payload: &[u8],
) -> Packet {
    assert_eq!(options.len() % 4, 0, "options must be padded");
    let header_len = 20 + options.len();
    let tcp_len = header_len + payload.len();
    let mut bytes = vec![0u8; 20 + tcp_len];
    emit_ipv4(&mut bytes, *src.ip(), *dst.ip(), IpProtocol::Tcp, tcp_len);

    let segment = &mut bytes[20..];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = ((header_len / 4) as u8) << 4;
    segment[13] = 0x18; // PSH | ACK
    segment[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    segment[20..header_len].copy_from_slice(options);
    segment[header_len..].copy_from_slice(payload);

    TcpPacket::new_unchecked(&mut bytes[20..])
        .fill_checksum(&IpAddress::Ipv4(*src.ip()), &IpAddress::Ipv4(*dst.ip()));

    Packet::new(bytes).unwrap()
}

pub(crate) fn tcp_packet(seq: u32, ack: u32, options: &[u8], payload: &[u8]) -> Packet {
    tcp_between(CLIENT, SERVER, seq, ack, options, payload)
}

pub(crate) fn udp_packet(payload: &[u8]) -> Packet {
    let udp_len = 8 + payload.len();
    let mut bytes = vec![0u8; 20 + udp_len];
    emit_ipv4(&mut bytes, *CLIENT.ip(), *SERVER.ip(), IpProtocol::Udp, udp_len);

    let udp_repr = UdpRepr {
        src_port: CLIENT.port(),
        dst_port: 5060,
    };
    let mut udp = UdpPacket::new_unchecked(&mut bytes[20..]);
    udp_repr.emit(
        &mut udp,
        &IpAddress::Ipv4(*CLIENT.ip()),
        &IpAddress::Ipv4(*SERVER.ip()),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    Packet::new(bytes).unwrap()
}

/// SACK option with two leading NOPs so it stays four-byte aligned.
pub(crate) fn sack_option(blocks: &[(u32, u32)]) -> Vec<u8> {
    let mut option = vec![1, 1, 5, (2 + 8 * blocks.len()) as u8];
    for (start, end) in blocks {
        option.extend_from_slice(&start.to_be_bytes());
        option.extend_from_slice(&end.to_be_bytes());
    }
    option
}

/// SACK blocks as they appear in the packet's options.
pub(crate) fn sack_blocks(packet: &Packet) -> Vec<(u32, u32)> {
    let tcp = packet.tcp().unwrap();
    let options = tcp.options();
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => break,
            1 => i += 1,
            kind => {
                let len = options[i + 1] as usize;
                if kind == 5 {
                    for block in options[i + 2..i + len].chunks_exact(8) {
                        let start = u32::from_be_bytes(block[0..4].try_into().unwrap());
                        let end = u32::from_be_bytes(block[4..8].try_into().unwrap());
                        blocks.push((start, end));
                    }
                }
                i += len;
            }
        }
    }
    blocks
}

pub(crate) fn transport_checksum_ok(packet: &Packet) -> bool {
    let src = IpAddress::Ipv4(packet.src_addr());
    let dst = IpAddress::Ipv4(packet.dst_addr());
    match packet.protocol() {
        IpProtocol::Tcp => packet.tcp().unwrap().verify_checksum(&src, &dst),
        IpProtocol::Udp => packet.udp().unwrap().verify_checksum(&src, &dst),
        _ => false,
    }
}
