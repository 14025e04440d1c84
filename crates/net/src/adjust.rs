//! Sequence, acknowledgment and SACK rewriting for every TCP segment.
//!
//! Once a payload rewrite has changed the length of a stream, both ends see
//! different byte positions for the same data. Outgoing sequence numbers are
//! shifted into the rewritten space of their own direction; acknowledgments
//! and SACK edges refer to the peer's stream and are shifted back into the
//! peer's original space.

use crate::checksum;
use crate::conntrack::Connection;
use crate::error::PacketError;
use crate::packet::{Packet, TCP_HEADER_LEN};
use crate::seq::SeqOffset;
use natmangle_core::Direction;
use smoltcp::wire::{TcpPacket, TcpSeqNumber};

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_SACK: u8 = 5;

/// Offset of the TCP checksum inside the segment.
const CHECKSUM_AT: usize = 16;

/// What `adjust` changed in one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjustOutcome {
    /// Sequence or acknowledgment number was rewritten.
    pub seq_rewritten: bool,
    /// Number of SACK blocks with at least one rewritten edge.
    pub sack_blocks: usize,
    /// Option parsing stopped early on a malformed option.
    pub options_truncated: bool,
}

impl AdjustOutcome {
    pub fn is_noop(&self) -> bool {
        !self.seq_rewritten && self.sack_blocks == 0
    }
}

/// A 32-bit field at `at` (segment-relative) changing from `old` to `new`.
#[derive(Debug, Clone, Copy)]
struct Patch {
    at: usize,
    old: u32,
    new: u32,
}

/// Translate the sequence space of a TCP segment travelling in `dir`.
///
/// `sack` controls whether SACK option blocks are rewritten as well. A
/// malformed option list is not an error: the walk stops and whatever was
/// already rewritten stays valid.
pub fn adjust(
    conn: &Connection,
    dir: Direction,
    packet: &mut Packet,
    sack: bool,
) -> Result<AdjustOutcome, PacketError> {
    let offsets = conn.seq_offsets();
    if offsets.is_identity() {
        packet.tcp()?;
        return Ok(AdjustOutcome::default());
    }
    let this_way = offsets[dir];
    let other_way = offsets[!dir];

    let mut outcome = AdjustOutcome::default();
    let (seq, new_seq, ack, new_ack, sack_patches) = {
        let tcp = packet.tcp()?;
        let seq = tcp.seq_number().0 as u32;
        let ack = tcp.ack_number().0 as u32;
        let sack_patches = if sack {
            sack_patches(&tcp, &other_way, &mut outcome)
        } else {
            Vec::new()
        };
        (
            seq,
            this_way.translate_seq(seq),
            ack,
            other_way.untranslate(ack),
            sack_patches,
        )
    };

    outcome.seq_rewritten = seq != new_seq || ack != new_ack;
    if outcome.is_noop() {
        return Ok(outcome);
    }

    let segment = packet.segment_mut()?;
    let mut tcp = TcpPacket::new_unchecked(&mut *segment);
    let mut check = tcp.checksum();
    if seq != new_seq {
        tcp.set_seq_number(TcpSeqNumber(new_seq as i32));
        check = checksum::update_u32(check, seq, new_seq);
    }
    if ack != new_ack {
        tcp.set_ack_number(TcpSeqNumber(new_ack as i32));
        check = checksum::update_u32(check, ack, new_ack);
    }
    for patch in &sack_patches {
        segment[patch.at..patch.at + 4].copy_from_slice(&patch.new.to_be_bytes());
        check = checksum::update_u32(check, patch.old, patch.new);
    }
    segment[CHECKSUM_AT..CHECKSUM_AT + 2].copy_from_slice(&check.to_be_bytes());

    tracing::trace!(
        "NAT: {:?} seq {} -> {}, ack {} -> {}, {} SACK blocks",
        dir,
        seq,
        new_seq,
        ack,
        new_ack,
        outcome.sack_blocks
    );
    Ok(outcome)
}

/// Walk the option list and collect the SACK edges that need rewriting.
fn sack_patches(
    tcp: &TcpPacket<&[u8]>,
    other_way: &SeqOffset,
    outcome: &mut AdjustOutcome,
) -> Vec<Patch> {
    let options = tcp.options();
    let mut patches = Vec::new();
    let mut off = 0;

    while off < options.len() {
        match options[off] {
            OPT_EOL => break,
            OPT_NOP => {
                off += 1;
                continue;
            }
            _ => {}
        }

        // Kind and length must both be present and the length consistent.
        if off + 1 >= options.len() {
            outcome.options_truncated = true;
            break;
        }
        let len = options[off + 1] as usize;
        if len < 2 || off + len > options.len() {
            outcome.options_truncated = true;
            break;
        }

        if options[off] == OPT_SACK && len >= 10 && (len - 2) % 8 == 0 {
            for (n, block) in options[off + 2..off + len].chunks_exact(8).enumerate() {
                let base = TCP_HEADER_LEN + off + 2 + 8 * n;
                let mut changed = false;
                for (i, edge) in block.chunks_exact(4).enumerate() {
                    let old = u32::from_be_bytes([edge[0], edge[1], edge[2], edge[3]]);
                    let new = other_way.untranslate(old);
                    if new != old {
                        patches.push(Patch {
                            at: base + 4 * i,
                            old,
                            new,
                        });
                        changed = true;
                    }
                }
                if changed {
                    outcome.sack_blocks += 1;
                }
            }
        }
        off += len;
    }

    if outcome.options_truncated {
        tracing::debug!("NAT: malformed TCP option at offset {}, SACK walk stopped", off);
    }
    patches
}
