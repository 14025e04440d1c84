//! Per-direction sequence offset bookkeeping.
//!
//! Every length-changing rewrite shifts the sequence space of everything the
//! sender transmits afterwards. A record remembers the latest rewrite
//! position and the cumulative offsets on either side of it.

use natmangle_core::Direction;
use smoltcp::wire::TcpSeqNumber;
use std::ops::{Index, IndexMut};

/// True if `a` comes strictly after `b` in 32-bit sequence space.
#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
    TcpSeqNumber(a as i32) > TcpSeqNumber(b as i32)
}

/// Sequence translation state for one direction of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqOffset {
    /// Sequence number of the segment that carried the latest rewrite.
    pub correction_pos: u32,
    /// Cumulative delta for bytes sent before `correction_pos`.
    pub offset_before: i32,
    /// Cumulative delta for bytes sent after `correction_pos`.
    pub offset_after: i32,
}

impl SeqOffset {
    /// No rewrite has ever shifted this direction.
    pub fn is_identity(&self) -> bool {
        self.offset_before == 0 && self.offset_after == 0
    }

    /// Record a rewrite of `delta` bytes in the segment starting at `seq`.
    ///
    /// Retransmissions and late segments at or before the current
    /// correction position leave the record untouched. Returns whether the
    /// record changed.
    pub fn record_event(&mut self, seq: u32, delta: i32) -> bool {
        if self.offset_before != self.offset_after && !seq_after(seq, self.correction_pos) {
            return false;
        }

        self.correction_pos = seq;
        self.offset_before = self.offset_after;
        self.offset_after = self.offset_after.wrapping_add(delta);
        true
    }

    /// Translate a sequence number sent in this direction.
    pub fn translate_seq(&self, seq: u32) -> u32 {
        let offset = if seq_after(seq, self.correction_pos) {
            self.offset_after
        } else {
            self.offset_before
        };
        seq.wrapping_add(offset as u32)
    }

    /// Map a rewritten sequence number (as acknowledged by the peer) back
    /// into the sender's original space.
    pub fn untranslate(&self, seq: u32) -> u32 {
        let original = seq.wrapping_sub(self.offset_before as u32);
        let offset = if seq_after(original, self.correction_pos) {
            self.offset_after
        } else {
            self.offset_before
        };
        seq.wrapping_sub(offset as u32)
    }
}

/// Both directions' records, owned by a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqOffsets([SeqOffset; 2]);

impl SeqOffsets {
    pub fn is_identity(&self) -> bool {
        self.0.iter().all(SeqOffset::is_identity)
    }
}

impl Index<Direction> for SeqOffsets {
    type Output = SeqOffset;

    fn index(&self, dir: Direction) -> &SeqOffset {
        &self.0[dir.index()]
    }
}

impl IndexMut<Direction> for SeqOffsets {
    fn index_mut(&mut self, dir: Direction) -> &mut SeqOffset {
        &mut self.0[dir.index()]
    }
}
