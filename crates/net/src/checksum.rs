//! Internet checksum arithmetic.
//!
//! Rewriting a header field does not require rescanning the packet: the
//! one's complement sum can be patched with the old and new field values
//! (RFC 1624, `~C' = ~C + ~m + m'`). These helpers work on plain values so
//! they stay independent of any packet buffer.

/// Fold a 32-bit accumulator into 16 bits with end-around carry.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Patch `check` after a 16-bit field changed from `old` to `new`.
#[inline]
pub fn update_u16(check: u16, old: u16, new: u16) -> u16 {
    let sum = (!check as u32) + (!old as u32) + new as u32;
    !fold(sum)
}

/// Patch `check` after a 32-bit field changed from `old` to `new`.
#[inline]
pub fn update_u32(check: u16, old: u32, new: u32) -> u16 {
    let old = !old;
    let sum = (!check as u32) + (old >> 16) + (old & 0xFFFF) + (new >> 16) + (new & 0xFFFF);
    !fold(sum)
}
