mod adjust;
pub mod checksum;
mod conntrack;
mod engine;
mod error;
mod helper;
mod mangle;
mod packet;
mod seq;

#[cfg(test)]
mod testutil;

pub use adjust::{AdjustOutcome, adjust};
pub use conntrack::Connection;
pub use engine::{DropReason, EngineStats, NatEngine, Verdict};
pub use error::{EBUSY, EEXIST, NotFound, PacketError, RegistryError, status_code};
pub use helper::{
    DependencyHandle, DependencyResolver, HelpAction, Helper, HelperOps, HelperRegistry,
    StaticResolver,
};
pub use mangle::{MangleRequest, mangle_tcp, mangle_udp};
pub use packet::{Packet, TCP_HEADER_LEN, UDP_HEADER_LEN};
pub use seq::{SeqOffset, SeqOffsets, seq_after};
