//! Per-packet entry point used by connection tracking.
//!
//! Connection tracking calls [`NatEngine::on_create`] for each new flow,
//! [`NatEngine::for_each_packet`] for every packet of it in either
//! direction, and [`NatEngine::on_destroy`] when the flow goes away.

use crate::adjust::adjust;
use crate::conntrack::Connection;
use crate::error::PacketError;
use crate::helper::{HelpAction, HelperRegistry};
use crate::mangle::{mangle_tcp, mangle_udp};
use crate::packet::Packet;
use natmangle_core::{Direction, EngineConfig, Tuple};
use smoltcp::wire::IpProtocol;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a packet was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OutOfMemory,
    TooLarge,
    Malformed,
    /// The helper rejected the payload.
    Helper,
    /// The connection was terminated (its helper went away or it was destroyed).
    Terminated,
}

impl From<&PacketError> for DropReason {
    fn from(err: &PacketError) -> Self {
        match err {
            PacketError::OutOfMemory => DropReason::OutOfMemory,
            PacketError::TooLarge { .. } => DropReason::TooLarge,
            PacketError::Malformed(_)
            | PacketError::MatchOutOfRange { .. }
            | PacketError::NotTcp
            | PacketError::NotUdp => DropReason::Malformed,
        }
    }
}

/// Outcome of processing one packet.
#[derive(Debug)]
pub enum Verdict {
    Accept(Packet),
    Drop(DropReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }
}

/// Snapshot of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub accepted: u64,
    pub mangled: u64,
    pub dropped_oom: u64,
    pub dropped_too_large: u64,
    pub dropped_malformed: u64,
    pub dropped_helper: u64,
    pub dropped_terminated: u64,
    /// Segments whose TCP option walk stopped on a malformed option.
    pub sack_truncated: u64,
}

impl EngineStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_oom
            + self.dropped_too_large
            + self.dropped_malformed
            + self.dropped_helper
            + self.dropped_terminated
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    mangled: AtomicU64,
    dropped_oom: AtomicU64,
    dropped_too_large: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_helper: AtomicU64,
    dropped_terminated: AtomicU64,
    sack_truncated: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::OutOfMemory => &self.dropped_oom,
            DropReason::TooLarge => &self.dropped_too_large,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Helper => &self.dropped_helper,
            DropReason::Terminated => &self.dropped_terminated,
        };
        Self::bump(counter);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            mangled: self.mangled.load(Ordering::Relaxed),
            dropped_oom: self.dropped_oom.load(Ordering::Relaxed),
            dropped_too_large: self.dropped_too_large.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_helper: self.dropped_helper.load(Ordering::Relaxed),
            dropped_terminated: self.dropped_terminated.load(Ordering::Relaxed),
            sack_truncated: self.sack_truncated.load(Ordering::Relaxed),
        }
    }
}

pub struct NatEngine {
    config: EngineConfig,
    registry: Arc<HelperRegistry>,
    counters: Counters,
}

impl NatEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<HelperRegistry>,
    ) -> natmangle_core::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HelperRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Set up rewriting state for a new flow and bind its helper, if any.
    pub fn on_create(&self, tuple: Tuple) -> Arc<Connection> {
        let conn = Connection::new(tuple);
        match self.registry.bind(&conn) {
            Some(helper) => tracing::debug!(
                "NAT: {} -> {} bound to helper {}",
                tuple.src,
                tuple.dst,
                helper.name()
            ),
            None => tracing::trace!("NAT: {} -> {} has no helper", tuple.src, tuple.dst),
        }
        conn
    }

    pub fn on_destroy(&self, conn: &Connection) {
        conn.terminate();
        self.registry.unbind(conn);
    }

    /// Run one packet of `conn` travelling in `dir` through the helper and
    /// the sequence adjuster.
    pub fn for_each_packet(&self, conn: &Connection, dir: Direction, packet: Packet) -> Verdict {
        if conn.is_terminated() {
            return self.reject(DropReason::Terminated);
        }

        match self.process(conn, dir, packet) {
            Ok(Some(packet)) => {
                Counters::bump(&self.counters.accepted);
                Verdict::Accept(packet)
            }
            Ok(None) => self.reject(DropReason::Helper),
            Err(err) => {
                let reason = DropReason::from(&err);
                match reason {
                    DropReason::OutOfMemory | DropReason::TooLarge => {
                        tracing::warn!("NAT: dropping {:?} packet: {}", dir, err)
                    }
                    _ => tracing::debug!("NAT: dropping {:?} packet: {}", dir, err),
                }
                self.reject(reason)
            }
        }
    }

    /// `Ok(None)` means the helper asked for the packet to be dropped.
    fn process(
        &self,
        conn: &Connection,
        dir: Direction,
        mut packet: Packet,
    ) -> Result<Option<Packet>, PacketError> {
        if let Some(helper) = conn.helper() {
            let action = helper.help(conn, dir, packet.payload()?);
            match action {
                HelpAction::Pass => {}
                HelpAction::Drop => {
                    tracing::debug!("NAT: helper {} rejected {:?} packet", helper.name(), dir);
                    return Ok(None);
                }
                HelpAction::Mangle(request) => {
                    packet = match packet.protocol() {
                        IpProtocol::Tcp => mangle_tcp(conn, dir, packet, &request, &self.config)?,
                        IpProtocol::Udp => mangle_udp(packet, &request, &self.config)?,
                        _ => return Err(PacketError::Malformed("no TCP or UDP payload")),
                    };
                    Counters::bump(&self.counters.mangled);
                }
            }
        }

        if self.config.adjust_sequence && packet.protocol() == IpProtocol::Tcp {
            let outcome = adjust(conn, dir, &mut packet, self.config.adjust_sack)?;
            if outcome.options_truncated {
                Counters::bump(&self.counters.sack_truncated);
            }
        }

        Ok(Some(packet))
    }

    fn reject(&self, reason: DropReason) -> Verdict {
        self.counters.dropped(reason);
        Verdict::Drop(reason)
    }
}

impl std::fmt::Debug for NatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stats", &self.stats())
            .finish()
    }
}
