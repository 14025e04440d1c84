//! Per-connection rewriting state.
//!
//! Connection tracking owns the flow; this is the part of it the engine
//! needs: both directions' sequence records and the helper the flow was
//! bound to when it was created.

use crate::helper::{Helper, Registration};
use crate::seq::SeqOffsets;
use natmangle_core::{Direction, Tuple};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

pub struct Connection {
    tuple: Tuple,
    /// Guards both directions together: the adjuster reads one while the
    /// mangler may be writing the other.
    seq: Mutex<SeqOffsets>,
    helper: OnceLock<Weak<Registration>>,
    terminated: AtomicBool,
}

impl Connection {
    /// Allocate state for a new flow, identified by its original tuple.
    pub fn new(tuple: Tuple) -> Arc<Self> {
        Arc::new(Self {
            tuple,
            seq: Mutex::new(SeqOffsets::default()),
            helper: OnceLock::new(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    /// Snapshot of both directions' sequence records.
    pub fn seq_offsets(&self) -> SeqOffsets {
        *self.lock_seq()
    }

    /// Record a length change of `delta` bytes in the segment at `seq`.
    pub fn record_event(&self, dir: Direction, seq: u32, delta: i32) -> bool {
        let mut offsets = self.lock_seq();
        let changed = offsets[dir].record_event(seq, delta);
        if changed {
            let record = offsets[dir];
            tracing::debug!(
                "NAT: {:?} seq offset now pos={} before={} after={}",
                dir,
                record.correction_pos,
                record.offset_before,
                record.offset_after
            );
        } else {
            tracing::trace!("NAT: {:?} seq={} already covered, offsets unchanged", dir, seq);
        }
        changed
    }

    /// The helper serving this flow, if it is still registered.
    pub fn helper(&self) -> Option<Arc<Helper>> {
        self.helper
            .get()
            .and_then(Weak::upgrade)
            .map(|registration| registration.helper().clone())
    }

    /// Whether the flow was bound to a helper at creation time.
    pub fn is_bound(&self) -> bool {
        self.helper.get().is_some()
    }

    /// Stop serving this flow. Its packets are dropped from now on.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "NAT: terminating connection {} -> {}",
                self.tuple.src,
                self.tuple.dst
            );
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, registration: Weak<Registration>) -> bool {
        self.helper.set(registration).is_ok()
    }

    pub(crate) fn registration(&self) -> Option<Arc<Registration>> {
        self.helper.get().and_then(Weak::upgrade)
    }

    fn lock_seq(&self) -> MutexGuard<'_, SeqOffsets> {
        // Records are plain values; a panic elsewhere cannot leave them torn.
        self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tuple", &self.tuple)
            .field("seq", &self.seq_offsets())
            .field("bound", &self.is_bound())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
