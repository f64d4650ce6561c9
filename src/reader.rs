//! Reader slot management for MVCC
//!
//! Read transactions publish their snapshot txnid in a slot so the
//! free-space manager knows which retired pages are still visible to some
//! snapshot. Slots are claimed by CAS on the txnid word and each slot is
//! exactly one cache line to keep reader churn from false-sharing.

use crate::error::{Error, Result, TxnId};
use static_assertions::const_assert;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Default number of reader slots
pub const MAX_READERS: usize = 126;

/// One reader slot; exactly 64 bytes.
///
/// `txnid == 0` means the slot is free.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ReaderSlot {
    /// Snapshot transaction id; claimed by CAS from 0
    pub txnid: AtomicU64,
    /// Owning thread id
    pub tid: AtomicU64,
    /// Owning process id
    pub pid: AtomicU32,
    _pad: [u8; 44],
}

const_assert!(size_of::<ReaderSlot>() == 64);

impl ReaderSlot {
    fn new() -> Self {
        Self {
            txnid: AtomicU64::new(0),
            tid: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            _pad: [0; 44],
        }
    }

    /// Try to claim the slot for `txnid`
    fn try_claim(&self, txnid: TxnId) -> bool {
        if self
            .txnid
            .compare_exchange(0, txnid.0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.pid.store(std::process::id(), Ordering::Release);
        self.tid.store(thread_id(), Ordering::Release);
        true
    }

    /// Release the slot
    fn release(&self) {
        self.pid.store(0, Ordering::Release);
        self.tid.store(0, Ordering::Release);
        // Clearing the txnid last is what makes the slot claimable again.
        self.txnid.store(0, Ordering::Release);
    }

    /// Whether the owning process has died without releasing the slot
    fn is_stale(&self) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 || self.txnid.load(Ordering::Acquire) == 0 {
            return false;
        }

        #[cfg(unix)]
        {
            // Signal 0 probes for existence without delivering anything.
            unsafe { libc::kill(pid as i32, 0) != 0 }
        }

        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Fixed-size table of reader slots
pub struct ReaderTable {
    slots: Vec<ReaderSlot>,
}

impl ReaderTable {
    /// Create a table with `max_readers` slots
    pub fn new(max_readers: usize) -> Self {
        Self { slots: (0..max_readers).map(|_| ReaderSlot::new()).collect() }
    }

    /// Claim the first free slot for `txnid`, reclaiming slots left behind by
    /// dead processes if the table looks full.
    pub fn claim(&self, txnid: TxnId) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.try_claim(txnid) {
                return Ok(i);
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_stale() {
                tracing::warn!(slot = i, "reclaiming reader slot from dead process");
                slot.release();
                if slot.try_claim(txnid) {
                    return Ok(i);
                }
            }
        }
        Err(Error::ReadersFull)
    }

    /// Update the published snapshot txnid of a claimed slot
    pub fn update(&self, index: usize, txnid: TxnId) {
        if let Some(slot) = self.slots.get(index) {
            slot.txnid.store(txnid.0, Ordering::Release);
        }
    }

    /// Release a claimed slot
    pub fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.release();
        }
    }

    /// Smallest snapshot txnid held by any active reader; `TxnId(0)` when no
    /// reader holds a snapshot.
    pub fn oldest_reader(&self) -> TxnId {
        let mut oldest = 0u64;
        for slot in &self.slots {
            let txnid = slot.txnid.load(Ordering::Acquire);
            if txnid != 0 && (oldest == 0 || txnid < oldest) {
                oldest = txnid;
            }
        }
        TxnId(oldest)
    }

    /// Number of active readers
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.txnid.load(Ordering::Acquire) != 0).count()
    }
}

#[cfg(unix)]
fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
fn thread_id() -> u64 {
    0
}
