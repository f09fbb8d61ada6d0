//! Transaction activity bookkeeping shared by the interrupt callbacks, the
//! watchdog and the recovery routine.
//!
//! Only 32-bit atomics are used: the Xtensa cores have no 64-bit atomics, and
//! millisecond timestamps are compared with wrapping arithmetic anyway.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct TransactionActivity {
    last_activity_ms: AtomicU32,
    outstanding: AtomicBool,
    completed: AtomicU32,
    recovery_attempts: AtomicU32,
    dropped_packets: AtomicU32,
}

impl TransactionActivity {
    pub const fn new() -> Self {
        Self {
            last_activity_ms: AtomicU32::new(0),
            outstanding: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            recovery_attempts: AtomicU32::new(0),
            dropped_packets: AtomicU32::new(0),
        }
    }

    /// Pre-transaction interrupt
    #[inline]
    pub fn mark_started(&self) {
        self.outstanding.store(true, Ordering::Release);
    }

    /// Post-transaction interrupt
    #[inline]
    pub fn record_completion(&self, now_ms: u32) {
        self.last_activity_ms.store(now_ms, Ordering::Release);
        self.outstanding.store(false, Ordering::Release);
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn record_drop(&self) {
        self.dropped_packets.fetch_add(1, Ordering::AcqRel);
    }

    /// Restart the staleness clock without touching the counters
    pub fn reset(&self, now_ms: u32) {
        self.outstanding.store(false, Ordering::Release);
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    /// Count a recovery attempt; returns the new total
    pub fn begin_recovery(&self) -> u32 {
        self.recovery_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_activity_ms(&self) -> u32 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts.load(Ordering::Acquire)
    }

    pub fn dropped_packets(&self) -> u32 {
        self.dropped_packets.load(Ordering::Acquire)
    }
}
