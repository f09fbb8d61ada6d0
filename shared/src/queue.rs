//! # Inbound Packet Queue
//!
//! Hand-off point between the post-transaction interrupt (producer) and the
//! task loop (consumer).
//!
//! - Interrupt side: `try_lock` only. A contended lock or a full queue drops
//!   the newest packet; the interrupt never waits.
//! - Task side: spins on the lock for at most a bounded time, measured on the
//!   link [`Clock`]. A timeout is reported as "nothing changed".

use alloc::boxed::Box;
use alloc::vec::Vec;
use heapless::Deque;
use spin::{Mutex, MutexGuard};

use crate::error::LinkResult;
use crate::traits::Clock;

/// Maximum number of packets waiting for the task loop
pub const QUEUE_CAPACITY: usize = 10;

/// Bytes received in one completed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Box<[u8]>,
}

impl Packet {
    /// Copy `bytes` into a new packet
    pub fn from_slice(bytes: &[u8]) -> LinkResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())?;
        data.extend_from_slice(bytes);
        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leading command byte
    pub fn command(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Why an interrupt-side push was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PushError {
    /// Queue already holds `QUEUE_CAPACITY` packets
    Full,
    /// The task loop holds the lock right now
    Contended,
}

/// Bounded FIFO of inbound packets
pub struct ReceiveQueue<const N: usize = QUEUE_CAPACITY> {
    inner: Mutex<Deque<Packet, N>>,
}

impl<const N: usize> ReceiveQueue<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Deque::new()),
        }
    }

    /// Maximum number of queued packets
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Non-blocking push for interrupt context
    ///
    /// On error the packet has been dropped.
    pub fn push_from_isr(&self, packet: Packet) -> Result<(), PushError> {
        let mut queue = self.inner.try_lock().ok_or(PushError::Contended)?;
        queue.push_back(packet).map_err(|_| PushError::Full)
    }

    /// Non-blocking fullness check for interrupt context
    ///
    /// `None` when the lock is held elsewhere.
    pub fn is_full_from_isr(&self) -> Option<bool> {
        self.inner.try_lock().map(|queue| queue.is_full())
    }

    fn lock_within<C: Clock>(
        &self,
        clock: &C,
        timeout_ms: u32,
    ) -> Option<MutexGuard<'_, Deque<Packet, N>>> {
        let start = clock.now_ms();
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return Some(guard);
            }
            if clock.elapsed_since(start) >= timeout_ms {
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// Take the oldest packet, waiting at most `timeout_ms` for the lock
    pub fn pop<C: Clock>(&self, clock: &C, timeout_ms: u32) -> Option<Packet> {
        match self.lock_within(clock, timeout_ms) {
            Some(mut queue) => queue.pop_front(),
            None => {
                log::error!("ReceiveQueue: failed to acquire lock for pop");
                None
            }
        }
    }

    /// Number of queued packets, 0 when the lock could not be taken in time
    pub fn pending_count<C: Clock>(&self, clock: &C, timeout_ms: u32) -> usize {
        match self.lock_within(clock, timeout_ms) {
            Some(queue) => queue.len(),
            None => {
                log::warn!("ReceiveQueue: lock timeout while counting packets");
                0
            }
        }
    }

    /// Fill level as a percentage of capacity, reported to the master
    pub fn buffer_status_percent<C: Clock>(&self, clock: &C, timeout_ms: u32) -> u8 {
        if N == 0 {
            return 0;
        }
        (self.pending_count(clock, timeout_ms) * 100 / N) as u8
    }

    /// Drop every queued packet; returns how many were discarded
    pub fn drain<C: Clock>(&self, clock: &C, timeout_ms: u32) -> usize {
        match self.lock_within(clock, timeout_ms) {
            Some(mut queue) => {
                let dropped = queue.len();
                queue.clear();
                dropped
            }
            None => {
                log::error!("ReceiveQueue: failed to acquire lock for drain");
                0
            }
        }
    }
}

impl<const N: usize> Default for ReceiveQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
