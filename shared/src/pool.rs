//! # Packet Buffer Pool
//!
//! Fixed set of transfer-sized buffers allocated once at startup, so the
//! post-transaction interrupt normally never touches the allocator.
//!
//! ## Slot Ownership
//!
//! ```text
//! ┌────────┬────────┬────────┬────────┬────────┬────────┐
//! │ slot 0 │ slot 1 │ slot 2 │ slot 3 │ slot 4 │ slot 5 │   in_use: AtomicBool
//! │  free  │ in use │  free  │  free  │  free  │  free  │   data:   [u8; size]
//! └────────┴────────┴────────┴────────┴────────┴────────┘
//!      ▲ acquire() claims the first free slot (compare-exchange)
//!
//! all slots in use ──► transient buffer, freed on release, never pooled
//! ```
//!
//! A slot is zeroed before it is marked free again, so no payload from a
//! previous transaction is visible to the next user.
//!
//! `acquire` is called from interrupt context and never logs; transient
//! fallbacks are counted and reported by the task loop.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::LinkResult;

/// Allocate a zero-filled buffer, reporting exhaustion instead of aborting
pub(crate) fn try_alloc_zeroed(size: usize) -> LinkResult<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)?;
    data.resize(size, 0);
    Ok(data.into_boxed_slice())
}

struct Slot {
    in_use: AtomicBool,
    data: UnsafeCell<Box<[u8]>>,
}

/// Fixed-count pool of fixed-size byte buffers
pub struct BufferPool {
    slots: Box<[Slot]>,
    buffer_size: usize,
    transient: AtomicU32,
}

// SAFETY: a slot's data is only reachable through the `PoolBuffer` that won
// the compare-exchange on its `in_use` flag, so there is never more than one
// live reference to it.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes
    pub fn new(count: usize, buffer_size: usize) -> LinkResult<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(count)?;
        for _ in 0..count {
            slots.push(Slot {
                in_use: AtomicBool::new(false),
                data: UnsafeCell::new(try_alloc_zeroed(buffer_size)?),
            });
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            buffer_size,
            transient: AtomicU32::new(0),
        })
    }

    /// Number of pooled slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of every buffer handed out
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Take the first free slot, or a transient buffer when all are in use
    ///
    /// Fails only when the allocator itself is exhausted.
    pub fn acquire(&self) -> LinkResult<PoolBuffer<'_>> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: we just won exclusive ownership of this slot.
                let data = unsafe { &mut *slot.data.get() };
                return Ok(PoolBuffer {
                    pool: self,
                    storage: Storage::Pooled { index, data },
                });
            }
        }

        self.transient.fetch_add(1, Ordering::AcqRel);
        let data = try_alloc_zeroed(self.buffer_size)?;
        Ok(PoolBuffer {
            pool: self,
            storage: Storage::Transient(data),
        })
    }

    /// Transient buffers handed out since creation (degraded mode)
    pub fn transient_allocations(&self) -> u32 {
        self.transient.load(Ordering::Acquire)
    }

    /// Give a buffer back
    ///
    /// Pooled buffers are zeroed and marked free; transient buffers are freed.
    /// Dropping a [`PoolBuffer`] has the same effect.
    pub fn release(&self, buffer: PoolBuffer<'_>) {
        drop(buffer);
    }

    fn release_slot(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.in_use.store(false, Ordering::Release);
        }
    }
}

enum Storage<'a> {
    Pooled { index: usize, data: &'a mut [u8] },
    Transient(Box<[u8]>),
}

/// Buffer handed out by [`BufferPool::acquire`]
pub struct PoolBuffer<'a> {
    pool: &'a BufferPool,
    storage: Storage<'a>,
}

impl PoolBuffer<'_> {
    /// Slot index, `None` for a transient buffer
    pub fn slot(&self) -> Option<usize> {
        match self.storage {
            Storage::Pooled { index, .. } => Some(index),
            Storage::Transient(_) => None,
        }
    }

    /// True when the buffer belongs to the pool
    pub fn is_pooled(&self) -> bool {
        self.slot().is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Pooled { data, .. } => data,
            Storage::Transient(data) => data,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Pooled { data, .. } => data,
            Storage::Transient(data) => data,
        }
    }

    /// Start address of the buffer memory
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Copy `src` into the start of the buffer, truncating to its capacity
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let buf = self.as_mut_slice();
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        len
    }
}

impl Drop for PoolBuffer<'_> {
    fn drop(&mut self) {
        if let Storage::Pooled { index, data } = &mut self.storage {
            data.fill(0);
            self.pool.release_slot(*index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool_is_free() {
        let pool = BufferPool::new(4, 64).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_size(), 64);
    }

    #[test]
    fn test_exhaustion_falls_back_to_transient() {
        let pool = BufferPool::new(3, 32).unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert!(held.iter().all(|buf| buf.is_pooled()));
        assert_eq!(pool.available(), 0);

        let extra = pool.acquire().unwrap();
        assert!(!extra.is_pooled());
        assert_eq!(pool.transient_allocations(), 1);
        assert_eq!(extra.as_slice().len(), 32);

        pool.release(extra);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_returns_same_slot() {
        let pool = BufferPool::new(2, 16).unwrap();

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let addr = second.as_ptr();
        assert_eq!(second.slot(), Some(1));

        pool.release(second);
        let again = pool.acquire().unwrap();
        assert_eq!(again.slot(), Some(1));
        assert_eq!(again.as_ptr(), addr);

        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_zeroes_slot() {
        let pool = BufferPool::new(1, 8).unwrap();

        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.fill_from(&[0xAB; 8]), 8);
        pool.release(buf);

        let buf = pool.acquire().unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_truncates_to_capacity() {
        let pool = BufferPool::new(1, 4).unwrap();
        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.fill_from(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }
}
