//! # SPI Slave Transaction Engine
//!
//! Owns the single tx/rx transfer-buffer pair, arms slave transactions on the
//! bus driver and implements the two interrupt callbacks.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//!  task loop                    interrupt                     master
//!  ─────────                    ─────────                     ──────
//!  init() ── arm x3 ──────────► driver queue
//!                               on_pre_transaction() ◄─────── CS low
//!                                 outstanding = true
//!                               on_post_transaction() ◄────── CS high
//!                                 rx ─► pool slot ─► Packet ─► ReceiveQueue
//!                                 zero rx, pending_rearms += 1
//!  ensure_transaction_queued()
//!    pending_rearms > 0? ── arm x1, pending_rearms -= 1 ──► driver queue
//!  prepare_outbound(reply)
//!    [critical section] tx ◄── reply ──────────────────────► next transaction
//! ```
//!
//! Hardware is never armed from interrupt context; the interrupt only counts
//! re-arm requests that the task loop works off one arm at a time.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;

use crate::activity::TransactionActivity;
use crate::config::{BusPins, LinkConfig, SpiMode};
use crate::error::{LinkError, LinkResult};
use crate::pool::{try_alloc_zeroed, BufferPool};
use crate::queue::{Packet, ReceiveQueue};
use crate::traits::{BusSetup, Clock, ResponseSink, SlaveBus, Transaction};

/// Driver wait used for the initial transactions ("forever")
const ARM_WAIT_FOREVER: u32 = u32::MAX;

/// Lock budget when draining the queue during recovery
const DRAIN_LOCK_TIMEOUT_MS: u32 = 1000;

struct TransferBuffers {
    tx: Box<[u8]>,
    rx: Box<[u8]>,
    tx_len: usize,
}

/// Point-in-time view of the link, for health checks and reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub initialized: bool,
    pub ready_to_send: bool,
    pub transaction_outstanding: bool,
    pub completed_transactions: u32,
    pub recovery_attempts: u32,
    pub dropped_packets: u32,
    pub pending_packets: usize,
    pub buffer_status_percent: u8,
    pub ms_since_activity: u32,
}

/// Interrupt-driven SPI slave transaction engine
pub struct TransactionEngine<B, C> {
    bus: spin::Mutex<B>,
    clock: C,
    config: LinkConfig,
    setup: spin::Mutex<Option<BusSetup>>,
    buffers: critical_section::Mutex<RefCell<TransferBuffers>>,
    pool: BufferPool,
    queue: ReceiveQueue,
    activity: TransactionActivity,
    initialized: AtomicBool,
    outbound_ready: AtomicBool,
    /// Completed transactions not yet replaced by a fresh arm
    pending_rearms: AtomicU32,
}

impl<B: SlaveBus, C: Clock> TransactionEngine<B, C> {
    /// Allocate the transfer buffers and packet pool
    ///
    /// The bus is not touched until [`init`](Self::init).
    pub fn new(bus: B, clock: C, config: LinkConfig) -> LinkResult<Self> {
        config.validate()?;

        let buffers = TransferBuffers {
            tx: try_alloc_zeroed(config.buffer_size)?,
            rx: try_alloc_zeroed(config.buffer_size)?,
            tx_len: 0,
        };
        let pool = BufferPool::new(config.pool_size, config.buffer_size)?;

        Ok(Self {
            bus: spin::Mutex::new(bus),
            clock,
            config,
            setup: spin::Mutex::new(None),
            buffers: critical_section::Mutex::new(RefCell::new(buffers)),
            pool,
            queue: ReceiveQueue::new(),
            activity: TransactionActivity::new(),
            initialized: AtomicBool::new(false),
            outbound_ready: AtomicBool::new(false),
            pending_rearms: AtomicU32::new(0),
        })
    }

    /// Bring the slave up and arm the initial transactions
    ///
    /// Returns `Ok` straight away when already initialized. On failure the
    /// engine stays uninitialized.
    pub fn init(&self, pins: BusPins, mode: SpiMode) -> LinkResult<()> {
        if self.is_initialized() {
            log::warn!("SpiSlave: already initialized");
            return Ok(());
        }

        log::info!(
            "SpiSlave: initializing with SCK={}, MISO={}, MOSI={}, CS={}, mode={}",
            pins.sck,
            pins.miso,
            pins.mosi,
            pins.cs,
            mode as u8
        );

        let setup = BusSetup {
            pins,
            mode,
            max_transfer: self.config.buffer_size,
            queue_depth: self.config.driver_queue_depth,
        };

        let mut bus = self.bus.lock();
        if let Err(e) = bus.initialize(&setup) {
            let code = B::error_code(&e);
            log::error!("SpiSlave: driver rejected configuration: {:?} ({})", e, code);
            return Err(LinkError::BusConfig(code));
        }

        for i in 0..self.config.initial_transactions {
            if let Err(e) = bus.queue_transaction(self.transaction(), ARM_WAIT_FOREVER) {
                let code = B::error_code(&e);
                log::error!("SpiSlave: failed to queue transaction {}: {:?}", i, e);
                bus.free();
                return Err(LinkError::ArmFailed(code));
            }
        }
        drop(bus);

        *self.setup.lock() = Some(setup);
        self.activity.reset(self.clock.now_ms());
        self.pending_rearms.store(0, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        log::info!(
            "SpiSlave: initialized with {} transactions queued",
            self.config.initial_transactions
        );
        Ok(())
    }

    /// Stage `bytes` for the master's next transaction
    ///
    /// Overwrites any reply that has not been clocked out yet.
    pub fn prepare_outbound(&self, bytes: &[u8]) -> LinkResult<()> {
        if !self.is_initialized() {
            log::error!("SpiSlave: not initialized");
            return Err(LinkError::NotInitialized);
        }
        if bytes.is_empty() {
            return Err(LinkError::EmptyPayload);
        }
        if bytes.len() > self.config.buffer_size {
            log::error!(
                "SpiSlave: {} bytes exceed transfer buffer ({})",
                bytes.len(),
                self.config.buffer_size
            );
            return Err(LinkError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.config.buffer_size,
            });
        }

        critical_section::with(|cs| {
            let mut buffers = self.buffers.borrow_ref_mut(cs);
            buffers.tx.fill(0);
            buffers.tx[..bytes.len()].copy_from_slice(bytes);
            buffers.tx_len = bytes.len();
            self.outbound_ready.store(true, Ordering::Release);
        });

        log::debug!("SpiSlave: data prepared for sending ({} bytes)", bytes.len());
        Ok(())
    }

    /// Initialized and nothing staged that the master has not clocked out
    pub fn is_ready_to_send(&self) -> bool {
        self.is_initialized() && !self.outbound_ready.load(Ordering::Acquire)
    }

    /// Re-arm one transaction if the interrupt asked for it
    ///
    /// Task context only. Each completed transaction yields exactly one
    /// successful re-arm; a failed arm is logged and retried on the next call.
    pub fn ensure_transaction_queued(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        if self
            .pending_rearms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            return false;
        }

        let transaction = self.transaction();
        match self
            .bus
            .lock()
            .queue_transaction(transaction, self.config.rearm_timeout_ms)
        {
            Ok(()) => {
                log::debug!("SpiSlave: new transaction queued");
                true
            }
            Err(e) => {
                log::error!("SpiSlave: failed to queue transaction: {:?}", e);
                self.pending_rearms.fetch_add(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Interrupt callback: the driver loaded a transaction into hardware
    #[inline]
    pub fn on_pre_transaction(&self) {
        self.activity.mark_started();
    }

    /// Interrupt callback: the master finished a transaction
    ///
    /// `received_bits` is the driver's reported transaction length.
    pub fn on_post_transaction(&self, received_bits: usize) {
        self.activity.record_completion(self.clock.now_ms());

        let received = (received_bits / 8).min(self.config.buffer_size);
        if received == 0 {
            return;
        }

        critical_section::with(|cs| {
            let mut buffers = self.buffers.borrow_ref_mut(cs);
            self.enqueue_received(&buffers.rx[..received]);
            buffers.rx.fill(0);
        });

        self.outbound_ready.store(false, Ordering::Release);
        self.pending_rearms.fetch_add(1, Ordering::AcqRel);
    }

    fn enqueue_received(&self, bytes: &[u8]) {
        if self.queue.is_full_from_isr() != Some(false) {
            self.activity.record_drop();
            return;
        }

        let Ok(mut staging) = self.pool.acquire() else {
            self.activity.record_drop();
            return;
        };
        let len = staging.fill_from(bytes);
        let packet = Packet::from_slice(&staging.as_slice()[..len]);
        self.pool.release(staging);

        match packet {
            Ok(packet) => {
                if self.queue.push_from_isr(packet).is_err() {
                    self.activity.record_drop();
                }
            }
            Err(_) => self.activity.record_drop(),
        }
    }

    /// Descriptor for the persistent buffer pair
    fn transaction(&self) -> Transaction {
        let (tx, rx) = critical_section::with(|cs| {
            let mut buffers = self.buffers.borrow_ref_mut(cs);
            let tx = buffers.tx.as_ptr();
            (tx, buffers.rx.as_mut_ptr())
        });
        Transaction {
            tx,
            rx,
            length_bits: self.config.buffer_size * 8,
            context: self as *const Self as *const (),
        }
    }

    /// Take the oldest received packet (task context)
    pub fn next_packet(&self) -> Option<Packet> {
        self.queue.pop(&self.clock, self.config.queue_lock_timeout_ms)
    }

    /// Copy of the staged reply, empty when nothing is staged
    pub fn staged_outbound(&self) -> Vec<u8> {
        critical_section::with(|cs| {
            let buffers = self.buffers.borrow_ref(cs);
            buffers.tx[..buffers.tx_len].to_vec()
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// A completed transaction is waiting to be replaced
    pub fn needs_rearm(&self) -> bool {
        self.pending_rearms() > 0
    }

    /// Re-arm requests raised by the interrupt and not yet served
    pub fn pending_rearms(&self) -> u32 {
        self.pending_rearms.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> &TransactionActivity {
        &self.activity
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Parameters of the last successful init
    pub fn bus_setup(&self) -> Option<BusSetup> {
        *self.setup.lock()
    }

    /// Snapshot of the link state
    pub fn stats(&self) -> LinkStats {
        let pending = ResponseSink::pending_count(self);
        LinkStats {
            initialized: self.is_initialized(),
            ready_to_send: self.is_ready_to_send(),
            transaction_outstanding: self.activity.is_outstanding(),
            completed_transactions: self.activity.completed(),
            recovery_attempts: self.activity.recovery_attempts(),
            dropped_packets: self.activity.dropped_packets(),
            pending_packets: pending,
            buffer_status_percent: (pending * 100 / self.queue.capacity()) as u8,
            ms_since_activity: self.clock.elapsed_since(self.activity.last_activity_ms()),
        }
    }

    /// Free the driver and mark the engine uninitialized
    pub(crate) fn teardown(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.bus.lock().free();
        }
    }

    /// Zero both transfer buffers and forget any staged reply
    pub(crate) fn clear_transfer_buffers(&self) {
        critical_section::with(|cs| {
            let mut buffers = self.buffers.borrow_ref_mut(cs);
            buffers.tx.fill(0);
            buffers.rx.fill(0);
            buffers.tx_len = 0;
            self.outbound_ready.store(false, Ordering::Release);
        });
    }

    /// Discard every queued packet
    pub(crate) fn drain_queue(&self) -> usize {
        self.queue.drain(&self.clock, DRAIN_LOCK_TIMEOUT_MS)
    }
}

impl<B: SlaveBus, C: Clock> ResponseSink for TransactionEngine<B, C> {
    fn prepare_outbound(&self, bytes: &[u8]) -> LinkResult<()> {
        TransactionEngine::prepare_outbound(self, bytes)
    }

    fn buffer_status_percent(&self) -> u8 {
        self.queue
            .buffer_status_percent(&self.clock, self.config.queue_lock_timeout_ms)
    }

    fn pending_count(&self) -> usize {
        self.queue
            .pending_count(&self.clock, self.config.queue_lock_timeout_ms)
    }

    fn capacity(&self) -> usize {
        self.config.buffer_size
    }

    fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QUEUE_CAPACITY;
    use crate::testing::{engine_with, small_config, MockBus, MockClock};

    #[test]
    fn test_init_arms_initial_transactions() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::new(12, 13, 15, 14), SpiMode::Mode1).unwrap();

        assert!(engine.is_initialized());
        assert!(engine.is_ready_to_send());
        assert_eq!(engine.bus.lock().armed(), 3);

        let setup = engine.bus_setup().unwrap();
        assert_eq!(setup.pins, BusPins::new(12, 13, 15, 14));
        assert_eq!(setup.mode, SpiMode::Mode1);
    }

    #[test]
    fn test_init_is_idempotent() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        let bus = engine.bus.lock();
        assert_eq!(bus.init_calls(), 1);
        assert_eq!(bus.armed(), 3);
    }

    #[test]
    fn test_rejected_configuration_leaves_engine_uninitialized() {
        let engine = engine_with(MockBus::failing_init(), small_config());

        let result = engine.init(BusPins::default(), SpiMode::Mode0);
        assert_eq!(result, Err(LinkError::BusConfig(-1)));
        assert!(!engine.is_initialized());
        assert!(!engine.is_ready_to_send());
        assert_eq!(engine.prepare_outbound(&[1]), Err(LinkError::NotInitialized));
        assert!(!engine.ensure_transaction_queued());
        assert!(engine.bus_setup().is_none());
    }

    #[test]
    fn test_arm_failure_frees_driver() {
        let engine = engine_with(MockBus::failing_arm_after(1), small_config());

        let result = engine.init(BusPins::default(), SpiMode::Mode0);
        assert!(matches!(result, Err(LinkError::ArmFailed(_))));
        assert!(!engine.is_initialized());
        assert_eq!(engine.bus.lock().free_calls(), 1);
    }

    #[test]
    fn test_prepare_outbound_stages_reply() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        engine.prepare_outbound(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert!(!engine.is_ready_to_send());
        assert_eq!(engine.staged_outbound(), [0xDE, 0xAD, 0xBE, 0xEF]);

        // Single-slot mailbox: a second reply replaces the first
        engine.prepare_outbound(&[0x01]).unwrap();
        assert_eq!(engine.staged_outbound(), [0x01]);
    }

    #[test]
    fn test_prepare_outbound_rejects_bad_lengths() {
        let config = small_config();
        let capacity = config.buffer_size;
        let engine = engine_with(MockBus::new(), config);
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        assert_eq!(engine.prepare_outbound(&[]), Err(LinkError::EmptyPayload));
        let oversized = vec![0u8; capacity + 1];
        assert_eq!(
            engine.prepare_outbound(&oversized),
            Err(LinkError::PayloadTooLarge { len: capacity + 1, capacity })
        );
        assert!(engine.is_ready_to_send());
    }

    #[test]
    fn test_post_transaction_queues_packet_and_requests_rearm() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();
        engine.prepare_outbound(&[0x02]).unwrap();

        engine.on_pre_transaction();
        assert!(engine.activity().is_outstanding());

        engine.bus.lock().master_write(&[0x20, 0x01]);
        engine.on_post_transaction(2 * 8);

        assert!(!engine.activity().is_outstanding());
        assert_eq!(engine.activity().completed(), 1);
        assert!(engine.is_ready_to_send());
        assert!(engine.needs_rearm());
        assert!(engine.bus.lock().rx_is_zeroed());

        let packet = engine.next_packet().unwrap();
        assert_eq!(packet.as_bytes(), &[0x20, 0x01]);
        assert_eq!(engine.pool().available(), engine.pool().capacity());
    }

    #[test]
    fn test_zero_length_transaction_is_ignored() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        engine.on_post_transaction(4);
        assert_eq!(engine.activity().completed(), 1);
        assert!(engine.next_packet().is_none());
        assert!(!engine.needs_rearm());
    }

    #[test]
    fn test_rearm_happens_once_per_request() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        assert!(!engine.ensure_transaction_queued());

        engine.bus.lock().master_write(&[0x01]);
        engine.on_post_transaction(8);
        assert!(engine.ensure_transaction_queued());
        assert!(!engine.ensure_transaction_queued());
        assert_eq!(engine.bus.lock().armed(), 4);
    }

    #[test]
    fn test_back_to_back_completions_rearm_each_slot() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        engine.bus.lock().master_write(&[0x01]);
        engine.on_post_transaction(8);
        engine.bus.lock().master_write(&[0x02]);
        engine.on_post_transaction(8);
        assert_eq!(engine.pending_rearms(), 2);

        assert!(engine.ensure_transaction_queued());
        assert!(engine.ensure_transaction_queued());
        assert!(!engine.ensure_transaction_queued());
        assert_eq!(engine.bus.lock().armed(), 5);
        assert!(!engine.needs_rearm());
    }

    #[test]
    fn test_failed_rearm_is_retried() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();
        engine.bus.lock().master_write(&[0x01]);
        engine.on_post_transaction(8);

        engine.bus.lock().set_arm_failure(true);
        assert!(!engine.ensure_transaction_queued());
        assert!(engine.needs_rearm());

        engine.bus.lock().set_arm_failure(false);
        assert!(engine.ensure_transaction_queued());
        assert!(!engine.needs_rearm());
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        for i in 0..QUEUE_CAPACITY + 2 {
            engine.bus.lock().master_write(&[i as u8 + 1]);
            engine.on_post_transaction(8);
        }

        let stats = engine.stats();
        assert_eq!(stats.pending_packets, QUEUE_CAPACITY);
        assert_eq!(stats.buffer_status_percent, 100);
        assert_eq!(stats.dropped_packets, 2);
        assert_eq!(engine.next_packet().unwrap().command(), Some(1));
    }

    #[test]
    fn test_transaction_points_at_persistent_buffers() {
        let engine = engine_with(MockBus::new(), small_config());
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        let first = engine.bus.lock().last_transaction().unwrap();
        engine.bus.lock().master_write(&[0x01]);
        engine.on_post_transaction(8);
        engine.ensure_transaction_queued();
        let second = engine.bus.lock().last_transaction().unwrap();

        assert_eq!(first.tx, second.tx);
        assert_eq!(first.rx, second.rx);
        assert_eq!(first.len(), engine.config().buffer_size);
    }

    #[test]
    fn test_stats_report_time_since_activity() {
        let clock = MockClock::new();
        let engine = TransactionEngine::new(MockBus::new(), &clock, small_config()).unwrap();
        engine.init(BusPins::default(), SpiMode::Mode0).unwrap();

        clock.advance(250);
        assert_eq!(engine.stats().ms_since_activity, 250);
    }
}
