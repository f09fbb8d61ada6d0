//! Host-side doubles for the bus driver, time base and camera.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use crate::config::LinkConfig;
use crate::engine::TransactionEngine;
use crate::error::{LinkError, LinkResult};
use crate::traits::{
    BusSetup, CapturedFrame, Clock, FrameSize, FrameSource, ResponseSink, SlaveBus, Transaction,
};

/// `ESP_FAIL`
pub const BUS_INIT_ERROR: i32 = -1;
/// `ESP_ERR_TIMEOUT`
pub const BUS_ARM_ERROR: i32 = 0x107;

/// Manually driven clock; optionally advances on every read
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicU32,
    step: u32,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `now_ms` call moves time forward by `step` ms
    pub fn with_auto_advance(step: u32) -> Self {
        Self {
            now: AtomicU32::new(0),
            step,
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        self.now.fetch_add(self.step, Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u32) {
        self.advance(ms);
    }
}

#[derive(Debug, Default)]
struct BusState {
    initialized: bool,
    init_calls: usize,
    free_calls: usize,
    armed: usize,
    fail_init: bool,
    fail_arm: bool,
    arm_limit: Option<usize>,
    last_setup: Option<BusSetup>,
    last_transaction: Option<Transaction>,
}

/// Recording slave driver
///
/// Clones share state, so a test can keep a handle after moving the bus into
/// an engine.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_init() -> Self {
        let bus = Self::new();
        bus.set_init_failure(true);
        bus
    }

    /// Accepts `count` transactions, then refuses every further one
    pub fn failing_arm_after(count: usize) -> Self {
        let bus = Self::new();
        bus.state().arm_limit = Some(count);
        bus
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }

    pub fn set_init_failure(&self, fail: bool) {
        self.state().fail_init = fail;
    }

    pub fn set_arm_failure(&self, fail: bool) {
        self.state().fail_arm = fail;
    }

    pub fn armed(&self) -> usize {
        self.state().armed
    }

    pub fn init_calls(&self) -> usize {
        self.state().init_calls
    }

    pub fn free_calls(&self) -> usize {
        self.state().free_calls
    }

    pub fn last_setup(&self) -> Option<BusSetup> {
        self.state().last_setup
    }

    pub fn last_transaction(&self) -> Option<Transaction> {
        self.state().last_transaction
    }

    /// Place `bytes` in the rx buffer as if clocked in by the master
    pub fn master_write(&self, bytes: &[u8]) {
        let transaction = self.last_transaction().expect("no transaction armed");
        assert!(bytes.len() <= transaction.len());
        // SAFETY: the engine keeps the rx buffer alive and the test is the
        // only writer while no callback runs.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), transaction.rx, bytes.len());
        }
    }

    /// What the master would clock out of the tx buffer
    pub fn master_read(&self, len: usize) -> Vec<u8> {
        let transaction = self.last_transaction().expect("no transaction armed");
        // SAFETY: see `master_write`.
        unsafe { core::slice::from_raw_parts(transaction.tx, len.min(transaction.len())) }
            .to_vec()
    }

    pub fn rx_is_zeroed(&self) -> bool {
        let transaction = self.last_transaction().expect("no transaction armed");
        // SAFETY: see `master_write`.
        let rx = unsafe { core::slice::from_raw_parts(transaction.rx, transaction.len()) };
        rx.iter().all(|&b| b == 0)
    }
}

impl SlaveBus for MockBus {
    type Error = i32;

    fn initialize(&mut self, setup: &BusSetup) -> Result<(), Self::Error> {
        let mut state = self.state();
        state.init_calls += 1;
        if state.fail_init {
            return Err(BUS_INIT_ERROR);
        }
        state.initialized = true;
        state.last_setup = Some(*setup);
        Ok(())
    }

    fn queue_transaction(&mut self, transaction: Transaction, _timeout_ms: u32) -> Result<(), Self::Error> {
        let mut state = self.state();
        let over_limit = state.arm_limit.is_some_and(|limit| state.armed >= limit);
        if !state.initialized || state.fail_arm || over_limit {
            return Err(BUS_ARM_ERROR);
        }
        state.armed += 1;
        state.last_transaction = Some(transaction);
        Ok(())
    }

    fn free(&mut self) {
        let mut state = self.state();
        state.free_calls += 1;
        state.initialized = false;
    }

    fn error_code(error: &Self::Error) -> i32 {
        *error
    }
}

/// Deterministic frame bytes: `data[i] == i % 251`
pub fn frame_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug)]
pub struct MockFrame(Vec<u8>);

impl CapturedFrame for MockFrame {
    fn data(&self) -> &[u8] {
        &self.0
    }
}

/// Camera producing `frame_len`-byte pattern frames
#[derive(Debug)]
pub struct MockCamera {
    pub frame_len: usize,
    pub resolution: FrameSize,
    pub fail: bool,
    pub captured: usize,
    pub returned: usize,
}

impl MockCamera {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            resolution: FrameSize::Qvga,
            fail: false,
            captured: 0,
            returned: 0,
        }
    }

    /// Handles given out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.captured - self.returned
    }
}

impl FrameSource for MockCamera {
    type Frame = MockFrame;

    fn capture_frame(&mut self) -> Option<Self::Frame> {
        if self.fail {
            return None;
        }
        self.captured += 1;
        Some(MockFrame(frame_pattern(self.frame_len)))
    }

    fn return_frame(&mut self, _frame: Self::Frame) {
        self.returned += 1;
    }

    fn resolution(&self) -> FrameSize {
        self.resolution
    }
}

/// Config sized for tests: 1 KiB transfers, 1000-byte blocks
pub fn small_config() -> LinkConfig {
    LinkConfig {
        buffer_size: 1024,
        pool_size: 2,
        block_size: 1000,
        ..LinkConfig::default()
    }
}

pub fn engine_with(bus: MockBus, config: LinkConfig) -> TransactionEngine<MockBus, MockClock> {
    TransactionEngine::new(bus, MockClock::new(), config).unwrap()
}

/// One full master transaction carrying `bytes`
pub fn transfer<C: Clock>(engine: &TransactionEngine<MockBus, C>, bus: &MockBus, bytes: &[u8]) {
    engine.on_pre_transaction();
    bus.master_write(bytes);
    engine.on_post_transaction(bytes.len() * 8);
}

/// Sink that keeps every staged reply
#[derive(Debug)]
pub struct RecordingSink {
    pub replies: RefCell<Vec<Vec<u8>>>,
    pub percent: u8,
    pub pending: usize,
    pub capacity: usize,
    pub now: u32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            replies: RefCell::new(Vec::new()),
            percent: 0,
            pending: 0,
            capacity: 1024,
            now: 0,
        }
    }

    /// Most recent reply, panics when none was staged
    pub fn last(&self) -> Vec<u8> {
        self.replies.borrow().last().cloned().expect("no reply staged")
    }

    pub fn count(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl ResponseSink for RecordingSink {
    fn prepare_outbound(&self, bytes: &[u8]) -> LinkResult<()> {
        if bytes.is_empty() {
            return Err(LinkError::EmptyPayload);
        }
        if bytes.len() > self.capacity {
            return Err(LinkError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.replies.borrow_mut().push(bytes.to_vec());
        Ok(())
    }

    fn buffer_status_percent(&self) -> u8 {
        self.percent
    }

    fn pending_count(&self) -> usize {
        self.pending
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn now_ms(&self) -> u32 {
        self.now
    }
}
