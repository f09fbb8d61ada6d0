//! # Simulated SPI Slave Driver
//!
//! [`SimBus`] plays the role of the ESP-IDF slave driver: it accepts armed
//! transactions into a bounded queue. The master side of the simulation takes
//! them off the [`SimWire`] one at a time and clocks bytes through the
//! buffers they point at.
//!
//! ```text
//!  SpiResponder ── queue_transaction ──► SimWire ──► SimMaster::transfer
//!                                       [t0 t1 t2]      on_pre / copy / on_post
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use shared::{BusSetup, SlaveBus, Transaction};

/// `ESP_ERR_INVALID_ARG`
const ERR_INVALID_ARG: i32 = 0x102;
/// `ESP_ERR_INVALID_STATE`
const ERR_INVALID_STATE: i32 = 0x103;
/// `ESP_ERR_TIMEOUT`
const ERR_TIMEOUT: i32 = 0x107;

/// Errors mirroring the slave driver's return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimBusError {
    #[error("invalid bus configuration")]
    InvalidArg,
    #[error("bus not initialized or already initialized")]
    InvalidState,
    #[error("transaction queue full")]
    Timeout,
}

#[derive(Debug, Default)]
struct WireState {
    up: bool,
    depth: usize,
    max_transfer: usize,
    armed: VecDeque<Transaction>,
    setup: Option<BusSetup>,
}

/// Transaction queue shared by the simulated driver and master
#[derive(Debug, Default)]
pub struct SimWire {
    state: Mutex<WireState>,
    space: Condvar,
}

impl SimWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, WireState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Oldest armed transaction, if any
    pub fn take_armed(&self) -> Option<Transaction> {
        let transaction = self.state().armed.pop_front();
        if transaction.is_some() {
            self.space.notify_one();
        }
        transaction
    }

    pub fn armed_count(&self) -> usize {
        self.state().armed.len()
    }

    pub fn is_up(&self) -> bool {
        self.state().up
    }

    /// Parameters of the current driver instance
    pub fn setup(&self) -> Option<BusSetup> {
        self.state().setup
    }
}

/// Slave driver backed by a [`SimWire`]
#[derive(Debug, Clone)]
pub struct SimBus {
    wire: Arc<SimWire>,
}

impl SimBus {
    pub fn new(wire: Arc<SimWire>) -> Self {
        Self { wire }
    }
}

impl SlaveBus for SimBus {
    type Error = SimBusError;

    fn initialize(&mut self, setup: &BusSetup) -> Result<(), Self::Error> {
        let mut state = self.wire.state();
        if state.up {
            return Err(SimBusError::InvalidState);
        }
        if setup.max_transfer == 0 || setup.queue_depth == 0 {
            return Err(SimBusError::InvalidArg);
        }

        debug!(
            "SimBus: up, mode {}, {} byte transfers, queue depth {}",
            setup.mode as u8, setup.max_transfer, setup.queue_depth
        );
        state.up = true;
        state.depth = usize::from(setup.queue_depth);
        state.max_transfer = setup.max_transfer;
        state.setup = Some(*setup);
        Ok(())
    }

    fn queue_transaction(&mut self, transaction: Transaction, timeout_ms: u32) -> Result<(), Self::Error> {
        let state = self.wire.state();
        if !state.up {
            return Err(SimBusError::InvalidState);
        }
        if transaction.len() > state.max_transfer {
            return Err(SimBusError::InvalidArg);
        }

        let timeout = Duration::from_millis(u64::from(timeout_ms));
        let (mut state, result) = self
            .wire
            .space
            .wait_timeout_while(state, timeout, |state| state.up && state.armed.len() >= state.depth)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !state.up {
            return Err(SimBusError::InvalidState);
        }
        if result.timed_out() && state.armed.len() >= state.depth {
            warn!("SimBus: queue full for {} ms", timeout_ms);
            return Err(SimBusError::Timeout);
        }
        state.armed.push_back(transaction);
        Ok(())
    }

    fn free(&mut self) {
        let mut state = self.wire.state();
        let discarded = state.armed.len();
        state.armed.clear();
        state.up = false;
        state.setup = None;
        drop(state);
        self.wire.space.notify_all();
        debug!("SimBus: freed, {} queued transactions discarded", discarded);
    }

    fn error_code(error: &Self::Error) -> i32 {
        match error {
            SimBusError::InvalidArg => ERR_INVALID_ARG,
            SimBusError::InvalidState => ERR_INVALID_STATE,
            SimBusError::Timeout => ERR_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{BusPins, SpiMode};

    fn setup(depth: u8) -> BusSetup {
        BusSetup {
            pins: BusPins::default(),
            mode: SpiMode::Mode0,
            max_transfer: 64,
            queue_depth: depth,
        }
    }

    fn transaction(len: usize) -> Transaction {
        Transaction {
            tx: std::ptr::null(),
            rx: std::ptr::null_mut(),
            length_bits: len * 8,
            context: std::ptr::null(),
        }
    }

    #[test]
    fn test_queue_requires_initialized_bus() {
        let mut bus = SimBus::new(SimWire::new());
        assert_eq!(
            bus.queue_transaction(transaction(64), 10),
            Err(SimBusError::InvalidState)
        );
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let mut bus = SimBus::new(SimWire::new());
        bus.initialize(&setup(2)).unwrap();
        assert_eq!(bus.initialize(&setup(2)), Err(SimBusError::InvalidState));
        assert_eq!(SimBus::error_code(&SimBusError::InvalidState), 0x103);
    }

    #[test]
    fn test_full_queue_times_out() {
        let wire = SimWire::new();
        let mut bus = SimBus::new(wire.clone());
        bus.initialize(&setup(2)).unwrap();

        bus.queue_transaction(transaction(64), 10).unwrap();
        bus.queue_transaction(transaction(64), 10).unwrap();
        assert_eq!(
            bus.queue_transaction(transaction(64), 10),
            Err(SimBusError::Timeout)
        );

        assert!(wire.take_armed().is_some());
        bus.queue_transaction(transaction(64), 10).unwrap();
        assert_eq!(wire.armed_count(), 2);
    }

    #[test]
    fn test_oversized_transaction_is_rejected() {
        let mut bus = SimBus::new(SimWire::new());
        bus.initialize(&setup(2)).unwrap();
        assert_eq!(
            bus.queue_transaction(transaction(65), 10),
            Err(SimBusError::InvalidArg)
        );
    }

    #[test]
    fn test_free_discards_queue() {
        let wire = SimWire::new();
        let mut bus = SimBus::new(wire.clone());
        bus.initialize(&setup(4)).unwrap();
        bus.queue_transaction(transaction(8), 10).unwrap();

        bus.free();
        assert!(!wire.is_up());
        assert_eq!(wire.armed_count(), 0);
        assert!(wire.setup().is_none());
    }
}
