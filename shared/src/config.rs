//! # Link Configuration
//!
//! Pin assignment, buffer geometry and timing for the SPI slave link. All
//! values are supplied by the embedding application; [`LinkConfig::default`]
//! mirrors the development board wiring.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};
use crate::protocol::BLOCK_HEADER_LEN;

/// Default transfer buffer size (maximum bytes per SPI transaction)
pub const DEFAULT_BUFFER_SIZE: usize = 8096;

/// Default number of pre-allocated packet buffers
pub const DEFAULT_POOL_SIZE: usize = 6;

/// Default camera block size; a block plus its header must fit one transaction
pub const DEFAULT_BLOCK_SIZE: u16 = 4096;

/// Idle pattern seeded into the tx buffer after a recovery
pub const IDLE_PATTERN: [u8; 4] = [0xAA, 0x55, 0xAA, 0x55];

/// GPIO assignment for the slave bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusPins {
    pub sck: i32,
    pub miso: i32,
    pub mosi: i32,
    pub cs: i32,
}

impl BusPins {
    pub const fn new(sck: i32, miso: i32, mosi: i32, cs: i32) -> Self {
        Self { sck, miso, mosi, cs }
    }
}

impl Default for BusPins {
    /// Development board wiring
    fn default() -> Self {
        Self::new(12, 13, 15, 14)
    }
}

/// SPI clock polarity/phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    #[default]
    Mode0 = 0,
    /// CPOL=0, CPHA=1
    Mode1 = 1,
    /// CPOL=1, CPHA=0
    Mode2 = 2,
    /// CPOL=1, CPHA=1
    Mode3 = 3,
}

impl TryFrom<u8> for SpiMode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Mode0),
            1 => Ok(Self::Mode1),
            2 => Ok(Self::Mode2),
            3 => Ok(Self::Mode3),
            _ => Err(LinkError::InvalidConfig("SPI mode must be 0-3")),
        }
    }
}

/// Complete configuration for the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bus pin assignment
    pub pins: BusPins,
    /// Clock polarity/phase
    pub mode: SpiMode,
    /// Transfer buffer size in bytes (tx and rx, and each pool slot)
    pub buffer_size: usize,
    /// Number of pre-allocated packet buffers
    pub pool_size: usize,
    /// Transactions armed at init so the slave can always answer
    pub initial_transactions: usize,
    /// Depth of the driver's own transaction queue
    pub driver_queue_depth: u8,
    /// Stall timeout for the watchdog, milliseconds
    pub transaction_timeout_ms: u32,
    /// How often the task loop runs the watchdog, milliseconds
    pub watchdog_interval_ms: u32,
    /// Pause between driver teardown and re-init during recovery
    pub settle_delay_ms: u32,
    /// Bounded wait for the receive queue lock in task context
    pub queue_lock_timeout_ms: u32,
    /// Driver queue timeout when re-arming a transaction
    pub rearm_timeout_ms: u32,
    /// Camera block size in bytes
    pub block_size: u16,
    /// Health check interval, milliseconds
    pub health_check_interval_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            pins: BusPins::default(),
            mode: SpiMode::Mode0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            initial_transactions: 3,
            driver_queue_depth: 5,
            transaction_timeout_ms: 3000,
            watchdog_interval_ms: 1000,
            settle_delay_ms: 100,
            queue_lock_timeout_ms: 100,
            rearm_timeout_ms: 500,
            block_size: DEFAULT_BLOCK_SIZE,
            health_check_interval_ms: 10_000,
        }
    }
}

impl LinkConfig {
    /// Check that the values are usable together
    pub fn validate(&self) -> LinkResult<()> {
        if self.buffer_size < crate::protocol::METADATA_LEN {
            return Err(LinkError::InvalidConfig("buffer too small for metadata record"));
        }
        if self.block_size == 0 {
            return Err(LinkError::InvalidConfig("block size must be non-zero"));
        }
        if self.block_size as usize + BLOCK_HEADER_LEN > self.buffer_size {
            return Err(LinkError::InvalidConfig("block does not fit one transaction"));
        }
        if self.initial_transactions == 0 {
            return Err(LinkError::InvalidConfig("at least one transaction must be armed"));
        }
        if self.initial_transactions > self.driver_queue_depth as usize {
            return Err(LinkError::InvalidConfig("initial transactions exceed driver queue"));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig("transaction timeout must be non-zero"));
        }
        Ok(())
    }
}
