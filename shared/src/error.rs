//! Error types for the communication core

use thiserror::Error;

/// Result type alias for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced by the transaction engine and its collaborators
///
/// None of these abort the firmware: initialization errors leave the engine
/// uninitialized, everything else is answered with a NACK or retried by the
/// watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// Engine has not been initialized (or a recovery left it uninitialized)
    #[error("SPI slave not initialized")]
    NotInitialized,
    /// The bus driver rejected the slave configuration
    #[error("bus driver rejected configuration (code {0})")]
    BusConfig(i32),
    /// A transaction could not be queued on the bus driver
    #[error("failed to arm transaction (code {0})")]
    ArmFailed(i32),
    /// Outbound payload was empty
    #[error("outbound payload is empty")]
    EmptyPayload,
    /// Outbound payload larger than the transfer buffer
    #[error("payload of {len} bytes exceeds transfer buffer of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },
    /// The allocator could not satisfy a request
    #[error("out of memory")]
    OutOfMemory,
    /// The capture device returned no frame (or an empty one)
    #[error("camera capture failed")]
    CaptureFailed,
    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<alloc::collections::TryReserveError> for LinkError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        LinkError::OutOfMemory
    }
}
