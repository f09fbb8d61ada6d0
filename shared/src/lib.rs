//! # CamLink Core
//!
//! Communication core of an ESP32 SPI slave that serves camera frames to an
//! external SPI master:
//!
//! - **TransactionEngine**: persistent tx/rx buffers, interrupt callbacks,
//!   task-side re-arming
//! - **BufferPool / ReceiveQueue**: bounded hand-off from interrupt to task
//! - **Watchdog**: stall detection and full driver recovery
//! - **ProtocolDispatcher / CameraFrameStore**: command handling and block
//!   serving of one captured frame
//! - **SpiResponder**: the task loop tying it together
//!
//! ## Architecture
//!
//! ```text
//!             interrupt context              │           task context
//!                                            │
//!  SPI master ──► rx buffer ──► BufferPool ──┼─► ReceiveQueue ──► SpiResponder::poll
//!                                            │                        │
//!                                            │              ProtocolDispatcher
//!                                            │                        │
//!  SPI master ◄── tx buffer ◄────────────────┼──── prepare_outbound ◄─┘
//! ```
//!
//! Hardware access goes through [`SlaveBus`] and [`Clock`], so the same core
//! runs on the ESP32 and in the host simulator.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod activity;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod frame;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod responder;
pub mod traits;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::TransactionActivity;
pub use config::{BusPins, LinkConfig, SpiMode, IDLE_PATTERN};
pub use dispatcher::ProtocolDispatcher;
pub use engine::{LinkStats, TransactionEngine};
pub use error::{LinkError, LinkResult};
pub use frame::{CameraFrame, CameraFrameStore};
pub use health::{HealthCheck, HealthStatus};
pub use pool::{BufferPool, PoolBuffer};
pub use protocol::{BlockHeader, Command, FrameMetadata, NackReason};
pub use queue::{Packet, ReceiveQueue, QUEUE_CAPACITY};
pub use responder::SpiResponder;
pub use traits::{
    BusSetup, CapturedFrame, Clock, FrameSize, FrameSource, NoCamera, PacketHandler,
    ResponseSink, SlaveBus, Transaction,
};
pub use watchdog::{StallReason, Watchdog, WatchdogAction};

/// Library version, reported by the simulator and firmware banners
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
