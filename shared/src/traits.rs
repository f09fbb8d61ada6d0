//! # Hardware & Collaborator Abstractions
//!
//! The communication core never touches the ESP-IDF directly. It depends on
//! four narrow seams:
//!
//! - [`SlaveBus`]: bring-up, teardown and arming of the SPI slave driver
//! - [`Clock`]: millisecond time base plus a blocking settle delay
//! - [`FrameSource`]: the camera driver (capture / return frame)
//! - [`PacketHandler`]: application hook that replaces the default dispatcher
//!
//! ## Design Rationale
//!
//! 1. **Testability**: the whole engine runs on the host against mocks
//! 2. **Ownership**: camera handles move into `return_frame`, so a handle can
//!    only be given back once
//! 3. **No singletons**: interrupt trampolines find the engine through the
//!    transaction's context pointer

use core::fmt::Debug;

use crate::config::{BusPins, SpiMode};
use crate::error::LinkResult;

/// Parameters the slave driver is brought up with
///
/// Stored by the engine after a successful init so recovery can replay them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusSetup {
    pub pins: BusPins,
    pub mode: SpiMode,
    /// Largest transaction in bytes
    pub max_transfer: usize,
    /// Transactions the driver may hold queued
    pub queue_depth: u8,
}

/// One armed slave transaction
///
/// The pointers reference the engine's persistent transfer buffers, which are
/// allocated once and never move for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// Bytes presented to the master (MISO)
    pub tx: *const u8,
    /// Bytes received from the master (MOSI)
    pub rx: *mut u8,
    /// Maximum transaction length in bits
    pub length_bits: usize,
    /// Engine address, handed back to the interrupt trampolines
    pub context: *const (),
}

// SAFETY: the buffers behind `tx`/`rx` are owned by the engine, which outlives
// every bus driver it arms transactions on; the driver only hands the pointers
// to DMA and to the engine's own callbacks.
unsafe impl Send for Transaction {}

impl Transaction {
    /// Length in bytes
    pub fn len(&self) -> usize {
        self.length_bits / 8
    }

    /// True for a zero-length transaction
    pub fn is_empty(&self) -> bool {
        self.length_bits < 8
    }
}

/// SPI slave driver
///
/// Implementations call the engine's `on_pre_transaction` and
/// `on_post_transaction` from their interrupt callbacks.
pub trait SlaveBus {
    /// Driver error code
    type Error: Debug;

    /// Configure the bus in slave mode and register the callbacks
    fn initialize(&mut self, setup: &BusSetup) -> Result<(), Self::Error>;

    /// Queue one transaction, waiting at most `timeout_ms` for queue space
    fn queue_transaction(&mut self, transaction: Transaction, timeout_ms: u32)
        -> Result<(), Self::Error>;

    /// Tear the driver down; queued transactions are discarded
    fn free(&mut self);

    /// Numeric code for logs and [`crate::LinkError`]
    fn error_code(error: &Self::Error) -> i32;
}

/// Monotonic millisecond time base
///
/// `now_ms` must be callable from interrupt context and is allowed to wrap.
pub trait Clock {
    fn now_ms(&self) -> u32;

    /// Block the calling task for `ms` milliseconds
    fn delay_ms(&self, ms: u32);

    /// Milliseconds since `earlier`, wrap-safe
    fn elapsed_since(&self, earlier: u32) -> u32 {
        self.now_ms().wrapping_sub(earlier)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Sensor resolution, mirrors the camera driver's frame size enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameSize {
    /// 160x120
    Qqvga,
    /// 320x240
    #[default]
    Qvga,
    /// 400x296
    Cif,
    /// 640x480
    Vga,
    /// 800x600
    Svga,
    /// 1024x768
    Xga,
    /// 1280x1024
    Sxga,
    /// 1600x1200
    Uxga,
}

impl FrameSize {
    /// Pixel width and height
    pub const fn dimensions(self) -> (u16, u16) {
        match self {
            FrameSize::Qqvga => (160, 120),
            FrameSize::Qvga => (320, 240),
            FrameSize::Cif => (400, 296),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Sxga => (1280, 1024),
            FrameSize::Uxga => (1600, 1200),
        }
    }
}

/// A frame handle owned by the camera driver
pub trait CapturedFrame {
    /// Encoded image bytes
    fn data(&self) -> &[u8];
}

/// Camera driver contract
pub trait FrameSource {
    type Frame: CapturedFrame;

    /// Grab a frame; `None` when the driver has nothing to give
    fn capture_frame(&mut self) -> Option<Self::Frame>;

    /// Give a frame handle back to the driver
    fn return_frame(&mut self, frame: Self::Frame);

    /// Resolution frames are currently captured at
    fn resolution(&self) -> FrameSize;
}

/// Camera slot for builds without a capture device
///
/// Never yields a frame; used as the type parameter when the dispatcher is
/// created without a camera.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCamera;

impl CapturedFrame for core::convert::Infallible {
    fn data(&self) -> &[u8] {
        match *self {}
    }
}

impl FrameSource for NoCamera {
    type Frame = core::convert::Infallible;

    fn capture_frame(&mut self) -> Option<Self::Frame> {
        None
    }

    fn return_frame(&mut self, frame: Self::Frame) {
        match frame {}
    }

    fn resolution(&self) -> FrameSize {
        FrameSize::default()
    }
}

/// Where a packet handler stages its reply
pub trait ResponseSink {
    /// Stage `bytes` for the master's next transaction
    fn prepare_outbound(&self, bytes: &[u8]) -> LinkResult<()>;

    /// Receive queue fill level, 0-100
    fn buffer_status_percent(&self) -> u8;

    /// Packets currently waiting in the receive queue
    fn pending_count(&self) -> usize;

    /// Largest reply `prepare_outbound` accepts
    fn capacity(&self) -> usize;

    /// Link clock, for timestamping
    fn now_ms(&self) -> u32;
}

/// Handler for every packet dequeued by the task loop
///
/// The built-in [`crate::ProtocolDispatcher`] is one; an application can
/// register its own through `SpiResponder::set_receive_callback`, which fully
/// replaces the default command handling.
pub trait PacketHandler {
    fn handle_packet(&mut self, data: &[u8], sink: &dyn ResponseSink);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_dimensions() {
        assert_eq!(FrameSize::Qvga.dimensions(), (320, 240));
        assert_eq!(FrameSize::Uxga.dimensions(), (1600, 1200));
        assert_eq!(FrameSize::default(), FrameSize::Qvga);
    }

    #[test]
    fn test_no_camera_never_captures() {
        let mut camera = NoCamera;
        assert!(camera.capture_frame().is_none());
    }

    #[test]
    fn test_transaction_length() {
        let transaction = Transaction {
            tx: core::ptr::null(),
            rx: core::ptr::null_mut(),
            length_bits: 8096 * 8,
            context: core::ptr::null(),
        };
        assert_eq!(transaction.len(), 8096);
        assert!(!transaction.is_empty());
    }
}
