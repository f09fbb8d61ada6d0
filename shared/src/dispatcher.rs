//! # Protocol Dispatcher
//!
//! Default [`PacketHandler`]: decodes the leading command byte of every
//! received packet and stages the reply for the master's next transaction.
//!
//! ## Frame Download
//!
//! ```text
//! master                                  slave
//!   │── 0x20 CAMERA_DATA_REQUEST ──────────►│ capture, counter = 0
//!   │◄───────────── 16-byte metadata ───────│
//!   │── 0x22 idx=0 ────────────────────────►│ counter = 1
//!   │◄───────────── 0x23 hdr + block 0 ─────│
//!   │── 0x22 idx=1 ────────────────────────►│ counter = 2
//!   │       ...                             │
//!   │── 0x22 idx=0 (stale) ────────────────►│ served as idx=2 (skip-ahead)
//! ```
//!
//! A request for an index behind the last-served counter is answered with
//! the counter's block instead, so a master that repeats itself moves forward.

use alloc::vec::Vec;

use crate::error::LinkError;
use crate::frame::CameraFrameStore;
use crate::protocol::{self, BlockHeader, Command, NackReason, BLOCK_HEADER_LEN, PONG_LEN};
use crate::traits::{FrameSource, NoCamera, PacketHandler, ResponseSink};

/// Command decoder and frame server
pub struct ProtocolDispatcher<F: FrameSource> {
    camera: Option<F>,
    frames: CameraFrameStore,
    last_served_block: u16,
}

impl ProtocolDispatcher<NoCamera> {
    /// Dispatcher for a build with no capture device
    pub fn without_camera(block_size: u16) -> Self {
        Self::new(None, block_size)
    }
}

impl<F: FrameSource> ProtocolDispatcher<F> {
    pub fn new(camera: Option<F>, block_size: u16) -> Self {
        Self {
            camera,
            frames: CameraFrameStore::new(block_size),
            last_served_block: 0,
        }
    }

    pub fn has_camera(&self) -> bool {
        self.camera.is_some()
    }

    pub fn camera(&self) -> Option<&F> {
        self.camera.as_ref()
    }

    pub fn camera_mut(&mut self) -> Option<&mut F> {
        self.camera.as_mut()
    }

    pub fn frames(&self) -> &CameraFrameStore {
        &self.frames
    }

    /// Next block index the skip-ahead rule will serve at minimum
    pub fn last_served_block(&self) -> u16 {
        self.last_served_block
    }

    /// Drop the stored frame
    pub fn release_frame(&mut self) {
        self.frames.release();
    }

    fn handle_ping(&mut self, payload: &[u8], sink: &dyn ResponseSink) {
        let header = protocol::pong(sink.buffer_status_percent());
        let echo_len = payload.len().min(sink.capacity().saturating_sub(PONG_LEN));

        let mut reply = Vec::new();
        if reply.try_reserve_exact(PONG_LEN + echo_len).is_err() {
            log::error!("Dispatcher: failed to allocate PONG reply");
            send_nack(sink, NackReason::AllocationFailure);
            return;
        }
        reply.extend_from_slice(&header);
        reply.extend_from_slice(&payload[..echo_len]);

        log::debug!("Dispatcher: PING, echoing {} bytes", echo_len);
        send(sink, &reply);
    }

    fn handle_capture(&mut self, sink: &dyn ResponseSink) {
        let Some(camera) = self.camera.as_mut() else {
            log::warn!("Dispatcher: camera data requested but no camera is attached");
            send_nack(sink, NackReason::CameraUnavailable);
            return;
        };

        match self.frames.capture(camera, sink.now_ms()) {
            Ok(frame) => {
                let record = frame.metadata().encode();
                self.last_served_block = 0;
                send(sink, &record);
            }
            Err(LinkError::OutOfMemory) => send_nack(sink, NackReason::AllocationFailure),
            Err(_) => send_nack(sink, NackReason::CaptureFailed),
        }
    }

    fn handle_block_request(&mut self, payload: &[u8], sink: &dyn ResponseSink) {
        let [hi, lo, ..] = payload else {
            log::warn!("Dispatcher: block request with {} byte payload", payload.len());
            send_nack(sink, NackReason::MalformedRequest);
            return;
        };

        let requested = u16::from_be_bytes([*hi, *lo]);
        let index = if requested < self.last_served_block {
            log::debug!(
                "Dispatcher: block {} already served, sending {}",
                requested,
                self.last_served_block
            );
            self.last_served_block
        } else {
            requested
        };

        let Some(frame) = self.frames.current() else {
            log::warn!("Dispatcher: block {} requested with no frame captured", index);
            send_nack(sink, NackReason::NoFrame);
            return;
        };

        let Some(block) = frame.block(index) else {
            log::warn!(
                "Dispatcher: block {} out of range ({} blocks)",
                index,
                frame.total_blocks
            );
            send_nack(sink, NackReason::InvalidBlockIndex);
            return;
        };

        let mut reply = Vec::new();
        if reply.try_reserve_exact(BLOCK_HEADER_LEN + block.len()).is_err() {
            log::error!("Dispatcher: failed to allocate reply for block {}", index);
            send_nack(sink, NackReason::AllocationFailure);
            return;
        }
        let header = BlockHeader {
            index,
            payload_len: block.len() as u16,
        };
        reply.extend_from_slice(&header.encode());
        reply.extend_from_slice(block);

        send(sink, &reply);
        self.last_served_block = index.saturating_add(1);
    }

    fn handle_buffer_status(&mut self, sink: &dyn ResponseSink) {
        let percent = sink.buffer_status_percent();
        let pending = u8::try_from(sink.pending_count()).unwrap_or(u8::MAX);
        send(sink, &protocol::buffer_status(percent, pending));
    }
}

impl<F: FrameSource> PacketHandler for ProtocolDispatcher<F> {
    fn handle_packet(&mut self, data: &[u8], sink: &dyn ResponseSink) {
        let Some((&code, payload)) = data.split_first() else {
            return;
        };

        match Command::try_from(code) {
            Ok(Command::Ping) => self.handle_ping(payload, sink),
            Ok(Command::CameraDataRequest) => self.handle_capture(sink),
            Ok(Command::CameraDataBlockRequest) => self.handle_block_request(payload, sink),
            Ok(Command::BufferStatusRequest) => self.handle_buffer_status(sink),
            Ok(Command::Ack) => log::debug!("Dispatcher: ACK received"),
            Ok(Command::Nack) => match payload.first() {
                Some(&reason) => log::warn!("Dispatcher: NACK received, reason {:#04x}", reason),
                None => log::warn!("Dispatcher: NACK received"),
            },
            Ok(_) | Err(_) => {
                log::warn!("Dispatcher: unknown command {:#04x}", code);
                send(sink, &protocol::ack_echo(code));
            }
        }
    }
}

fn send(sink: &dyn ResponseSink, reply: &[u8]) {
    if let Err(e) = sink.prepare_outbound(reply) {
        log::error!("Dispatcher: failed to stage {} byte reply: {}", reply.len(), e);
    }
}

fn send_nack(sink: &dyn ResponseSink, reason: NackReason) {
    send(sink, &protocol::nack(reason));
}
