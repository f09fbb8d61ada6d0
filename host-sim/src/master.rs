//! # Simulated SPI Master
//!
//! Client side of the camera protocol. Every request is one transaction; the
//! reply is read back with an ACK filler transaction once the slave signals
//! that a reply is staged (the data-ready line on real hardware).
//!
//! ```text
//! master                         slave
//!   │── request ────────────────►│ queued, handled by the task loop
//!   │        ... data-ready ◄────│ prepare_outbound(reply)
//!   │── 0xAA filler ────────────►│
//!   │◄──────────────── reply ────│
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use shared::protocol::{self, BLOCK_HEADER_LEN};
use shared::{BlockHeader, Command, FrameMetadata, NackReason, Transaction};

use crate::bus::SimWire;
use crate::SimResponder;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("slave armed no transaction within {0:?}")]
    NotArmed(Duration),
    #[error("slave answered NACK {reason:#04x} ({name})")]
    Nack { reason: u8, name: &'static str },
    #[error("no reply to command {command:#04x} after {attempts} reads")]
    NoReply { command: u8, attempts: u32 },
    #[error("malformed reply: {0}")]
    Malformed(&'static str),
}

fn nack_name(reason: u8) -> &'static str {
    match NackReason::try_from(reason) {
        Ok(NackReason::MalformedRequest) => "malformed request",
        Ok(NackReason::CameraUnavailable) => "camera unavailable",
        Ok(NackReason::CaptureFailed) => "capture failed",
        Ok(NackReason::InvalidBlockIndex) => "invalid block index",
        Ok(NackReason::NoFrame) => "no frame",
        Ok(NackReason::AllocationFailure) => "allocation failure",
        Err(_) => "unknown",
    }
}

/// Master-side client driving a [`SimResponder`] through a [`SimWire`]
pub struct SimMaster {
    wire: Arc<SimWire>,
    responder: Arc<SimResponder>,
    transfer_len: usize,
    arm_timeout: Duration,
    reply_timeout: Duration,
    reply_attempts: u32,
}

impl SimMaster {
    pub fn new(wire: Arc<SimWire>, responder: Arc<SimResponder>) -> Self {
        let transfer_len = responder.engine().config().buffer_size;
        Self {
            wire,
            responder,
            transfer_len,
            arm_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
            reply_attempts: 4,
        }
    }

    /// Clock `mosi` out in one transaction; returns what the slave sent back
    pub async fn transfer(&self, mosi: &[u8]) -> Result<Vec<u8>, SimError> {
        let deadline = Instant::now() + self.arm_timeout;
        let transaction = loop {
            if let Some(transaction) = self.wire.take_armed() {
                break transaction;
            }
            if Instant::now() >= deadline {
                return Err(SimError::NotArmed(self.arm_timeout));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        Ok(self.clock_bytes(transaction, mosi))
    }

    fn clock_bytes(&self, transaction: Transaction, mosi: &[u8]) -> Vec<u8> {
        let engine = self.responder.engine();
        debug_assert_eq!(transaction.context, engine as *const _ as *const ());

        engine.on_pre_transaction();
        let len = transaction.len();
        let written = mosi.len().min(len);
        let miso = critical_section::with(|_| {
            let mut miso = vec![0u8; len];
            // SAFETY: tx/rx point at the engine's transfer buffers, kept alive
            // by the responder we hold; the critical section excludes the
            // engine's own writers.
            unsafe {
                std::ptr::copy_nonoverlapping(transaction.tx, miso.as_mut_ptr(), len);
                std::ptr::copy_nonoverlapping(mosi.as_ptr(), transaction.rx, written);
            }
            miso
        });
        engine.on_post_transaction(written * 8);
        miso
    }

    /// The slave has a reply staged that has not been clocked out
    fn reply_pending(&self) -> bool {
        let engine = self.responder.engine();
        engine.is_initialized() && !engine.is_ready_to_send()
    }

    async fn wait_reply_pending(&self) -> bool {
        let deadline = Instant::now() + self.reply_timeout;
        while !self.reply_pending() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }

    /// Send `request` and read replies until `accept` takes one
    ///
    /// A NACK ends the exchange with [`SimError::Nack`]; anything else that is
    /// not accepted (e.g. the idle pattern after a recovery) is skipped.
    pub async fn request<F>(&self, request: &[u8], accept: F) -> Result<Vec<u8>, SimError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let command = request.first().copied().unwrap_or(0);
        self.transfer(request).await?;

        let mut filler = vec![0u8; self.transfer_len];
        filler[0] = Command::Ack as u8;

        for attempt in 1..=self.reply_attempts {
            if !self.wait_reply_pending().await {
                debug!("SimMaster: no reply staged for {:#04x} (attempt {})", command, attempt);
                continue;
            }
            let miso = self.transfer(&filler).await?;
            if miso[0] == Command::Nack as u8 {
                let reason = miso[1];
                return Err(SimError::Nack {
                    reason,
                    name: nack_name(reason),
                });
            }
            if accept(&miso) {
                return Ok(miso);
            }
            debug!(
                "SimMaster: skipping reply {:02x?} while waiting for {:#04x}",
                &miso[..4],
                command
            );
        }

        Err(SimError::NoReply {
            command,
            attempts: self.reply_attempts,
        })
    }

    /// PING with `nonce`; returns the slave's buffer status byte
    pub async fn ping(&self, nonce: &[u8]) -> Result<u8, SimError> {
        let mut request = vec![Command::Ping as u8];
        request.extend_from_slice(nonce);

        let reply = self
            .request(&request, |miso| {
                miso[0] == Command::Pong as u8
                    && miso.get(protocol::PONG_LEN..protocol::PONG_LEN + nonce.len()) == Some(nonce)
            })
            .await?;
        Ok(reply[2])
    }

    /// Receive queue fill level and pending packet count
    pub async fn buffer_status(&self) -> Result<(u8, u8), SimError> {
        let reply = self
            .request(&[Command::BufferStatusRequest as u8], |miso| {
                miso[0] == Command::BufferStatusResponse as u8
            })
            .await?;
        Ok((reply[2], reply[3]))
    }

    pub async fn capture(&self) -> Result<FrameMetadata, SimError> {
        let reply = self
            .request(&[Command::CameraDataRequest as u8], |miso| {
                miso[0] == Command::CameraDataResponse as u8
            })
            .await?;
        FrameMetadata::decode(&reply).ok_or(SimError::Malformed("metadata record"))
    }

    pub async fn fetch_block(&self, index: u16) -> Result<Vec<u8>, SimError> {
        let reply = self
            .request(&protocol::block_request(index), |miso| {
                BlockHeader::decode(miso).is_some_and(|header| header.index == index)
            })
            .await?;

        let header = BlockHeader::decode(&reply).ok_or(SimError::Malformed("block header"))?;
        let end = BLOCK_HEADER_LEN + usize::from(header.payload_len);
        reply
            .get(BLOCK_HEADER_LEN..end)
            .map(<[u8]>::to_vec)
            .ok_or(SimError::Malformed("block longer than transfer"))
    }

    /// Capture a frame and fetch every block of it
    pub async fn download_frame(&self) -> Result<(FrameMetadata, Vec<u8>), SimError> {
        let meta = self.capture().await?;
        info!(
            "SimMaster: frame {}x{}, {} bytes in {} blocks of {}",
            meta.width, meta.height, meta.length, meta.total_blocks, meta.block_size
        );

        let mut frame = Vec::with_capacity(meta.length as usize);
        for index in 0..meta.total_blocks {
            let block = self.fetch_block(index).await?;
            debug!("SimMaster: block {} ({} bytes)", index, block.len());
            frame.extend_from_slice(&block);
        }

        if frame.len() != meta.length as usize {
            warn!(
                "SimMaster: assembled {} bytes, metadata announced {}",
                frame.len(),
                meta.length
            );
            return Err(SimError::Malformed("frame length"));
        }
        Ok((meta, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{synthetic_frame, SyntheticCamera};
    use crate::{build_responder, ResponderLoop};
    use shared::{FrameSize, LinkConfig};

    fn sim(config: LinkConfig, frame_len: Option<usize>) -> (SimMaster, ResponderLoop) {
        let wire = SimWire::new();
        let camera = frame_len.map(|len| SyntheticCamera::new(len, FrameSize::Qvga));
        let responder = build_responder(wire.clone(), config, camera).unwrap();
        responder.begin().unwrap();
        let task_loop = ResponderLoop::start(responder.clone(), Duration::from_millis(2));
        (SimMaster::new(wire, responder), task_loop)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_round_trip() {
        let (master, task_loop) = sim(LinkConfig::default(), None);

        let status = master.ping(&[0xC0, 0xFF, 0xEE]).await.unwrap();
        assert!(status <= 100);

        task_loop.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_matches_camera() {
        let (master, task_loop) = sim(LinkConfig::default(), Some(10_000));

        let (meta, frame) = master.download_frame().await.unwrap();
        assert_eq!(meta.total_blocks, 3);
        assert_eq!(frame, synthetic_frame(10_000, 0));

        task_loop.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_without_camera_is_nacked() {
        let (master, task_loop) = sim(LinkConfig::default(), None);

        match master.capture().await {
            Err(SimError::Nack { reason, .. }) => assert_eq!(reason, 0x30),
            other => panic!("expected NACK, got {:?}", other),
        }

        task_loop.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_past_end_is_nacked() {
        let (master, task_loop) = sim(LinkConfig::default(), Some(5000));

        let meta = master.capture().await.unwrap();
        match master.fetch_block(meta.total_blocks).await {
            Err(SimError::Nack { reason, .. }) => assert_eq!(reason, 0x32),
            other => panic!("expected NACK, got {:?}", other),
        }

        task_loop.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_master_triggers_recovery() {
        let config = LinkConfig {
            transaction_timeout_ms: 50,
            watchdog_interval_ms: 10,
            ..LinkConfig::default()
        };
        let (master, task_loop) = sim(config, None);

        master.ping(&[1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(task_loop.responder().stats().recovery_attempts >= 1);

        master.ping(&[2]).await.unwrap();
        task_loop.stop().await;
    }
}
