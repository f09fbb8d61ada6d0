//! # SPI Command Protocol
//!
//! Every transaction the master clocks in starts with a command byte; the
//! rest of the transaction is command-specific payload. Replies are staged in
//! the tx buffer and clocked out on the master's *next* transaction.
//!
//! ## Reply Layouts
//!
//! ```text
//! PONG            ┌──────┬──────┬────────┬──────┬─────────────────┐
//!                 │ 0x02 │ 0x00 │ status │ 0x00 │ echoed payload… │
//!                 └──────┴──────┴────────┴──────┴─────────────────┘
//!
//! FRAME METADATA  ┌──────┬──────┬───────┬────────┬────────┬───────┬────────┬──────┐
//! (16 bytes, BE)  │ 0x21 │ 0x00 │ width │ height │ blocks │ block │ length │ rsvd │
//!                 │      │      │  u16  │  u16   │  u16   │ u16   │  u32   │  2B  │
//!                 └──────┴──────┴───────┴────────┴────────┴───────┴────────┴──────┘
//!
//! FRAME BLOCK     ┌──────┬─────────┬──────────┬──────────────────┐
//!                 │ 0x23 │ index   │ length   │ block bytes…     │
//!                 │      │ u16 BE  │ u16 BE   │                  │
//!                 └──────┴─────────┴──────────┴──────────────────┘
//!
//! NACK            ┌──────┬────────┐
//!                 │ 0xFF │ reason │
//!                 └──────┴────────┘
//! ```

/// Length of the frame metadata record
pub const METADATA_LEN: usize = 16;

/// Length of the header in front of every block reply
pub const BLOCK_HEADER_LEN: usize = 5;

/// Length of the PONG header (before any echoed bytes)
pub const PONG_LEN: usize = 4;

/// Command codes exchanged with the master
///
/// These must match the master firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// Liveness probe
    Ping = 0x01,
    /// Reply to a ping
    Pong = 0x02,
    /// Capture a new frame and return its metadata
    CameraDataRequest = 0x20,
    /// Frame metadata reply
    CameraDataResponse = 0x21,
    /// Request one block of the current frame
    CameraDataBlockRequest = 0x22,
    /// Block reply
    CameraDataBlockResponse = 0x23,
    /// Query the receive queue fill level
    BufferStatusRequest = 0x30,
    /// Fill level reply
    BufferStatusResponse = 0x31,
    /// Acknowledgment
    Ack = 0xAA,
    /// Negative acknowledgment
    Nack = 0xFF,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x20 => Ok(Self::CameraDataRequest),
            0x21 => Ok(Self::CameraDataResponse),
            0x22 => Ok(Self::CameraDataBlockRequest),
            0x23 => Ok(Self::CameraDataBlockResponse),
            0x30 => Ok(Self::BufferStatusRequest),
            0x31 => Ok(Self::BufferStatusResponse),
            0xAA => Ok(Self::Ack),
            0xFF => Ok(Self::Nack),
            other => Err(other),
        }
    }
}

/// Status byte carried in successful replies
pub const STATUS_OK: u8 = 0x00;

/// Reason byte carried in a NACK reply, one per failure site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NackReason {
    /// Payload shorter than the command requires
    MalformedRequest = 0x10,
    /// No capture device
    CameraUnavailable = 0x30,
    /// Capture device returned nothing
    CaptureFailed = 0x31,
    /// Block index past the end of the frame
    InvalidBlockIndex = 0x32,
    /// Block requested before any frame was captured
    NoFrame = 0x33,
    /// Reply buffer could not be allocated
    AllocationFailure = 0x40,
}

impl TryFrom<u8> for NackReason {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::MalformedRequest),
            0x30 => Ok(Self::CameraUnavailable),
            0x31 => Ok(Self::CaptureFailed),
            0x32 => Ok(Self::InvalidBlockIndex),
            0x33 => Ok(Self::NoFrame),
            0x40 => Ok(Self::AllocationFailure),
            other => Err(other),
        }
    }
}

/// Frame description sent in reply to a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameMetadata {
    pub width: u16,
    pub height: u16,
    pub total_blocks: u16,
    pub block_size: u16,
    pub length: u32,
}

impl FrameMetadata {
    /// Encode the fixed 16-byte record
    pub fn encode(&self) -> [u8; METADATA_LEN] {
        let mut record = [0u8; METADATA_LEN];
        record[0] = Command::CameraDataResponse as u8;
        record[1] = STATUS_OK;
        record[2..4].copy_from_slice(&self.width.to_be_bytes());
        record[4..6].copy_from_slice(&self.height.to_be_bytes());
        record[6..8].copy_from_slice(&self.total_blocks.to_be_bytes());
        record[8..10].copy_from_slice(&self.block_size.to_be_bytes());
        record[10..14].copy_from_slice(&self.length.to_be_bytes());
        // [14..16] reserved
        record
    }

    /// Parse a metadata record (master side)
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < METADATA_LEN || data[0] != Command::CameraDataResponse as u8 {
            return None;
        }
        Some(Self {
            width: u16::from_be_bytes([data[2], data[3]]),
            height: u16::from_be_bytes([data[4], data[5]]),
            total_blocks: u16::from_be_bytes([data[6], data[7]]),
            block_size: u16::from_be_bytes([data[8], data[9]]),
            length: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
        })
    }
}

/// Header in front of a block reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader {
    pub index: u16,
    pub payload_len: u16,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let index = self.index.to_be_bytes();
        let len = self.payload_len.to_be_bytes();
        [
            Command::CameraDataBlockResponse as u8,
            index[0],
            index[1],
            len[0],
            len[1],
        ]
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BLOCK_HEADER_LEN || data[0] != Command::CameraDataBlockResponse as u8 {
            return None;
        }
        Some(Self {
            index: u16::from_be_bytes([data[1], data[2]]),
            payload_len: u16::from_be_bytes([data[3], data[4]]),
        })
    }
}

/// Two-byte NACK reply
pub fn nack(reason: NackReason) -> [u8; 2] {
    [Command::Nack as u8, reason as u8]
}

/// ACK echoing a command byte the dispatcher does not know
pub fn ack_echo(byte: u8) -> [u8; 2] {
    [Command::Ack as u8, byte]
}

/// PONG header carrying the receive buffer fill level
pub fn pong(buffer_status: u8) -> [u8; PONG_LEN] {
    [Command::Pong as u8, 0x00, buffer_status, 0x00]
}

/// Buffer status reply
pub fn buffer_status(percent: u8, pending: u8) -> [u8; 4] {
    [Command::BufferStatusResponse as u8, STATUS_OK, percent, pending]
}

/// Build a block request (master side)
pub fn block_request(index: u16) -> [u8; 3] {
    let index = index.to_be_bytes();
    [Command::CameraDataBlockRequest as u8, index[0], index[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_layout_is_big_endian() {
        let meta = FrameMetadata {
            width: 320,
            height: 240,
            total_blocks: 5,
            block_size: 1000,
            length: 5000,
        };
        let record = meta.encode();

        assert_eq!(record[0], 0x21);
        assert_eq!(&record[2..4], &[0x01, 0x40]);
        assert_eq!(&record[4..6], &[0x00, 0xF0]);
        assert_eq!(&record[6..8], &[0x00, 0x05]);
        assert_eq!(&record[8..10], &[0x03, 0xE8]);
        assert_eq!(&record[10..14], &[0x00, 0x00, 0x13, 0x88]);
        assert_eq!(&record[14..], &[0, 0]);
        assert_eq!(FrameMetadata::decode(&record), Some(meta));
    }

    #[test]
    fn test_block_header_layout() {
        let header = BlockHeader { index: 4, payload_len: 1000 };
        assert_eq!(header.encode(), [0x23, 0x00, 0x04, 0x03, 0xE8]);
    }

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x22), Ok(Command::CameraDataBlockRequest));
        assert_eq!(Command::try_from(0xAA), Ok(Command::Ack));
        assert_eq!(Command::try_from(0x99), Err(0x99));
    }

    #[test]
    fn test_decode_rejects_wrong_code() {
        assert!(FrameMetadata::decode(&[0xFF; METADATA_LEN]).is_none());
        assert!(BlockHeader::decode(&[0x23, 0x00]).is_none());
    }
}
