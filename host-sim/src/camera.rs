//! Synthetic camera: JPEG-framed deterministic payloads.

use shared::{CapturedFrame, FrameSize, FrameSource};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Bytes of the `sequence`-th frame of `len` bytes
///
/// Starts with a JPEG SOI marker and ends with EOI so tools that sniff the
/// payload recognise it; the body depends on both position and sequence.
pub fn synthetic_frame(len: usize, sequence: u32) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(sequence.wrapping_mul(7)) as u8)
        .collect();
    if len >= SOI.len() + EOI.len() {
        data[..2].copy_from_slice(&SOI);
        data[len - 2..].copy_from_slice(&EOI);
    }
    data
}

#[derive(Debug)]
pub struct SyntheticFrame(Vec<u8>);

impl CapturedFrame for SyntheticFrame {
    fn data(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
pub struct SyntheticCamera {
    frame_len: usize,
    resolution: FrameSize,
    captured: u32,
    outstanding: u32,
}

impl SyntheticCamera {
    pub fn new(frame_len: usize, resolution: FrameSize) -> Self {
        Self {
            frame_len,
            resolution,
            captured: 0,
            outstanding: 0,
        }
    }

    /// Frames captured so far
    pub fn captured(&self) -> u32 {
        self.captured
    }

    /// Driver buffers handed out and not returned
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }
}

impl FrameSource for SyntheticCamera {
    type Frame = SyntheticFrame;

    fn capture_frame(&mut self) -> Option<Self::Frame> {
        if self.frame_len == 0 {
            return None;
        }
        let frame = SyntheticFrame(synthetic_frame(self.frame_len, self.captured));
        self.captured += 1;
        self.outstanding += 1;
        Some(frame)
    }

    fn return_frame(&mut self, _frame: Self::Frame) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn resolution(&self) -> FrameSize {
        self.resolution
    }
}
