//! # Camera Frame Store
//!
//! Keeps at most one captured frame, copied out of the camera driver so the
//! driver's frame buffer is handed back immediately.
//!
//! ```text
//! capture_frame() ──► driver handle ──copy──► CameraFrame ──► block(i)
//!                          │                                   │
//!                   return_frame()              data[i*B .. min((i+1)*B, L)]
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{LinkError, LinkResult};
use crate::protocol::FrameMetadata;
use crate::traits::{CapturedFrame, FrameSource};

/// A captured image, owned by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    data: Box<[u8]>,
    pub width: u16,
    pub height: u16,
    pub block_size: u16,
    pub total_blocks: u16,
    /// Capture time on the link clock
    pub captured_at_ms: u32,
    valid: bool,
}

impl CameraFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.valid && !self.data.is_empty()
    }

    /// Bytes of block `index`, `None` when out of range
    pub fn block(&self, index: u16) -> Option<&[u8]> {
        if index >= self.total_blocks {
            return None;
        }
        let start = usize::from(index) * usize::from(self.block_size);
        let end = (start + usize::from(self.block_size)).min(self.data.len());
        self.data.get(start..end)
    }

    /// Record sent in reply to a capture request
    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            width: self.width,
            height: self.height,
            total_blocks: self.total_blocks,
            block_size: self.block_size,
            length: self.data.len() as u32,
        }
    }
}

/// Number of `block_size` blocks needed for `len` bytes
pub fn block_count(len: usize, block_size: u16) -> usize {
    if block_size == 0 {
        return 0;
    }
    len.div_ceil(usize::from(block_size))
}

/// Single-slot frame holder
#[derive(Debug)]
pub struct CameraFrameStore {
    frame: Option<CameraFrame>,
    block_size: u16,
}

impl CameraFrameStore {
    pub fn new(block_size: u16) -> Self {
        Self {
            frame: None,
            block_size,
        }
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Capture a new frame and replace the stored one
    ///
    /// The driver handle is returned before this function returns, on every
    /// path. On error the previously stored frame is left untouched.
    pub fn capture<F: FrameSource>(&mut self, source: &mut F, now_ms: u32) -> LinkResult<&CameraFrame> {
        let Some(handle) = source.capture_frame() else {
            log::error!("FrameStore: camera capture failed");
            return Err(LinkError::CaptureFailed);
        };

        let copied = copy_frame_bytes(handle.data());
        source.return_frame(handle);
        let data = copied?;

        if data.is_empty() {
            log::error!("FrameStore: camera returned an empty frame");
            return Err(LinkError::CaptureFailed);
        }

        let total_blocks = block_count(data.len(), self.block_size);
        let Ok(total_blocks) = u16::try_from(total_blocks) else {
            log::error!(
                "FrameStore: {} byte frame needs {} blocks, more than a block index can address",
                data.len(),
                total_blocks
            );
            return Err(LinkError::CaptureFailed);
        };

        let (width, height) = source.resolution().dimensions();
        log::info!(
            "FrameStore: captured {}x{} frame, {} bytes in {} blocks",
            width,
            height,
            data.len(),
            total_blocks
        );

        let frame = self.frame.insert(CameraFrame {
            data,
            width,
            height,
            block_size: self.block_size,
            total_blocks,
            captured_at_ms: now_ms,
            valid: true,
        });
        Ok(frame)
    }

    pub fn current(&self) -> Option<&CameraFrame> {
        self.frame.as_ref().filter(|frame| frame.is_valid())
    }

    pub fn is_valid(&self) -> bool {
        self.current().is_some()
    }

    /// Drop the stored frame; no-op when empty
    pub fn release(&mut self) {
        if self.frame.take().is_some() {
            log::debug!("FrameStore: frame released");
        }
    }
}

fn copy_frame_bytes(src: &[u8]) -> LinkResult<Box<[u8]>> {
    let mut data = Vec::new();
    if data.try_reserve_exact(src.len()).is_err() {
        log::error!("FrameStore: failed to allocate {} bytes for frame copy", src.len());
        return Err(LinkError::OutOfMemory);
    }
    data.extend_from_slice(src);
    Ok(data.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frame_pattern, MockCamera};
    use crate::traits::FrameSize;

    #[test]
    fn test_block_count_rounds_up() {
        assert_eq!(block_count(5000, 1000), 5);
        assert_eq!(block_count(5001, 1000), 6);
        assert_eq!(block_count(1, 4096), 1);
        assert_eq!(block_count(0, 4096), 0);
    }

    #[test]
    fn test_capture_copies_and_returns_handle() {
        let mut camera = MockCamera::new(5000);
        let mut store = CameraFrameStore::new(1000);

        let frame = store.capture(&mut camera, 42).unwrap();
        assert_eq!(frame.len(), 5000);
        assert_eq!(frame.total_blocks, 5);
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(frame.captured_at_ms, 42);

        assert_eq!(camera.outstanding(), 0);
        assert!(store.is_valid());
    }

    #[test]
    fn test_blocks_slice_the_frame() {
        let mut camera = MockCamera::new(4500);
        let mut store = CameraFrameStore::new(1000);
        store.capture(&mut camera, 0).unwrap();

        let expected = frame_pattern(4500);
        let frame = store.current().unwrap();
        for index in 0..frame.total_blocks {
            let start = usize::from(index) * 1000;
            let len = 1000usize.min(4500 - start);
            assert_eq!(frame.block(index).unwrap(), &expected[start..start + len]);
        }
        assert_eq!(frame.block(4).unwrap().len(), 500);
        assert!(frame.block(5).is_none());
    }

    #[test]
    fn test_failed_capture_keeps_previous_frame() {
        let mut camera = MockCamera::new(300);
        let mut store = CameraFrameStore::new(100);
        store.capture(&mut camera, 1).unwrap();

        camera.fail = true;
        assert_eq!(store.capture(&mut camera, 2).unwrap_err(), LinkError::CaptureFailed);
        assert_eq!(store.current().unwrap().captured_at_ms, 1);
    }

    #[test]
    fn test_empty_frame_is_returned_and_rejected() {
        let mut camera = MockCamera::new(0);
        let mut store = CameraFrameStore::new(100);

        assert_eq!(store.capture(&mut camera, 0).unwrap_err(), LinkError::CaptureFailed);
        assert_eq!(camera.outstanding(), 0);
        assert!(!store.is_valid());
    }

    #[test]
    fn test_resolution_follows_camera() {
        let mut camera = MockCamera::new(10);
        camera.resolution = FrameSize::Vga;
        let mut store = CameraFrameStore::new(4);

        let meta = store.capture(&mut camera, 0).unwrap().metadata();
        assert_eq!((meta.width, meta.height), (640, 480));
        assert_eq!(meta.total_blocks, 3);
        assert_eq!(meta.length, 10);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut camera = MockCamera::new(10);
        let mut store = CameraFrameStore::new(4);
        store.capture(&mut camera, 0).unwrap();

        store.release();
        store.release();
        assert!(!store.is_valid());
        assert!(store.current().is_none());
    }
}
