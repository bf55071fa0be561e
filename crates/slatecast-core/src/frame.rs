//! Frame buffers passed between capture, encoder and sender

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds since the first call in this process. Monotonic.
pub fn timestamp_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// An owned, row-contiguous BGRA pixel buffer captured from the desktop
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, >= width * 4
    pub stride: usize,
    /// Capture timestamp in microseconds, monotonically non-decreasing
    pub timestamp_us: u64,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, stride: usize) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            timestamp_us: timestamp_us(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True when the buffer holds at least height * stride bytes
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.stride >= (self.width * 4) as usize
            && self.data.len() >= self.height as usize * self.stride
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("size", &self.data.len())
            .finish()
    }
}

/// One complete compressed access unit from the encoder
pub struct EncodedFrame {
    pub data: Vec<u8>,
    /// Capture timestamp echoed from the source frame
    pub timestamp_us: u64,
    pub is_keyframe: bool,
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("size", &self.data.len())
            .field("timestamp_us", &self.timestamp_us)
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
    }

    #[test]
    fn frame_validity_checks_buffer_size() {
        let frame = RawFrame::new(vec![0u8; 16 * 8 * 4], 16, 8, 64);
        assert!(frame.is_valid());

        let short = RawFrame::new(vec![0u8; 10], 16, 8, 64);
        assert!(!short.is_valid());
    }
}
