//! Decoded video frames and the frame source contract.

use anyhow::{anyhow, Result};

/// One decoded RGB24 frame with its wall-clock capture time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Position in the source stream.
    pub index: u64,
    /// Capture time in microseconds since the Unix epoch.
    pub timestamp_us: i64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, timestamp_us: i64, width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            index,
            timestamp_us,
            width,
            height,
            pixels,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

pub fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// Ordered producer of frames.
///
/// `next_frame` returns `Ok(None)` at end of stream. Errors are per-read: the
/// caller decides how many consecutive failures it tolerates.
pub trait FrameSource {
    fn connect(&mut self) -> Result<()>;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Nominal frames per second delivered by this source.
    fn frame_rate(&self) -> f64;

    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_pixel_count() {
        assert!(Frame::new(0, 0, 4, 4, vec![0; 48]).is_ok());
        assert!(Frame::new(0, 0, 4, 4, vec![0; 47]).is_err());
    }
}
