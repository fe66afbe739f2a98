//! Image frames produced by video sources.
//!
//! - `ImageFrame`: immutable pixel buffer for one tick, shared as `Arc`.
//! - `FrameFormat`: stream parameters negotiated by `open`.
//! - `FrameSlot`: the single "current frame" a source exposes, with a
//!   monotonic sequence check.

use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Stream parameters. Valid once the source is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// One frame of pixel data. Never mutated after construction.
#[derive(Debug)]
pub struct ImageFrame {
    data: Vec<u8>,
    pub format: FrameFormat,
    /// Strictly increasing per source.
    pub sequence: u64,
    /// Time since the stream was started.
    pub timestamp: Duration,
}

impl ImageFrame {
    /// Returns `None` when `data` does not match the format's byte size.
    pub fn new(
        data: Vec<u8>,
        format: FrameFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> Option<Self> {
        if data.len() != format.frame_bytes() {
            return None;
        }
        Some(Self {
            data,
            format,
            sequence,
            timestamp,
        })
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Luma of one pixel (Rec. 601 weights for colour formats).
    pub fn luma_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.format.width || y >= self.format.height {
            return None;
        }
        let bpp = self.format.pixel_format.bytes_per_pixel();
        let idx = (y as usize * self.format.width as usize + x as usize) * bpp;
        let px = self.data.get(idx..idx + bpp)?;
        Some(match self.format.pixel_format {
            PixelFormat::Gray8 => px[0],
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => {
                let l = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                l.round().clamp(0.0, 255.0) as u8
            }
        })
    }

    /// Mean luma over a centred window covering `fraction` of each dimension.
    pub fn centre_luma(&self, fraction: f32) -> f32 {
        let fraction = fraction.clamp(0.01, 1.0);
        let w = ((self.format.width as f32 * fraction) as u32).max(1);
        let h = ((self.format.height as f32 * fraction) as u32).max(1);
        let x0 = (self.format.width - w.min(self.format.width)) / 2;
        let y0 = (self.format.height - h.min(self.format.height)) / 2;
        let mut sum = 0u64;
        let mut count = 0u64;
        for y in y0..(y0 + h).min(self.format.height) {
            for x in x0..(x0 + w).min(self.format.width) {
                if let Some(l) = self.luma_at(x, y) {
                    sum += l as u64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum as f32 / count as f32
        }
    }
}

/// Flip rows in place (bottom row first).
pub fn flip_rows(data: &mut [u8], format: &FrameFormat) {
    let stride = format.width as usize * format.pixel_format.bytes_per_pixel();
    let rows = format.height as usize;
    if stride == 0 || data.len() < stride * rows {
        return;
    }
    for row in 0..rows / 2 {
        let (top, bottom) = data.split_at_mut((rows - 1 - row) * stride);
        top[row * stride..(row + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}

/// Holds the one frame consumers may see.
///
/// Publishing a frame whose sequence is not newer than the current one is
/// refused, so consumers never move backwards in time.
#[derive(Debug, Default)]
pub struct FrameSlot {
    current: Option<Arc<ImageFrame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the frame became current.
    pub fn publish(&mut self, frame: ImageFrame) -> bool {
        if let Some(cur) = &self.current {
            if frame.sequence <= cur.sequence {
                log::debug!(
                    "dropping out-of-order frame {} (current {})",
                    frame.sequence,
                    cur.sequence
                );
                return false;
            }
        }
        self.current = Some(Arc::new(frame));
        true
    }

    pub fn current(&self) -> Option<Arc<ImageFrame>> {
        self.current.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.current.as_ref().map(|f| f.sequence)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(w: u32, h: u32, fill: u8, seq: u64) -> ImageFrame {
        let format = FrameFormat {
            width: w,
            height: h,
            pixel_format: PixelFormat::Gray8,
        };
        ImageFrame::new(vec![fill; (w * h) as usize], format, seq, Duration::ZERO).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let format = FrameFormat {
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Rgb8,
        };
        assert!(ImageFrame::new(vec![0; 10], format, 1, Duration::ZERO).is_none());
    }

    #[test]
    fn slot_is_monotonic() {
        let mut slot = FrameSlot::new();
        assert!(slot.publish(gray(2, 2, 0, 2)));
        assert!(!slot.publish(gray(2, 2, 0, 1)));
        assert!(!slot.publish(gray(2, 2, 0, 2)));
        assert_eq!(slot.sequence(), Some(2));
        assert!(slot.publish(gray(2, 2, 0, 3)));
        assert_eq!(slot.sequence(), Some(3));
    }

    #[test]
    fn flip_rows_reverses_row_order() {
        let format = FrameFormat {
            width: 2,
            height: 3,
            pixel_format: PixelFormat::Gray8,
        };
        let mut data = vec![1, 1, 2, 2, 3, 3];
        flip_rows(&mut data, &format);
        assert_eq!(data, vec![3, 3, 2, 2, 1, 1]);
    }

    #[test]
    fn centre_luma_of_uniform_frame() {
        let frame = gray(8, 8, 200, 1);
        assert!((frame.centre_luma(0.25) - 200.0).abs() < f32::EPSILON);
    }
}
