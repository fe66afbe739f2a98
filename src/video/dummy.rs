//! Still-image video source.
//!
//! `DummyVideo` turns a single image into a stream: every delivered frame
//! carries the same pixels with a fresh sequence number. The payload names
//! the image:
//! - `stub://<name>` (or empty): a synthetic test card with a marker square
//!   in the centre
//! - a local file path: decoded with the `image` crate (feature `image-files`)

use std::sync::Arc;
use std::time::Instant;

use crate::field::{Configurable, Configuration, FieldScope, FieldValue};
use crate::frame::{flip_rows, FrameFormat, ImageFrame, PixelFormat};
use crate::stats::StatsCollector;

use super::{StreamCore, StreamState, VideoError, VideoSource};

pub const NAME: &str = "dummyvideo";

const DEFAULT_WIDTH: i64 = 640;
const DEFAULT_HEIGHT: i64 = 480;

pub struct DummyVideo {
    core: StreamCore,
    image: Vec<u8>,
    ticks_since_publish: i64,
}

impl DummyVideo {
    pub fn new() -> Self {
        let config = Configuration::new()
            .declare("flip_vertical", FieldValue::Bool(false), FieldScope::PreOpen)
            .declare("width", FieldValue::Int(DEFAULT_WIDTH), FieldScope::PreOpen)
            .declare("height", FieldValue::Int(DEFAULT_HEIGHT), FieldScope::PreOpen)
            .declare("hold_ticks", FieldValue::Int(1), FieldScope::Live);
        Self {
            core: StreamCore::new(config),
            image: Vec::new(),
            ticks_since_publish: 0,
        }
    }

    fn load_image(&self) -> Result<(Vec<u8>, FrameFormat), VideoError> {
        let payload = self.core.config.payload();
        let payload = payload.trim();
        if payload.is_empty() || payload.starts_with("stub://") {
            let width = self.dimension("width")?;
            let height = self.dimension("height")?;
            let format = FrameFormat {
                width,
                height,
                pixel_format: PixelFormat::Rgb8,
            };
            return Ok((test_card(&format), format));
        }
        if payload.contains("://") {
            return Err(VideoError::Open(format!(
                "dummy video only reads local files, got '{}'",
                payload
            )));
        }
        decode_file(payload)
    }

    fn dimension(&self, name: &str) -> Result<u32, VideoError> {
        let value = self.core.config.get::<i64>(name).unwrap_or(0);
        u32::try_from(value)
            .ok()
            .filter(|v| *v > 0 && *v <= 8192)
            .ok_or_else(|| VideoError::Open(format!("{} must be in 1..=8192, got {}", name, value)))
    }
}

impl Default for DummyVideo {
    fn default() -> Self {
        Self::new()
    }
}

impl Configurable for DummyVideo {
    fn configuration(&self) -> Option<&Configuration> {
        Some(&self.core.config)
    }

    fn configuration_mut(&mut self) -> Option<&mut Configuration> {
        Some(&mut self.core.config)
    }
}

impl VideoSource for DummyVideo {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&mut self) -> Result<FrameFormat, VideoError> {
        self.core.ensure_openable()?;
        let (mut image, format) = self.load_image()?;
        if self.core.config.get::<bool>("flip_vertical").unwrap_or(false) {
            flip_rows(&mut image, &format);
        }
        log::info!(
            "{}: opened {}x{} {:?} from '{}'",
            NAME,
            format.width,
            format.height,
            format.pixel_format,
            self.core.config.payload()
        );
        self.image = image;
        self.core.mark_open(format);
        Ok(format)
    }

    fn format(&self) -> Option<FrameFormat> {
        self.core.format()
    }

    fn start(&mut self) -> Result<(), VideoError> {
        self.core.start(NAME)
    }

    fn stop(&mut self) {
        self.core.stop(NAME)
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn advance(&mut self) -> Result<bool, VideoError> {
        self.core.ensure_started()?;
        let started = Instant::now();
        let hold = self.core.config.get::<i64>("hold_ticks").unwrap_or(1).max(1);
        self.ticks_since_publish += 1;
        let due = self.core.current().is_none() || self.ticks_since_publish >= hold;
        if due {
            self.core.publish(self.image.clone())?;
            self.ticks_since_publish = 0;
        }
        self.core.report_advance(started, due);
        Ok(due)
    }

    fn current_frame(&self) -> Option<Arc<ImageFrame>> {
        self.core.current()
    }

    fn set_stats(&mut self, stats: StatsCollector) {
        self.core.set_stats(stats);
    }
}

/// Gradient background with a bright square marker in the centre.
fn test_card(format: &FrameFormat) -> Vec<u8> {
    let (w, h) = (format.width as usize, format.height as usize);
    let side = w.min(h) / 3;
    let (mx, my) = ((w - side) / 2, (h - side) / 2);
    let mut pixels = vec![0u8; format.frame_bytes()];
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let in_marker = x >= mx && x < mx + side && y >= my && y < my + side;
            let px = if in_marker {
                [250, 250, 250]
            } else {
                [(x * 64 / w.max(1)) as u8, (y * 64 / h.max(1)) as u8, 32]
            };
            pixels[idx..idx + 3].copy_from_slice(&px);
        }
    }
    pixels
}

#[cfg(feature = "image-files")]
fn decode_file(path: &str) -> Result<(Vec<u8>, FrameFormat), VideoError> {
    let image = image::open(path)
        .map_err(|e| VideoError::Open(format!("{}: {}", path, e)))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok((
        image.into_raw(),
        FrameFormat {
            width,
            height,
            pixel_format: PixelFormat::Rgb8,
        },
    ))
}

#[cfg(not(feature = "image-files"))]
fn decode_file(path: &str) -> Result<(Vec<u8>, FrameFormat), VideoError> {
    Err(VideoError::Open(format!(
        "reading '{}' requires the image-files feature",
        path
    )))
}
