//! Deterministic replay source.
//!
//! Plays back either an explicit list of frames or a visibility script. A
//! script is one character per frame: `1`/`x` renders a bright marker
//! square at the image centre, `0`/`.` renders an empty dark frame.
//! Whitespace is ignored, so `"111 000 111"` is a valid script.

use std::sync::Arc;
use std::time::Instant;

use crate::field::{Configurable, Configuration, FieldScope, FieldValue};
use crate::frame::{flip_rows, FrameFormat, ImageFrame, PixelFormat};
use crate::stats::StatsCollector;

use super::{StreamCore, StreamState, VideoError, VideoSource};

pub const NAME: &str = "replayvideo";

const MARKER_LUMA: u8 = 240;
const BACKGROUND_LUMA: u8 = 12;

enum Reel {
    /// Parsed from the payload on open.
    Script(Vec<bool>),
    /// Supplied by the caller, already in the stream format.
    Frames(Vec<Vec<u8>>),
}

pub struct ReplayVideo {
    core: StreamCore,
    reel: Option<Reel>,
    preset: Option<(Vec<Vec<u8>>, FrameFormat)>,
    cursor: usize,
}

impl ReplayVideo {
    pub fn new() -> Self {
        let config = Configuration::new()
            .declare("loop", FieldValue::Bool(false), FieldScope::Live)
            .declare("width", FieldValue::Int(64), FieldScope::PreOpen)
            .declare("height", FieldValue::Int(48), FieldScope::PreOpen)
            .declare("flip_vertical", FieldValue::Bool(false), FieldScope::PreOpen);
        Self {
            core: StreamCore::new(config),
            reel: None,
            preset: None,
            cursor: 0,
        }
    }

    /// Source with the visibility `script` already set as payload.
    pub fn from_script(script: &str) -> Self {
        let mut source = Self::new();
        // The payload field always exists and is text.
        let _ = source.core.config.set_payload(script);
        source
    }

    /// Source replaying caller-supplied frames. Every buffer must match `format`.
    pub fn from_frames(frames: Vec<Vec<u8>>, format: FrameFormat) -> Self {
        let mut source = Self::new();
        source.preset = Some((frames, format));
        source
    }

    fn reel_len(&self) -> usize {
        match &self.reel {
            Some(Reel::Script(s)) => s.len(),
            Some(Reel::Frames(f)) => f.len(),
            None => 0,
        }
    }

    fn render(&self, index: usize, format: &FrameFormat) -> Vec<u8> {
        match &self.reel {
            Some(Reel::Frames(frames)) => frames[index].clone(),
            Some(Reel::Script(script)) => {
                let mut pixels = marker_frame(format, script[index]);
                if self.core.config.get::<bool>("flip_vertical").unwrap_or(false) {
                    flip_rows(&mut pixels, format);
                }
                pixels
            }
            None => Vec::new(),
        }
    }
}

impl Default for ReplayVideo {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a visibility script.
pub fn parse_script(script: &str) -> Result<Vec<bool>, VideoError> {
    let mut frames = Vec::new();
    for (i, c) in script.chars().enumerate() {
        match c {
            '1' | 'x' | 'X' => frames.push(true),
            '0' | '.' => frames.push(false),
            c if c.is_whitespace() => {}
            other => {
                return Err(VideoError::Open(format!(
                    "replay script has invalid character {:?} at {}",
                    other, i
                )))
            }
        }
    }
    if frames.is_empty() {
        return Err(VideoError::Open("replay script is empty".to_string()));
    }
    Ok(frames)
}

fn marker_frame(format: &FrameFormat, visible: bool) -> Vec<u8> {
    let (w, h) = (format.width as usize, format.height as usize);
    let mut pixels = vec![BACKGROUND_LUMA; format.frame_bytes()];
    if visible {
        let side = (w.min(h) / 2).max(1);
        let (mx, my) = ((w - side) / 2, (h - side) / 2);
        for y in my..my + side {
            pixels[y * w + mx..y * w + mx + side].fill(MARKER_LUMA);
        }
    }
    pixels
}

impl Configurable for ReplayVideo {
    fn configuration(&self) -> Option<&Configuration> {
        Some(&self.core.config)
    }

    fn configuration_mut(&mut self) -> Option<&mut Configuration> {
        Some(&mut self.core.config)
    }
}

impl VideoSource for ReplayVideo {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&mut self) -> Result<FrameFormat, VideoError> {
        self.core.ensure_openable()?;
        let (reel, format) = match self.preset.take() {
            Some((frames, format)) => {
                if frames.is_empty() {
                    self.preset = Some((frames, format));
                    return Err(VideoError::Open("replay has no frames".to_string()));
                }
                if let Some(bad) = frames.iter().position(|f| f.len() != format.frame_bytes()) {
                    self.preset = Some((frames, format));
                    return Err(VideoError::Open(format!(
                        "replay frame {} does not match {}x{} {:?}",
                        bad, format.width, format.height, format.pixel_format
                    )));
                }
                (Reel::Frames(frames), format)
            }
            None => {
                let script = parse_script(&self.core.config.payload())?;
                let width = self.core.config.get::<i64>("width").unwrap_or(0);
                let height = self.core.config.get::<i64>("height").unwrap_or(0);
                let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
                    return Err(VideoError::Open(format!(
                        "invalid replay size {}x{}",
                        width, height
                    )));
                };
                if width < 2 || height < 2 {
                    return Err(VideoError::Open(format!(
                        "replay size {}x{} is too small",
                        width, height
                    )));
                }
                let format = FrameFormat {
                    width,
                    height,
                    pixel_format: PixelFormat::Gray8,
                };
                (Reel::Script(script), format)
            }
        };
        self.reel = Some(reel);
        self.core.mark_open(format);
        log::info!(
            "{}: opened {} frames at {}x{}",
            NAME,
            self.reel_len(),
            format.width,
            format.height
        );
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
        let format = self.core.format().ok_or(VideoError::NotOpen)?;
        if self.cursor >= self.reel_len() {
            if self.core.config.get::<bool>("loop").unwrap_or(false) {
                self.cursor = 0;
            } else {
                self.core.report_advance(started, false);
                return Ok(false);
            }
        }
        let pixels = self.render(self.cursor, &format);
        self.core.publish(pixels)?;
        self.cursor += 1;
        self.core.report_advance(started, true);
        Ok(true)
    }

    fn current_frame(&self) -> Option<Arc<ImageFrame>> {
        self.core.current()
    }

    fn set_stats(&mut self, stats: StatsCollector) {
        self.core.set_stats(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldAccess;

    #[test]
    fn script_parsing() {
        assert_eq!(parse_script("1 0x.").unwrap(), vec![true, false, true, false]);
        assert!(parse_script("  ").is_err());
        assert!(parse_script("10a").is_err());
    }

    #[test]
    fn plays_script_then_holds_last_frame() {
        let mut video = ReplayVideo::from_script("101");
        video.open().unwrap();
        video.start().unwrap();
        let mut lumas = Vec::new();
        for _ in 0..3 {
            assert!(video.advance().unwrap());
            lumas.push(video.current_frame().unwrap().centre_luma(0.2));
        }
        assert!(lumas[0] > 200.0 && lumas[1] < 50.0 && lumas[2] > 200.0);
        let last = video.current_frame().unwrap().sequence;
        assert!(!video.advance().unwrap());
        assert_eq!(video.current_frame().unwrap().sequence, last);
    }

    #[test]
    fn looping_restarts_with_new_sequence() {
        let mut video = ReplayVideo::from_script("10");
        video.set_field("loop", true).unwrap();
        video.open().unwrap();
        video.start().unwrap();
        let seqs: Vec<u64> = (0..4)
            .map(|_| {
                assert!(video.advance().unwrap());
                video.current_frame().unwrap().sequence
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn explicit_frames_are_validated() {
        let format = FrameFormat {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Gray8,
        };
        let mut bad = ReplayVideo::from_frames(vec![vec![0; 4], vec![0; 3]], format);
        assert!(matches!(bad.open(), Err(VideoError::Open(_))));

        // A repeated open reports the same cause.
        let mut empty = ReplayVideo::from_frames(Vec::new(), format);
        for _ in 0..2 {
            match empty.open() {
                Err(VideoError::Open(msg)) => assert_eq!(msg, "replay has no frames"),
                other => panic!("unexpected open result: {:?}", other),
            }
        }

        let mut good = ReplayVideo::from_frames(vec![vec![1; 4], vec![2; 4]], format);
        good.open().unwrap();
        good.start().unwrap();
        good.advance().unwrap();
        good.advance().unwrap();
        assert_eq!(good.current_frame().unwrap().pixels(), &[2, 2, 2, 2]);
    }
}
