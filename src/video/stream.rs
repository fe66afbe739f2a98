use std::sync::Arc;
use std::time::Instant;

use crate::field::Configuration;
use crate::frame::{FrameFormat, FrameSlot, ImageFrame};
use crate::stats::{StatsCollector, ROLE_VIDEO};

use super::{StreamState, VideoError};

/// Lifecycle, frame slot and stats plumbing shared by the bundled sources.
pub(crate) struct StreamCore {
    pub(crate) config: Configuration,
    state: StreamState,
    format: Option<FrameFormat>,
    slot: FrameSlot,
    next_sequence: u64,
    started_at: Option<Instant>,
    stats: Option<StatsCollector>,
    frames_delivered: u64,
}

impl StreamCore {
    pub(crate) fn new(config: Configuration) -> Self {
        Self {
            config,
            state: StreamState::Created,
            format: None,
            slot: FrameSlot::new(),
            next_sequence: 1,
            started_at: None,
            stats: None,
            frames_delivered: 0,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn format(&self) -> Option<FrameFormat> {
        self.format
    }

    pub(crate) fn ensure_openable(&self) -> Result<(), VideoError> {
        if self.state != StreamState::Created {
            return Err(VideoError::AlreadyOpen);
        }
        Ok(())
    }

    /// Record the negotiated format and freeze pre-open fields.
    pub(crate) fn mark_open(&mut self, format: FrameFormat) {
        self.format = Some(format);
        self.config.freeze();
        self.state = StreamState::Opened;
    }

    pub(crate) fn start(&mut self, source: &str) -> Result<(), VideoError> {
        match self.state {
            StreamState::Created => Err(VideoError::NotOpen),
            StreamState::Started => Ok(()),
            StreamState::Opened | StreamState::Stopped => {
                if self.started_at.is_none() {
                    self.started_at = Some(Instant::now());
                }
                self.state = StreamState::Started;
                log::info!("{}: stream started", source);
                Ok(())
            }
        }
    }

    pub(crate) fn stop(&mut self, source: &str) {
        if self.state == StreamState::Started {
            self.state = StreamState::Stopped;
            log::info!("{}: stream stopped after {} frames", source, self.frames_delivered);
        }
    }

    pub(crate) fn ensure_started(&self) -> Result<(), VideoError> {
        match self.state {
            StreamState::Started => Ok(()),
            StreamState::Created => Err(VideoError::NotOpen),
            StreamState::Opened | StreamState::Stopped => Err(VideoError::NotStarted),
        }
    }

    /// Wrap `data` as the next frame and make it current.
    pub(crate) fn publish(&mut self, data: Vec<u8>) -> Result<(), VideoError> {
        let format = self.format.ok_or(VideoError::NotOpen)?;
        let timestamp = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let frame = ImageFrame::new(data, format, self.next_sequence, timestamp).ok_or_else(|| {
            VideoError::Capture(format!(
                "frame buffer does not match {}x{} {:?}",
                format.width, format.height, format.pixel_format
            ))
        })?;
        if self.slot.publish(frame) {
            self.next_sequence += 1;
            self.frames_delivered += 1;
        }
        Ok(())
    }

    pub(crate) fn current(&self) -> Option<Arc<ImageFrame>> {
        if self.state == StreamState::Created || self.state == StreamState::Opened {
            return None;
        }
        self.slot.current()
    }

    pub(crate) fn set_stats(&mut self, stats: StatsCollector) {
        self.stats = Some(stats);
    }

    pub(crate) fn report_advance(&self, started: Instant, changed: bool) {
        if let Some(stats) = &self.stats {
            stats.record(ROLE_VIDEO, "advance_ms", started.elapsed().as_secs_f64() * 1000.0);
            stats.record(ROLE_VIDEO, "frames_delivered", if changed { 1.0 } else { 0.0 });
        }
    }
}
