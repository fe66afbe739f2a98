//! Video sources.
//!
//! A video source negotiates a stream on `open`, delivers frames between
//! `start` and `stop`, and exposes exactly one current frame at a time.
//! Delivery is pull-based: the pipeline calls `advance` once per rendered
//! frame and learns whether the current frame changed.
//!
//! Sources provided here:
//! - `DummyVideo`: a still image (or synthetic pattern) repeated as a stream
//! - `ReplayVideo`: deterministic replay of a marker visibility script
//!
//! Sources MUST NOT block `advance` waiting on a slow producer. When no new
//! frame is ready the previous one stays current.

pub mod dummy;
pub mod replay;
mod stream;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::field::Configurable;
use crate::frame::{FrameFormat, ImageFrame};
use crate::stats::StatsCollector;

pub use dummy::DummyVideo;
pub use replay::ReplayVideo;
pub(crate) use stream::StreamCore;

#[derive(Debug, Error, PartialEq)]
pub enum VideoError {
    #[error("video source is already open")]
    AlreadyOpen,
    #[error("video source is not open")]
    NotOpen,
    #[error("video source is not started")]
    NotStarted,
    #[error("failed to open video source: {0}")]
    Open(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Opened,
    Started,
    Stopped,
}

/// Live or replayed image stream.
pub trait VideoSource: Configurable + Send {
    /// Plugin identifier.
    fn name(&self) -> &'static str;

    /// Negotiate stream parameters without starting delivery.
    ///
    /// Callable once. A second call fails with `VideoError::AlreadyOpen`
    /// and leaves the open stream untouched.
    fn open(&mut self) -> Result<FrameFormat, VideoError>;

    /// Negotiated format, `None` before `open`.
    fn format(&self) -> Option<FrameFormat>;

    fn start(&mut self) -> Result<(), VideoError>;

    /// Stop delivery. Safe to call in any state; the last frame stays current.
    fn stop(&mut self);

    fn state(&self) -> StreamState;

    /// Pull the newest frame. Returns true when the current frame changed.
    fn advance(&mut self) -> Result<bool, VideoError>;

    /// The current frame, `None` until the first frame after `start`.
    fn current_frame(&self) -> Option<Arc<ImageFrame>>;

    /// Attach a stats sink. Each `advance` then reports timings.
    fn set_stats(&mut self, stats: StatsCollector);
}

/// Shared handle to a video source, as handed out by the registry.
pub type SharedVideoSource = Arc<Mutex<dyn VideoSource>>;

pub fn shared<V: VideoSource + 'static>(source: V) -> SharedVideoSource {
    Arc::new(Mutex::new(source))
}
