//! Trackers.
//!
//! A tracker consumes the newest image of a bound video source and keeps
//! the poses of its targets current. It owns its targets; the video source
//! is only referenced (`Weak`), never kept alive or driven by the tracker.
//!
//! Lifecycle: `Created → Configured → ImageBound → Started ⇄ Stopped`.
//! Targets may be added in any state and survive `stop`.

pub mod calibration;
pub mod estimator;
pub mod marker;
pub mod target;
mod worker;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::field::Configurable;
use crate::stats::StatsCollector;
use crate::video::SharedVideoSource;

pub use calibration::{Calibration, CalibrationError, Intrinsics, SharedCalibration};
pub use estimator::{Detection, FixedPoseEstimator, PoseEstimator, TargetProbe};
pub use marker::{DummyTracker, MarkerTracker};
pub use target::{Target, TargetId, TargetKind, TargetSpec, TargetSpecError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid target specification: {0}")]
    InvalidSpec(#[from] TargetSpecError),
    #[error("target pattern '{pattern}' not found under {root}")]
    PatternUnresolved { pattern: String, root: String },
    #[error("target {0} is already registered")]
    DuplicateTarget(TargetId),
    #[error("pose engine failed to start: {0}")]
    EngineStart(String),
    #[error("pose engine stopped unexpectedly")]
    EngineStopped,
    #[error("video source lock poisoned")]
    SourcePoisoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerState {
    Created,
    Configured,
    ImageBound,
    Started,
    Stopped,
}

/// Why an update did not estimate poses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotStarted,
    NoImage,
    /// The bound source has been dropped.
    SourceGone,
    /// The source has not delivered a frame yet.
    NoFrame,
    /// The current frame was already consumed.
    FrameUnchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Poses were estimated and committed.
    Tracked,
    /// Nothing changed; previous poses stand.
    Skipped(SkipReason),
    /// Estimation overran its budget or the engine was busy; active targets
    /// were marked invalid for this frame.
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub outcome: UpdateOutcome,
    /// Frame the committed state belongs to.
    pub sequence: Option<u64>,
    pub valid_targets: usize,
}

/// Pose estimation engine bound to a video source.
pub trait Tracker: Configurable + Send {
    fn name(&self) -> &'static str;

    /// Calibration of this tracker, created on first access and shared after.
    fn get_or_create_calibration(&mut self) -> SharedCalibration;

    /// Bind the source frames are pulled from. Replaces any previous binding.
    fn set_image(&mut self, source: &SharedVideoSource);

    /// Parse, resolve and register a target. New targets start inactive.
    fn add_target(&mut self, spec: &str) -> Result<TargetId, TrackerError>;

    fn remove_target(&mut self, id: TargetId) -> bool;

    fn targets(&self) -> &[Target];

    fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets().iter().find(|t| t.id() == id)
    }

    fn target_mut(&mut self, id: TargetId) -> Option<&mut Target>;

    fn start(&mut self) -> Result<(), TrackerError>;

    /// Pause tracking. Safe at any time; targets keep their last state.
    fn stop(&mut self);

    fn state(&self) -> TrackerState;

    /// Estimate poses on the bound source's current frame.
    ///
    /// Never blocks longer than the tracker's detection budget.
    fn update(&mut self) -> Result<TrackerUpdate, TrackerError>;

    fn set_stats(&mut self, stats: StatsCollector);
}

/// Shared handle to a tracker, as handed out by the registry.
pub type SharedTracker = Arc<Mutex<dyn Tracker>>;

pub fn shared<T: Tracker + 'static>(tracker: T) -> SharedTracker {
    Arc::new(Mutex::new(tracker))
}
