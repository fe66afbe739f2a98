//! AR compositing pipeline
//!
//! This crate fuses a video feed, a fiducial tracker and a 3D overlay into
//! one composed frame with a fixed draw order: video background first,
//! overlay geometry after.
//!
//! # Architecture
//!
//! Each rendered frame runs the same ordered steps:
//!
//! 1. **Advance video**: the source publishes its newest frame, if any.
//! 2. **Update tracker**: the tracker consumes that frame once and commits
//!    per-target pose and validity together.
//! 3. **Propagate poses**: overlays follow valid poses and are hidden
//!    otherwise. A stale or invalid pose is never drawn.
//! 4. **Composite**: background then overlay draw commands.
//! 5. **Report stats**: per-stage timings from every producer, one report
//!    per frame.
//!
//! # Module Structure
//!
//! - `registry`: compiled-in plugins by name, queried per role
//! - `video`: video source contract and the bundled sources
//! - `tracker`: tracker contract, targets, calibration, pose estimation
//! - `field`: typed plugin configuration
//! - `frame`: image frames and the single-frame slot
//! - `pipeline`: the per-frame step list
//! - `compositor`: camera, background and overlay layers
//! - `stats`: shared per-frame sample collector
//! - `bootstrap` / `config`: application wiring and its configuration

pub mod bootstrap;
pub mod compositor;
pub mod config;
pub mod field;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod stats;
pub mod tracker;
pub mod video;

pub use bootstrap::{bootstrap, bootstrap_with, ArSession};
pub use compositor::{
    CompositeError, Compositor, CompositorSettings, DrawCommand, DrawItem, OverlayGeometry,
};
pub use config::PipelineConfig;
pub use field::{Configurable, Configuration, FieldAccess, FieldError, FieldScope, FieldValue};
pub use frame::{FrameFormat, ImageFrame, PixelFormat};
pub use pipeline::{FrameError, FramePipeline, FrameReport, FrameStep, PoseFilter, StepListError};
pub use registry::{CapabilityRegistry, PluginInstance, RegistryError, Role};
pub use stats::{StatsCollector, StatsReport};
pub use tracker::{
    SharedTracker, Target, TargetId, TargetSpec, Tracker, TrackerError, TrackerState,
    TrackerUpdate, UpdateOutcome,
};
pub use video::{SharedVideoSource, VideoError, VideoSource};
