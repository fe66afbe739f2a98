//! Per-frame update pipeline.
//!
//! One call to [`FramePipeline::tick`] runs an explicit, ordered list of
//! steps on the calling thread. The video lock is released before the
//! tracker runs; the tracker pulls the frame itself through its `Weak`
//! binding. Per-frame failures are logged, counted and reported, then the
//! frame carries on with the last known state.

mod filter;

use std::time::Instant;

use thiserror::Error;

use crate::compositor::{CompositeError, Compositor, DrawCommand, OverlayGeometry};
use crate::stats::{StatsCollector, StatsReport, ROLE_PIPELINE};
use crate::tracker::{SharedTracker, TargetId, TrackerError, TrackerUpdate};
use crate::video::{SharedVideoSource, VideoError};

pub use filter::PoseFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStep {
    AdvanceVideo,
    UpdateTracker,
    PropagatePoses,
    Composite,
    ReportStats,
}

impl FrameStep {
    pub const DEFAULT_ORDER: [FrameStep; 5] = [
        FrameStep::AdvanceVideo,
        FrameStep::UpdateTracker,
        FrameStep::PropagatePoses,
        FrameStep::Composite,
        FrameStep::ReportStats,
    ];

    fn timing_key(self) -> &'static str {
        match self {
            FrameStep::AdvanceVideo => "advance_video_ms",
            FrameStep::UpdateTracker => "update_tracker_ms",
            FrameStep::PropagatePoses => "propagate_poses_ms",
            FrameStep::Composite => "composite_ms",
            FrameStep::ReportStats => "report_stats_ms",
        }
    }

    /// A step list must keep the default relative order, name each step at
    /// most once and end with `ReportStats`.
    pub fn validate(steps: &[FrameStep]) -> Result<(), StepListError> {
        let mut next = 0;
        for step in steps {
            match FrameStep::DEFAULT_ORDER[next..].iter().position(|s| s == step) {
                Some(offset) => next += offset + 1,
                None => return Err(StepListError::OutOfOrder(*step)),
            }
        }
        match steps.last() {
            Some(FrameStep::ReportStats) => Ok(()),
            _ => Err(StepListError::MissingReport),
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StepListError {
    #[error("step {0:?} is repeated or out of order")]
    OutOfOrder(FrameStep),
    #[error("step list does not end with ReportStats")]
    MissingReport,
}

/// A per-frame failure. None of these stop the pipeline.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("video: {0}")]
    Video(#[from] VideoError),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// The video source delivered a new frame this tick.
    pub video_changed: bool,
    /// Sequence of the background frame.
    pub video_sequence: Option<u64>,
    pub tracker: Option<TrackerUpdate>,
    /// Overlays shown after pose propagation.
    pub visible: Vec<TargetId>,
    pub draw_list: Vec<DrawCommand>,
    pub stats: Option<StatsReport>,
    pub errors: Vec<FrameError>,
}

struct OverlayBinding {
    target: TargetId,
    filter: Option<PoseFilter>,
}

pub struct FramePipeline {
    video: SharedVideoSource,
    tracker: SharedTracker,
    compositor: Compositor,
    stats: StatsCollector,
    steps: Vec<FrameStep>,
    bindings: Vec<OverlayBinding>,
    frame: u64,
    video_errors: u64,
    tracker_errors: u64,
}

impl FramePipeline {
    pub fn new(
        video: SharedVideoSource,
        tracker: SharedTracker,
        compositor: Compositor,
        stats: StatsCollector,
    ) -> Self {
        Self {
            video,
            tracker,
            compositor,
            stats,
            steps: FrameStep::DEFAULT_ORDER.to_vec(),
            bindings: Vec::new(),
            frame: 0,
            video_errors: 0,
            tracker_errors: 0,
        }
    }

    /// Replace the step list. Steps may be left out, never reordered.
    pub fn with_steps(mut self, steps: Vec<FrameStep>) -> Result<Self, StepListError> {
        FrameStep::validate(&steps)?;
        self.steps = steps;
        Ok(self)
    }

    pub fn steps(&self) -> &[FrameStep] {
        &self.steps
    }

    /// Attach an overlay to `target`. The overlay follows the target's pose
    /// while it is valid and is hidden otherwise.
    pub fn bind_overlay(
        &mut self,
        target: TargetId,
        geometry: OverlayGeometry,
        filter: Option<PoseFilter>,
    ) -> Result<(), CompositeError> {
        self.compositor.add_overlay(target, geometry)?;
        self.bindings.push(OverlayBinding { target, filter });
        Ok(())
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub fn video(&self) -> &SharedVideoSource {
        &self.video
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn video_errors(&self) -> u64 {
        self.video_errors
    }

    pub fn tracker_errors(&self) -> u64 {
        self.tracker_errors
    }

    pub fn tick(&mut self) -> FrameReport {
        self.frame += 1;
        self.stats.begin_frame(self.frame);
        let mut report = FrameReport {
            frame: self.frame,
            ..FrameReport::default()
        };
        let tick_started = Instant::now();
        let mut tracker_failed = false;

        let steps = self.steps.clone();
        for step in steps {
            let started = Instant::now();
            match step {
                FrameStep::AdvanceVideo => self.advance_video(&mut report),
                FrameStep::UpdateTracker => tracker_failed |= !self.update_tracker(&mut report),
                FrameStep::PropagatePoses => self.propagate_poses(tracker_failed, &mut report),
                FrameStep::Composite => self.composite(&mut report),
                FrameStep::ReportStats => {
                    self.stats.record(
                        ROLE_PIPELINE,
                        "frame_ms",
                        tick_started.elapsed().as_secs_f64() * 1000.0,
                    );
                    self.stats.record(
                        ROLE_PIPELINE,
                        "overlays_visible",
                        self.compositor.visible_overlays() as f64,
                    );
                    report.stats = Some(self.stats.end_frame());
                    continue;
                }
            }
            self.stats.record(
                ROLE_PIPELINE,
                step.timing_key(),
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        report
    }

    fn advance_video(&mut self, report: &mut FrameReport) {
        let result = match self.video.lock() {
            Ok(mut source) => source.advance().map_err(FrameError::from),
            Err(_) => Err(FrameError::Poisoned("video source")),
        };
        match result {
            Ok(changed) => report.video_changed = changed,
            Err(err) => {
                log::warn!("frame {}: {}", self.frame, err);
                self.video_errors += 1;
                self.stats.record(ROLE_PIPELINE, "video_errors", 1.0);
                report.errors.push(err);
            }
        }
    }

    /// Returns false when the tracker failed this frame.
    fn update_tracker(&mut self, report: &mut FrameReport) -> bool {
        let result = match self.tracker.lock() {
            Ok(mut tracker) => tracker.update().map_err(FrameError::from),
            Err(_) => Err(FrameError::Poisoned("tracker")),
        };
        match result {
            Ok(update) => {
                report.tracker = Some(update);
                true
            }
            Err(err) => {
                log::warn!("frame {}: {}", self.frame, err);
                self.tracker_errors += 1;
                self.stats.record(ROLE_PIPELINE, "tracker_errors", 1.0);
                report.errors.push(err);
                false
            }
        }
    }

    /// Sequence of the frame the next composite will show as background.
    fn display_sequence(&self, report: &mut FrameReport) -> Option<u64> {
        let current = match self.video.lock() {
            Ok(source) => source.current_frame().map(|f| f.sequence),
            Err(_) => {
                report.errors.push(FrameError::Poisoned("video source"));
                None
            }
        };
        current.or_else(|| self.compositor.background_sequence())
    }

    fn propagate_poses(&mut self, tracker_failed: bool, report: &mut FrameReport) {
        let shown = self.display_sequence(report);
        let tracker = match self.tracker.lock() {
            Ok(tracker) if !tracker_failed => Some(tracker),
            Ok(_) => None,
            Err(_) => {
                report.errors.push(FrameError::Poisoned("tracker"));
                None
            }
        };
        for binding in &mut self.bindings {
            let placed = tracker
                .as_ref()
                .and_then(|t| t.target(binding.target))
                .filter(|t| t.is_active())
                .and_then(|t| Some((*t.pose()?, t.frame_sequence()?)))
                // A pose from any other frame than the background is stale.
                .filter(|(_, sequence)| Some(*sequence) == shown);
            match placed {
                Some((pose, sequence)) => {
                    let transform = match binding.filter.as_mut() {
                        Some(filter) => filter.apply(&pose, sequence),
                        None => pose,
                    };
                    self.compositor.show_overlay(binding.target, transform, sequence);
                    report.visible.push(binding.target);
                }
                None => {
                    if let Some(filter) = binding.filter.as_mut() {
                        filter.reset();
                    }
                    self.compositor.hide_overlay(binding.target);
                }
            }
        }
    }

    fn composite(&mut self, report: &mut FrameReport) {
        let frame = match self.video.lock() {
            Ok(source) => source.current_frame(),
            Err(_) => {
                report.errors.push(FrameError::Poisoned("video source"));
                None
            }
        };
        // A failed capture keeps the last background.
        if frame.is_some() {
            self.compositor.set_background_frame(frame);
        }
        report.draw_list = self.compositor.draw_list();
        report.video_sequence = report.draw_list.iter().find_map(|c| match c.item {
            crate::compositor::DrawItem::VideoBackground { sequence, .. } => Some(sequence),
            _ => None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{CompositorSettings, DrawItem};
    use crate::field::FieldAccess;
    use crate::stats::{ROLE_TRACKER, ROLE_VIDEO};
    use crate::tracker::{self, DummyTracker, Tracker};
    use crate::video::{self, ReplayVideo};

    const HIRO: &str = "single;data/patt.hiro;80;0;0";

    fn pipeline(script: &str, mode: i64, filter: Option<PoseFilter>) -> (FramePipeline, TargetId) {
        let stats = StatsCollector::new("test timings");
        let source = video::shared(ReplayVideo::from_script(script));
        {
            let mut source = source.lock().unwrap();
            source.open().unwrap();
            source.set_stats(stats.clone());
        }
        let mut dummy = DummyTracker::dummy();
        dummy.set_field("mode", mode).unwrap();
        dummy.set_field("timeout_ms", 2_000i64).unwrap();
        dummy.set_stats(stats.clone());
        dummy.set_image(&source);
        let id = dummy.add_target(HIRO).unwrap();
        dummy.target_mut(id).unwrap().set_active(true);
        let calibration = dummy.get_or_create_calibration();
        let tracker = tracker::shared(dummy);

        let compositor = Compositor::new(calibration, CompositorSettings::default()).unwrap();
        let mut pipeline = FramePipeline::new(source.clone(), tracker.clone(), compositor, stats);
        pipeline
            .bind_overlay(id, OverlayGeometry::Cube { size: 8.0 }, filter)
            .unwrap();
        source.lock().unwrap().start().unwrap();
        tracker.lock().unwrap().start().unwrap();
        (pipeline, id)
    }

    #[test]
    fn overlay_tracks_marker_visibility() {
        let (mut pipeline, id) = pipeline("1101", 1, None);
        let shown: Vec<bool> = (0..4)
            .map(|_| pipeline.tick().visible.contains(&id))
            .collect();
        assert_eq!(shown, vec![true, true, false, true]);
    }

    #[test]
    fn background_is_drawn_before_overlay() {
        let (mut pipeline, _) = pipeline("1", 0, None);
        let report = pipeline.tick();
        assert_eq!(report.draw_list.len(), 2);
        assert!(matches!(report.draw_list[0].item, DrawItem::VideoBackground { .. }));
        assert!(matches!(report.draw_list[1].item, DrawItem::Overlay { .. }));
        assert_eq!(report.video_sequence, Some(1));
    }

    #[test]
    fn held_frame_keeps_last_state() {
        let (mut pipeline, id) = pipeline("1", 0, None);
        pipeline.tick();
        let report = pipeline.tick();
        assert!(!report.video_changed);
        assert!(report.visible.contains(&id));
        assert_eq!(report.video_sequence, Some(1));
        assert_eq!(
            pipeline.compositor().overlay(id).unwrap().applied_sequence,
            Some(1)
        );
    }

    #[test]
    fn every_role_reports_each_frame() {
        let (mut pipeline, _) = pipeline("10101", 1, None);
        for _ in 0..5 {
            let report = pipeline.tick();
            let stats = report.stats.unwrap();
            assert!(stats.value(ROLE_PIPELINE, "frame_ms").is_some());
            assert!(stats.value(ROLE_TRACKER, "update_ms").is_some());
        }
        assert!(pipeline.stats().sample_count(ROLE_VIDEO) >= 5);
        assert!(pipeline.stats().sample_count(ROLE_TRACKER) >= 5);
    }

    #[test]
    fn stopped_video_is_counted_not_fatal() {
        let (mut pipeline, id) = pipeline("11", 0, None);
        pipeline.tick();
        pipeline.video().lock().unwrap().stop();
        let report = pipeline.tick();
        assert!(matches!(
            report.errors.as_slice(),
            [FrameError::Video(VideoError::NotStarted)]
        ));
        assert_eq!(pipeline.video_errors(), 1);
        assert_eq!(report.stats.unwrap().value(ROLE_PIPELINE, "video_errors"), Some(1.0));
        // Tracker has nothing new; the overlay stays where it was.
        assert!(report.visible.contains(&id));
    }

    #[test]
    fn smoothing_resets_after_loss() {
        let (mut pipeline, id) = pipeline("101", 1, Some(PoseFilter::new(0.5)));
        pipeline.tick();
        pipeline.tick();
        assert!(!pipeline.compositor().overlay(id).unwrap().visible);
        let report = pipeline.tick();
        assert!(report.visible.contains(&id));
        let node = pipeline.compositor().overlay(id).unwrap();
        assert_eq!(node.transform[(2, 3)], -500.0);
    }

    #[test]
    fn stopped_tracker_hides_overlay() {
        let (mut pipeline, id) = pipeline("1000", 1, None);
        assert!(pipeline.tick().visible.contains(&id));
        pipeline.tracker().lock().unwrap().stop();
        for sequence in 2..=4 {
            let report = pipeline.tick();
            assert_eq!(report.video_sequence, Some(sequence));
            assert!(report.visible.is_empty());
            assert!(!report
                .draw_list
                .iter()
                .any(|c| matches!(c.item, DrawItem::Overlay { .. })));
            assert!(!pipeline.compositor().overlay(id).unwrap().visible);
        }
    }

    #[test]
    fn reordered_step_lists_are_rejected() {
        let (pipeline, _) = pipeline("10", 1, None);
        let reordered = vec![
            FrameStep::PropagatePoses,
            FrameStep::AdvanceVideo,
            FrameStep::UpdateTracker,
            FrameStep::Composite,
            FrameStep::ReportStats,
        ];
        assert_eq!(
            FrameStep::validate(&reordered),
            Err(StepListError::OutOfOrder(FrameStep::AdvanceVideo))
        );
        let repeated = vec![
            FrameStep::AdvanceVideo,
            FrameStep::AdvanceVideo,
            FrameStep::ReportStats,
        ];
        assert_eq!(
            FrameStep::validate(&repeated),
            Err(StepListError::OutOfOrder(FrameStep::AdvanceVideo))
        );
        assert_eq!(
            FrameStep::validate(&[FrameStep::AdvanceVideo, FrameStep::Composite]),
            Err(StepListError::MissingReport)
        );
        assert_eq!(FrameStep::validate(&[]), Err(StepListError::MissingReport));
        assert!(pipeline.with_steps(reordered).is_err());
    }

    #[test]
    fn reduced_step_list_still_reports() {
        let (pipeline, _) = pipeline("1", 0, None);
        let mut pipeline = pipeline
            .with_steps(vec![
                FrameStep::AdvanceVideo,
                FrameStep::Composite,
                FrameStep::ReportStats,
            ])
            .unwrap();
        let report = pipeline.tick();
        assert!(report.stats.is_some());
        assert!(report.tracker.is_none());
        assert_eq!(report.draw_list.len(), 1);
    }
}
