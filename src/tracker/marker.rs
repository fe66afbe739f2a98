//! Marker tracker.
//!
//! `MarkerTracker` implements the tracker contract around any
//! `PoseEstimator`. The estimator runs on a worker thread; `update` waits at
//! most `timeout_ms` for it and marks every active target invalid when the
//! budget is exceeded, so one slow detection cannot stall the frame loop.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::field::{Configurable, Configuration, FieldScope, FieldValue};
use crate::stats::{StatsCollector, ROLE_TRACKER};
use crate::video::{SharedVideoSource, VideoSource};

use super::calibration::{Calibration, SharedCalibration};
use super::estimator::{FixedPoseEstimator, PoseEstimator, TargetProbe};
use super::target::{Target, TargetId, TargetSpec};
use super::worker::{DetectionWorker, Job, WorkerOutcome};
use super::{SkipReason, Tracker, TrackerError, TrackerState, TrackerUpdate, UpdateOutcome};

pub const DUMMY_NAME: &str = "dummytracker";

const DEFAULT_TIMEOUT_MS: i64 = 50;

/// The bundled tracker: fixed poses, optionally gated on a visible marker.
pub type DummyTracker = MarkerTracker<FixedPoseEstimator>;

impl DummyTracker {
    pub fn dummy() -> Self {
        MarkerTracker::new(DUMMY_NAME, FixedPoseEstimator::new())
    }
}

impl Default for DummyTracker {
    fn default() -> Self {
        Self::dummy()
    }
}

pub struct MarkerTracker<E: PoseEstimator> {
    name: &'static str,
    config: Configuration,
    state: TrackerState,
    calibration: Option<SharedCalibration>,
    source: Option<Weak<Mutex<dyn VideoSource>>>,
    targets: Vec<Target>,
    estimator: Option<E>,
    worker: Option<DetectionWorker>,
    last_sequence: Option<u64>,
    stats: Option<StatsCollector>,
}

impl<E: PoseEstimator> MarkerTracker<E> {
    pub fn new(name: &'static str, estimator: E) -> Self {
        let config = Configuration::new()
            .declare("mode", FieldValue::Int(0), FieldScope::Live)
            .declare("threshold", FieldValue::Int(128), FieldScope::Live)
            .declare("distance", FieldValue::Float(500.0), FieldScope::Live)
            .declare("timeout_ms", FieldValue::Int(DEFAULT_TIMEOUT_MS), FieldScope::Live)
            .declare("pattern_root", FieldValue::Text(String::new()), FieldScope::Live);
        Self {
            name,
            config,
            state: TrackerState::Created,
            calibration: None,
            source: None,
            targets: Vec::new(),
            estimator: Some(estimator),
            worker: None,
            last_sequence: None,
            stats: None,
        }
    }

    fn mark_configured(&mut self) {
        if self.state == TrackerState::Created {
            self.state = TrackerState::Configured;
        }
    }

    fn budget(&self) -> Duration {
        let ms = self
            .config
            .get::<i64>("timeout_ms")
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .max(1);
        Duration::from_millis(ms as u64)
    }

    fn resolve_pattern(&self, spec: &TargetSpec) -> Result<(), TrackerError> {
        let root = self.config.get::<String>("pattern_root").unwrap_or_default();
        if root.is_empty() {
            return Ok(());
        }
        if Path::new(&root).join(&spec.pattern).is_file() {
            Ok(())
        } else {
            Err(TrackerError::PatternUnresolved {
                pattern: spec.pattern.clone(),
                root,
            })
        }
    }

    fn valid_count(&self) -> usize {
        self.targets.iter().filter(|t| t.is_valid()).count()
    }

    fn invalidate_active(&mut self, sequence: u64) {
        for target in self.targets.iter_mut().filter(|t| t.is_active()) {
            target.commit(None, sequence);
        }
    }

    fn track(&mut self) -> Result<(UpdateOutcome, Option<u64>), TrackerError> {
        if self.state != TrackerState::Started {
            return Ok((UpdateOutcome::Skipped(SkipReason::NotStarted), self.last_sequence));
        }
        let Some(weak) = &self.source else {
            return Ok((UpdateOutcome::Skipped(SkipReason::NoImage), None));
        };
        let Some(source) = weak.upgrade() else {
            return Ok((UpdateOutcome::Skipped(SkipReason::SourceGone), self.last_sequence));
        };
        let frame = {
            let guard = source.lock().map_err(|_| TrackerError::SourcePoisoned)?;
            guard.current_frame()
        };
        let Some(frame) = frame else {
            return Ok((UpdateOutcome::Skipped(SkipReason::NoFrame), None));
        };
        if self.last_sequence.is_some_and(|last| frame.sequence <= last) {
            return Ok((
                UpdateOutcome::Skipped(SkipReason::FrameUnchanged),
                self.last_sequence,
            ));
        }
        let sequence = frame.sequence;
        self.last_sequence = Some(sequence);

        let probes: Vec<TargetProbe> = self
            .targets
            .iter()
            .filter(|t| t.is_active())
            .map(|t| TargetProbe {
                id: t.id(),
                pattern: t.spec().pattern.clone(),
                size: t.spec().size,
                offset_x: t.spec().offset_x,
                offset_y: t.spec().offset_y,
            })
            .collect();
        if probes.is_empty() {
            return Ok((UpdateOutcome::Tracked, Some(sequence)));
        }

        let budget = self.budget();
        let job = Job {
            sequence,
            frame,
            probes,
            config: self.config.clone(),
        };
        let Some(worker) = self.worker.as_mut() else {
            return Err(TrackerError::EngineStopped);
        };
        let probe_ids: Vec<TargetId> = job.probes.iter().map(|p| p.id).collect();
        match worker.run(job, budget) {
            WorkerOutcome::Done(detections) if detections.len() == probe_ids.len() => {
                for (id, detection) in probe_ids.iter().zip(detections) {
                    if let Some(target) = self.targets.iter_mut().find(|t| t.id() == *id) {
                        target.commit(detection.map(|d| (d.pose, d.confidence)), sequence);
                    }
                }
                Ok((UpdateOutcome::Tracked, Some(sequence)))
            }
            WorkerOutcome::Done(detections) => {
                log::warn!(
                    "{}: estimator returned {} results for {} targets; frame {} dropped",
                    self.name,
                    detections.len(),
                    probe_ids.len(),
                    sequence
                );
                self.invalidate_active(sequence);
                Ok((UpdateOutcome::TimedOut, Some(sequence)))
            }
            WorkerOutcome::TimedOut | WorkerOutcome::Busy => {
                log::debug!("{}: detection budget exceeded on frame {}", self.name, sequence);
                self.invalidate_active(sequence);
                Ok((UpdateOutcome::TimedOut, Some(sequence)))
            }
            WorkerOutcome::Disconnected => {
                self.invalidate_active(sequence);
                self.worker = None;
                Err(TrackerError::EngineStopped)
            }
        }
    }
}

impl<E: PoseEstimator> Configurable for MarkerTracker<E> {
    fn configuration(&self) -> Option<&Configuration> {
        Some(&self.config)
    }

    fn configuration_mut(&mut self) -> Option<&mut Configuration> {
        self.mark_configured();
        Some(&mut self.config)
    }
}

impl<E: PoseEstimator> Tracker for MarkerTracker<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn get_or_create_calibration(&mut self) -> SharedCalibration {
        self.mark_configured();
        self.calibration
            .get_or_insert_with(|| Arc::new(RwLock::new(Calibration::new())))
            .clone()
    }

    fn set_image(&mut self, source: &SharedVideoSource) {
        self.source = Some(Arc::downgrade(source));
        self.last_sequence = None;
        if matches!(self.state, TrackerState::Created | TrackerState::Configured) {
            self.state = TrackerState::ImageBound;
        }
    }

    fn add_target(&mut self, spec: &str) -> Result<TargetId, TrackerError> {
        let spec = TargetSpec::parse(spec)?;
        self.resolve_pattern(&spec)?;
        let target = Target::new(spec);
        let id = target.id();
        if self.targets.iter().any(|t| t.id() == id) {
            return Err(TrackerError::DuplicateTarget(id));
        }
        log::info!(
            "{}: registered target {} ({} '{}' {}mm)",
            self.name,
            id,
            target.spec().kind.as_str(),
            target.spec().pattern,
            target.spec().size
        );
        self.targets.push(target);
        Ok(id)
    }

    fn remove_target(&mut self, id: TargetId) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.id() != id);
        before != self.targets.len()
    }

    fn targets(&self) -> &[Target] {
        &self.targets
    }

    fn target_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.id() == id)
    }

    fn start(&mut self) -> Result<(), TrackerError> {
        if self.state == TrackerState::Started {
            return Ok(());
        }
        let applied = self.config.apply_payload_pairs();
        if applied > 0 {
            log::debug!("{}: applied {} payload settings", self.name, applied);
        }
        if self.worker.is_none() {
            let estimator = self.estimator.take().ok_or(TrackerError::EngineStopped)?;
            let worker = DetectionWorker::spawn(estimator)
                .map_err(|e| TrackerError::EngineStart(e.to_string()))?;
            self.worker = Some(worker);
        }
        self.state = TrackerState::Started;
        log::info!(
            "{}: tracking started ({} targets, budget {:?})",
            self.name,
            self.targets.len(),
            self.budget()
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == TrackerState::Started {
            self.state = TrackerState::Stopped;
            log::info!("{}: tracking stopped", self.name);
        }
    }

    fn state(&self) -> TrackerState {
        self.state
    }

    fn update(&mut self) -> Result<TrackerUpdate, TrackerError> {
        let started = Instant::now();
        let result = self.track();
        if let Some(stats) = &self.stats {
            stats.record(ROLE_TRACKER, "update_ms", started.elapsed().as_secs_f64() * 1000.0);
            stats.record(ROLE_TRACKER, "targets_valid", self.valid_count() as f64);
            let timed_out = matches!(result, Ok((UpdateOutcome::TimedOut, _)));
            stats.record(ROLE_TRACKER, "timeouts", if timed_out { 1.0 } else { 0.0 });
        }
        let (outcome, sequence) = result?;
        Ok(TrackerUpdate {
            outcome,
            sequence,
            valid_targets: self.valid_count(),
        })
    }

    fn set_stats(&mut self, stats: StatsCollector) {
        self.stats = Some(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldAccess, FieldError};
    use crate::frame::ImageFrame;
    use crate::video::{self, ReplayVideo};
    use crate::tracker::estimator::Detection;

    const HIRO: &str = "single;data/patt.hiro;80;0;0";

    fn running(script: &str, mode: i64) -> (SharedVideoSource, DummyTracker, TargetId) {
        let source = video::shared(ReplayVideo::from_script(script));
        {
            let mut guard = source.lock().unwrap();
            guard.open().unwrap();
            guard.start().unwrap();
        }
        let mut tracker = DummyTracker::dummy();
        tracker.set_field("mode", mode).unwrap();
        tracker.set_field("timeout_ms", 2_000i64).unwrap();
        tracker.set_image(&source);
        let id = tracker.add_target(HIRO).unwrap();
        tracker.target_mut(id).unwrap().set_active(true);
        tracker.start().unwrap();
        (source, tracker, id)
    }

    #[test]
    fn lifecycle_states() {
        let mut tracker = DummyTracker::dummy();
        assert_eq!(tracker.state(), TrackerState::Created);
        tracker.add_target(HIRO).unwrap();
        tracker.configuration_mut().unwrap().set_payload("mode=0;").unwrap();
        assert_eq!(tracker.state(), TrackerState::Configured);
        let source = video::shared(ReplayVideo::from_script("1"));
        tracker.set_image(&source);
        assert_eq!(tracker.state(), TrackerState::ImageBound);
        tracker.start().unwrap();
        assert_eq!(tracker.state(), TrackerState::Started);
        tracker.stop();
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert_eq!(tracker.targets().len(), 1);
    }

    #[test]
    fn calibration_is_shared_after_first_access() {
        let mut tracker = DummyTracker::dummy();
        let a = tracker.get_or_create_calibration();
        let b = tracker.get_or_create_calibration();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn bad_specs_and_duplicates_are_rejected() {
        let mut tracker = DummyTracker::dummy();
        assert!(matches!(
            tracker.add_target("single;;"),
            Err(TrackerError::InvalidSpec(_))
        ));
        tracker.add_target(HIRO).unwrap();
        assert!(matches!(
            tracker.add_target(HIRO),
            Err(TrackerError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn missing_pattern_asset_is_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/patt.hiro"), b"pattern").unwrap();
        let mut tracker = DummyTracker::dummy();
        tracker
            .set_field("pattern_root", dir.path().display().to_string())
            .unwrap();
        assert!(tracker.add_target(HIRO).is_ok());
        assert!(matches!(
            tracker.add_target("single;data/patt.kanji;80"),
            Err(TrackerError::PatternUnresolved { .. })
        ));
    }

    #[test]
    fn payload_pairs_apply_on_start() {
        let mut tracker = DummyTracker::dummy();
        tracker
            .configuration_mut()
            .unwrap()
            .set_payload("mode=1;threshold=90")
            .unwrap();
        tracker.start().unwrap();
        assert_eq!(tracker.field::<i64>("mode"), Some(1));
        assert_eq!(tracker.field::<i64>("threshold"), Some(90));
        assert_eq!(
            tracker.set_field("mode", true),
            Err(FieldError::TypeMismatch {
                name: "mode".into(),
                expected: crate::field::FieldKind::Int,
                found: crate::field::FieldKind::Bool,
            })
        );
    }

    #[test]
    fn update_follows_marker_visibility() {
        let (source, mut tracker, id) = running("101", 1);
        let mut seen = Vec::new();
        for _ in 0..3 {
            source.lock().unwrap().advance().unwrap();
            let update = tracker.update().unwrap();
            assert_eq!(update.outcome, UpdateOutcome::Tracked);
            seen.push(tracker.target(id).unwrap().is_valid());
        }
        assert_eq!(seen, vec![true, false, true]);
    }

    #[test]
    fn unchanged_frame_is_not_reprocessed() {
        let (source, mut tracker, id) = running("1", 0);
        source.lock().unwrap().advance().unwrap();
        let first = tracker.update().unwrap();
        assert_eq!(first.outcome, UpdateOutcome::Tracked);
        let second = tracker.update().unwrap();
        assert_eq!(
            second.outcome,
            UpdateOutcome::Skipped(SkipReason::FrameUnchanged)
        );
        assert_eq!(second.sequence, first.sequence);
        assert!(tracker.target(id).unwrap().is_valid());
    }

    #[test]
    fn stopped_tracker_keeps_targets_and_skips() {
        let (source, mut tracker, id) = running("11", 0);
        source.lock().unwrap().advance().unwrap();
        tracker.update().unwrap();
        tracker.stop();
        source.lock().unwrap().advance().unwrap();
        let update = tracker.update().unwrap();
        assert_eq!(update.outcome, UpdateOutcome::Skipped(SkipReason::NotStarted));
        assert_eq!(tracker.target(id).unwrap().frame_sequence(), Some(1));
        tracker.start().unwrap();
        tracker.update().unwrap();
        assert_eq!(tracker.target(id).unwrap().frame_sequence(), Some(2));
    }

    #[test]
    fn inactive_targets_are_not_estimated() {
        let (source, mut tracker, id) = running("1", 0);
        tracker.target_mut(id).unwrap().set_active(false);
        source.lock().unwrap().advance().unwrap();
        tracker.update().unwrap();
        assert!(!tracker.target(id).unwrap().is_valid());
        assert_eq!(tracker.target(id).unwrap().frame_sequence(), None);
    }

    #[test]
    fn dropped_source_is_skipped() {
        let (source, mut tracker, _) = running("1", 0);
        drop(source);
        let update = tracker.update().unwrap();
        assert_eq!(update.outcome, UpdateOutcome::Skipped(SkipReason::SourceGone));
    }

    struct SlowEstimator {
        delay: Duration,
    }

    impl PoseEstimator for SlowEstimator {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn estimate(
            &mut self,
            _frame: &ImageFrame,
            probes: &[TargetProbe],
            _config: &Configuration,
        ) -> Vec<Option<Detection>> {
            std::thread::sleep(self.delay);
            probes
                .iter()
                .map(|_| {
                    Some(Detection {
                        pose: nalgebra::Matrix4::identity(),
                        confidence: 1.0,
                    })
                })
                .collect()
        }
    }

    #[test]
    fn slow_detection_times_out_and_invalidates() {
        let source = video::shared(ReplayVideo::from_script("111"));
        {
            let mut guard = source.lock().unwrap();
            guard.open().unwrap();
            guard.start().unwrap();
        }
        let mut tracker = MarkerTracker::new(
            "slow",
            SlowEstimator {
                delay: Duration::from_millis(300),
            },
        );
        tracker.set_field("timeout_ms", 10i64).unwrap();
        tracker.set_image(&source);
        let id = tracker.add_target(HIRO).unwrap();
        tracker.target_mut(id).unwrap().set_active(true);
        tracker.start().unwrap();

        let stats = StatsCollector::new("test");
        tracker.set_stats(stats.clone());

        source.lock().unwrap().advance().unwrap();
        let started = Instant::now();
        let update = tracker.update().unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(update.outcome, UpdateOutcome::TimedOut);
        assert!(!tracker.target(id).unwrap().is_valid());

        // The engine is still busy with the abandoned frame.
        source.lock().unwrap().advance().unwrap();
        let update = tracker.update().unwrap();
        assert_eq!(update.outcome, UpdateOutcome::TimedOut);
        assert_eq!(tracker.target(id).unwrap().frame_sequence(), Some(2));
        assert_eq!(stats.end_frame().value(ROLE_TRACKER, "timeouts"), Some(2.0));
    }
}
