use nalgebra::{Matrix4, Vector3};

use crate::field::Configuration;
use crate::frame::ImageFrame;

use super::target::TargetId;

/// What the estimator needs to know about one active target.
#[derive(Clone, Debug)]
pub struct TargetProbe {
    pub id: TargetId,
    pub pattern: String,
    pub size: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

/// Pose of one detected target.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Camera-relative transform.
    pub pose: Matrix4<f64>,
    pub confidence: f32,
}

/// Pose estimation engine.
///
/// `estimate` returns one entry per probe, in probe order; `None` means the
/// target was not found in `frame`. Runs on the tracker's worker thread.
pub trait PoseEstimator: Send + 'static {
    fn name(&self) -> &'static str;

    fn estimate(
        &mut self,
        frame: &ImageFrame,
        probes: &[TargetProbe],
        config: &Configuration,
    ) -> Vec<Option<Detection>>;
}

/// Fraction of the frame (per axis) inspected for a marker.
const CENTRE_WINDOW: f32 = 0.2;

/// Reports a fixed pose in front of the camera.
///
/// Config fields:
/// - `mode`: 0 = every frame, 1 = only frames whose centre is brighter than
///   `threshold` (a replayed marker)
/// - `distance`: marker distance along -Z in millimetres
#[derive(Debug, Default)]
pub struct FixedPoseEstimator;

impl FixedPoseEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl PoseEstimator for FixedPoseEstimator {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn estimate(
        &mut self,
        frame: &ImageFrame,
        probes: &[TargetProbe],
        config: &Configuration,
    ) -> Vec<Option<Detection>> {
        let mode = config.get::<i64>("mode").unwrap_or(0);
        let distance = config.get::<f64>("distance").unwrap_or(500.0);
        let confidence = match mode {
            0 => 1.0,
            1 => {
                let threshold = config.get::<i64>("threshold").unwrap_or(128).clamp(0, 255) as f32;
                let luma = frame.centre_luma(CENTRE_WINDOW);
                if luma <= threshold {
                    return vec![None; probes.len()];
                }
                (luma / 255.0).min(1.0)
            }
            other => {
                log::warn!("fixed estimator: unknown mode {}, reporting nothing", other);
                return vec![None; probes.len()];
            }
        };
        probes
            .iter()
            .map(|probe| {
                Some(Detection {
                    pose: Matrix4::new_translation(&Vector3::new(
                        probe.offset_x,
                        probe.offset_y,
                        -distance,
                    )),
                    confidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldScope, FieldValue};
    use crate::frame::{FrameFormat, PixelFormat};
    use std::time::Duration;

    fn config(mode: i64) -> Configuration {
        Configuration::new()
            .declare("mode", FieldValue::Int(mode), FieldScope::Live)
            .declare("threshold", FieldValue::Int(128), FieldScope::Live)
            .declare("distance", FieldValue::Float(300.0), FieldScope::Live)
    }

    fn frame(fill: u8) -> ImageFrame {
        let format = FrameFormat {
            width: 10,
            height: 10,
            pixel_format: PixelFormat::Gray8,
        };
        ImageFrame::new(vec![fill; 100], format, 1, Duration::ZERO).unwrap()
    }

    fn probe() -> TargetProbe {
        let spec = crate::tracker::TargetSpec::parse("single;p;80;10;-5").unwrap();
        TargetProbe {
            id: TargetId::from_spec(&spec),
            pattern: spec.pattern.clone(),
            size: spec.size,
            offset_x: spec.offset_x,
            offset_y: spec.offset_y,
        }
    }

    #[test]
    fn mode_zero_always_reports_offset_pose() {
        let mut est = FixedPoseEstimator::new();
        let out = est.estimate(&frame(0), &[probe()], &config(0));
        let det = out[0].as_ref().unwrap();
        assert_eq!(det.pose[(0, 3)], 10.0);
        assert_eq!(det.pose[(1, 3)], -5.0);
        assert_eq!(det.pose[(2, 3)], -300.0);
    }

    #[test]
    fn mode_one_gates_on_marker_brightness() {
        let mut est = FixedPoseEstimator::new();
        assert!(est.estimate(&frame(20), &[probe()], &config(1))[0].is_none());
        assert!(est.estimate(&frame(240), &[probe()], &config(1))[0].is_some());
    }
}
