use nalgebra::Matrix4;

/// Exponential smoothing of an overlay's translation.
///
/// Rotation is taken from the newest pose unchanged. A pose is folded in at
/// most once per frame sequence, so an unchanged frame does not keep pulling
/// the overlay towards it.
#[derive(Clone, Debug)]
pub struct PoseFilter {
    alpha: f64,
    smoothed: Option<Matrix4<f64>>,
    last_sequence: Option<u64>,
}

impl PoseFilter {
    /// `alpha` is the weight of the newest pose, clamped to `(0, 1]`.
    /// 1.0 disables smoothing.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        Self {
            alpha,
            smoothed: None,
            last_sequence: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn apply(&mut self, pose: &Matrix4<f64>, sequence: u64) -> Matrix4<f64> {
        if let (Some(smoothed), Some(last)) = (self.smoothed, self.last_sequence) {
            if last == sequence {
                return smoothed;
            }
        }
        let mut next = *pose;
        if let Some(prev) = self.smoothed {
            for row in 0..3 {
                next[(row, 3)] = prev[(row, 3)] + self.alpha * (pose[(row, 3)] - prev[(row, 3)]);
            }
        }
        self.smoothed = Some(next);
        self.last_sequence = Some(sequence);
        next
    }

    /// Forget history; the next pose is taken as is.
    pub fn reset(&mut self) {
        self.smoothed = None;
        self.last_sequence = None;
    }
}
