//! Camera calibration.
//!
//! A `Calibration` holds the pinhole intrinsics of the tracking camera and
//! turns them into the projection matrix the overlay camera renders with.
//! An empty calibration source loads the default intrinsics: overlays still
//! render, possibly misaligned, instead of the pipeline refusing to start.

use std::path::Path;
use std::sync::{Arc, RwLock};

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FOCAL: f64 = 700.0;
const MAX_DISTORTION_COEFFS: usize = 5;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("failed to read calibration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid calibration {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("calibration rejected: {0}")]
    Invalid(String),
}

/// Pinhole intrinsics with optional radial/tangential distortion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// k1, k2, p1, p2, k3 (any prefix).
    #[serde(default)]
    pub distortion: Vec<f64>,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fx: DEFAULT_FOCAL,
            fy: DEFAULT_FOCAL,
            cx: DEFAULT_WIDTH as f64 / 2.0,
            cy: DEFAULT_HEIGHT as f64 / 2.0,
            distortion: Vec::new(),
        }
    }
}

impl Intrinsics {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.width == 0 || self.height == 0 {
            return Err(CalibrationError::Invalid("image size must be non-zero".into()));
        }
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(CalibrationError::Invalid("parameters must be finite".into()));
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(CalibrationError::Invalid("focal lengths must be positive".into()));
        }
        if self.distortion.len() > MAX_DISTORTION_COEFFS {
            return Err(CalibrationError::Invalid(format!(
                "at most {} distortion coefficients, got {}",
                MAX_DISTORTION_COEFFS,
                self.distortion.len()
            )));
        }
        Ok(())
    }

    /// Rescale to another image size, e.g. when the video negotiates a
    /// resolution different from the one the camera was calibrated at.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        Self {
            width,
            height,
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            distortion: self.distortion.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Calibration {
    intrinsics: Intrinsics,
    loaded: bool,
    source: String,
}

/// Calibration shared by a tracker and the compositor. Written on load only.
pub type SharedCalibration = Arc<RwLock<Calibration>>;

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_intrinsics(intrinsics: Intrinsics) -> Result<Self, CalibrationError> {
        intrinsics.validate()?;
        Ok(Self {
            intrinsics,
            loaded: true,
            source: String::from("<inline>"),
        })
    }

    /// Load from `source`. An empty source selects the default intrinsics.
    ///
    /// On error the previous state is kept.
    pub fn load(&mut self, source: &str) -> Result<(), CalibrationError> {
        let source = source.trim();
        let intrinsics = if source.is_empty() {
            log::info!("calibration: no source given, using default intrinsics");
            Intrinsics::default()
        } else {
            read_intrinsics(Path::new(source))?
        };
        intrinsics.validate()?;
        log::debug!(
            "calibration: {}x{} fx={:.1} fy={:.1} cx={:.1} cy={:.1}",
            intrinsics.width,
            intrinsics.height,
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy
        );
        self.intrinsics = intrinsics;
        self.loaded = true;
        self.source = source.to_string();
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Intrinsics in effect. Defaults when nothing was loaded.
    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// Right-handed OpenGL projection for the calibrated camera.
    ///
    /// Image origin is the top-left pixel; the camera looks down -Z.
    pub fn projection_matrix(&self, near: f64, far: f64) -> Result<Matrix4<f64>, CalibrationError> {
        if !(near > 0.0 && far > near && far.is_finite()) {
            return Err(CalibrationError::Invalid(format!(
                "clip planes near={} far={} are invalid",
                near, far
            )));
        }
        Ok(projection(&self.intrinsics, near, far))
    }
}

fn projection(k: &Intrinsics, near: f64, far: f64) -> Matrix4<f64> {
    let w = k.width as f64;
    let h = k.height as f64;
    #[rustfmt::skip]
    let m = Matrix4::new(
        2.0 * k.fx / w, 0.0, 1.0 - 2.0 * k.cx / w, 0.0,
        0.0, 2.0 * k.fy / h, 2.0 * k.cy / h - 1.0, 0.0,
        0.0, 0.0, -(far + near) / (far - near), -2.0 * far * near / (far - near),
        0.0, 0.0, -1.0, 0.0,
    );
    m
}

fn read_intrinsics(path: &Path) -> Result<Intrinsics, CalibrationError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CalibrationError::Parse {
        path: path.display().to_string(),
        source,
    })
}
