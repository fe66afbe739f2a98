//! Trackable targets.
//!
//! A target is created from a specification string of the form
//! `kind;pattern;size;offset_x;offset_y`, e.g. `single;data/patt.hiro;80;0;0`.
//! Offsets may be left out together; every other field is required.

use std::fmt;

use nalgebra::Matrix4;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TargetSpecError {
    #[error("target specification is empty")]
    Empty,
    #[error("unknown target kind '{0}' (expected single or multi)")]
    UnknownKind(String),
    #[error("target specification is missing {0}")]
    MissingField(&'static str),
    #[error("target {field} '{value}' is not a number")]
    InvalidNumber { field: &'static str, value: String },
    #[error("target {field} {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("target specification has {0} fields, at most 5 are allowed")]
    TooManyFields(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// One square fiducial.
    Single,
    /// A multi-marker board described by the pattern file.
    Multi,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Single => "single",
            TargetKind::Multi => "multi",
        }
    }
}

/// Parsed target specification.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetSpec {
    pub kind: TargetKind,
    /// Pattern asset reference, resolved by the tracker.
    pub pattern: String,
    /// Physical marker width in millimetres.
    pub size: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl TargetSpec {
    pub fn parse(spec: &str) -> Result<Self, TargetSpecError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TargetSpecError::Empty);
        }
        let mut fields: Vec<&str> = spec.split(';').map(str::trim).collect();
        // Tolerate one trailing separator.
        if fields.len() > 1 && fields.last() == Some(&"") {
            fields.pop();
        }
        if fields.len() > 5 {
            return Err(TargetSpecError::TooManyFields(fields.len()));
        }
        let field = |i: usize| fields.get(i).copied().filter(|f| !f.is_empty());

        let kind = match field(0).ok_or(TargetSpecError::MissingField("kind"))? {
            k if k.eq_ignore_ascii_case("single") => TargetKind::Single,
            k if k.eq_ignore_ascii_case("multi") => TargetKind::Multi,
            other => return Err(TargetSpecError::UnknownKind(other.to_string())),
        };
        let pattern = field(1).ok_or(TargetSpecError::MissingField("pattern"))?;
        let size = number("size", field(2).ok_or(TargetSpecError::MissingField("size"))?)?;
        if size <= 0.0 {
            return Err(TargetSpecError::OutOfRange {
                field: "size",
                value: size,
            });
        }
        let (offset_x, offset_y) = match (field(3), field(4)) {
            (None, None) => (0.0, 0.0),
            (Some(x), Some(y)) => (number("offset_x", x)?, number("offset_y", y)?),
            (Some(_), None) => return Err(TargetSpecError::MissingField("offset_y")),
            (None, Some(_)) => return Err(TargetSpecError::MissingField("offset_x")),
        };
        Ok(Self {
            kind,
            pattern: pattern.to_string(),
            size,
            offset_x,
            offset_y,
        })
    }

    /// Canonical form used for identity.
    pub fn canonical(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.kind.as_str(),
            self.pattern,
            self.size,
            self.offset_x,
            self.offset_y
        )
    }
}

fn number(field: &'static str, raw: &str) -> Result<f64, TargetSpecError> {
    let value: f64 = raw.parse().map_err(|_| TargetSpecError::InvalidNumber {
        field,
        value: raw.to_string(),
    })?;
    if !value.is_finite() {
        return Err(TargetSpecError::OutOfRange { field, value });
    }
    Ok(value)
}

/// Stable identity of a target, derived from its canonical specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId([u8; 8]);

impl TargetId {
    pub fn from_spec(spec: &TargetSpec) -> Self {
        let digest = Sha256::digest(spec.canonical().as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        Self(id)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One trackable entity, owned by the tracker that created it.
#[derive(Clone, Debug)]
pub struct Target {
    id: TargetId,
    spec: TargetSpec,
    active: bool,
    pose: Matrix4<f64>,
    valid: bool,
    confidence: f32,
    frame_sequence: Option<u64>,
}

impl Target {
    pub(crate) fn new(spec: TargetSpec) -> Self {
        Self {
            id: TargetId::from_spec(&spec),
            spec,
            active: false,
            pose: Matrix4::identity(),
            valid: false,
            confidence: 0.0,
            frame_sequence: None,
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Toggle participation in pose updates. Deactivating clears validity.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if !active {
            self.valid = false;
            self.confidence = 0.0;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Camera-relative pose. `None` unless the last update detected the target.
    pub fn pose(&self) -> Option<&Matrix4<f64>> {
        self.valid.then_some(&self.pose)
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Sequence of the frame the current pose state came from.
    pub fn frame_sequence(&self) -> Option<u64> {
        self.frame_sequence
    }

    /// Commit one frame's result. Pose, validity and confidence change together.
    pub(crate) fn commit(&mut self, pose: Option<(Matrix4<f64>, f32)>, sequence: u64) {
        match pose {
            Some((pose, confidence)) => {
                self.pose = pose;
                self.confidence = confidence;
                self.valid = true;
            }
            None => {
                self.valid = false;
                self.confidence = 0.0;
            }
        }
        self.frame_sequence = Some(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn parses_hiro_spec() {
        let spec = TargetSpec::parse("single;data/patt.hiro;80;0;0").unwrap();
        assert_eq!(spec.kind, TargetKind::Single);
        assert_eq!(spec.pattern, "data/patt.hiro");
        assert_eq!(spec.size, 80.0);
        assert_eq!((spec.offset_x, spec.offset_y), (0.0, 0.0));
    }

    #[test]
    fn missing_fields_are_distinguishable() {
        // The first empty field is the one reported.
        assert_eq!(
            TargetSpec::parse("single;;"),
            Err(TargetSpecError::MissingField("pattern"))
        );
        assert_eq!(
            TargetSpec::parse("single;data/patt.hiro;;"),
            Err(TargetSpecError::MissingField("size"))
        );
        assert_eq!(
            TargetSpec::parse("single;data/patt.hiro"),
            Err(TargetSpecError::MissingField("size"))
        );
        assert_eq!(
            TargetSpec::parse("single;data/patt.hiro;;0;0"),
            Err(TargetSpecError::MissingField("size"))
        );
        assert_eq!(
            TargetSpec::parse("single;data/patt.hiro;80;5"),
            Err(TargetSpecError::MissingField("offset_y"))
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(TargetSpec::parse("  "), Err(TargetSpecError::Empty));
        assert_eq!(
            TargetSpec::parse("blob;p;80"),
            Err(TargetSpecError::UnknownKind("blob".into()))
        );
        assert!(matches!(
            TargetSpec::parse("single;p;eighty"),
            Err(TargetSpecError::InvalidNumber { field: "size", .. })
        ));
        assert!(matches!(
            TargetSpec::parse("single;p;0"),
            Err(TargetSpecError::OutOfRange { field: "size", .. })
        ));
        assert!(matches!(
            TargetSpec::parse("single;p;80;0;0;1"),
            Err(TargetSpecError::TooManyFields(6))
        ));
    }

    #[test]
    fn optional_offsets_and_trailing_separator() {
        let a = TargetSpec::parse("multi;data/board.dat;40").unwrap();
        let b = TargetSpec::parse("multi; data/board.dat ;40;0;0;").unwrap();
        assert_eq!(a, b);
        assert_eq!(TargetId::from_spec(&a), TargetId::from_spec(&b));
    }

    #[test]
    fn invalid_target_exposes_no_pose() {
        let mut target = Target::new(TargetSpec::parse("single;p;80").unwrap());
        assert!(!target.is_active());
        target.set_active(true);
        target.commit(
            Some((Matrix4::new_translation(&Vector3::new(0.0, 0.0, -5.0)), 0.9)),
            1,
        );
        assert!(target.pose().is_some());
        target.commit(None, 2);
        assert!(target.pose().is_none());
        assert_eq!(target.frame_sequence(), Some(2));
        target.commit(Some((Matrix4::identity(), 1.0)), 3);
        target.set_active(false);
        assert!(!target.is_valid());
    }
}
