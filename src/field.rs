//! Typed plugin configuration.
//!
//! Both video sources and trackers carry a `Configuration`: a map from field
//! name to a tagged `FieldValue`. The opaque payload string that callers hand
//! to a plugin lives in the reserved `config` text field, so there is exactly
//! one place a plugin reads its settings from.
//!
//! Access is checked at runtime by name and type. A lookup with an unknown
//! name or the wrong type yields `None`, never a panic.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

/// Reserved field holding the raw configuration payload.
pub const PAYLOAD_FIELD: &str = "config";

/// Tagged configuration value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }

    /// Parse `raw` as a value of `kind`. Used when folding `key=value` payloads.
    pub fn parse_as(kind: FieldKind, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match kind {
            FieldKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(FieldValue::Bool(true)),
                "0" | "false" | "no" | "off" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            FieldKind::Int => raw.parse().ok().map(FieldValue::Int),
            FieldKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float),
            FieldKind::Text => Some(FieldValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
}

/// When a field may be changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldScope {
    /// Affects stream negotiation. Frozen once the owner is opened.
    PreOpen,
    /// May be changed at any time.
    Live,
}

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("unknown configuration field '{0}'")]
    Unknown(String),
    #[error("field '{name}' holds {found:?}, not {expected:?}")]
    TypeMismatch {
        name: String,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("field '{0}' only takes effect before open")]
    Frozen(String),
}

/// Rust types that can be read from and written to a `FieldValue`.
pub trait FieldType: Sized {
    const KIND: FieldKind;
    fn from_value(value: &FieldValue) -> Option<Self>;
    fn into_value(self) -> FieldValue;
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Bool;
    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
    fn into_value(self) -> FieldValue {
        FieldValue::Bool(self)
    }
}

impl FieldType for i64 {
    const KIND: FieldKind = FieldKind::Int;
    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
    fn into_value(self) -> FieldValue {
        FieldValue::Int(self)
    }
}

impl FieldType for f64 {
    const KIND: FieldKind = FieldKind::Float;
    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
    fn into_value(self) -> FieldValue {
        FieldValue::Float(self)
    }
}

impl FieldType for String {
    const KIND: FieldKind = FieldKind::Text;
    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
    fn into_value(self) -> FieldValue {
        FieldValue::Text(self)
    }
}

#[derive(Clone, Debug)]
struct FieldSlot {
    value: FieldValue,
    scope: FieldScope,
}

/// Named, typed configuration fields of one plugin instance.
#[derive(Clone, Debug)]
pub struct Configuration {
    fields: BTreeMap<String, FieldSlot>,
    frozen: bool,
}

impl Configuration {
    /// New configuration with an empty payload.
    pub fn new() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            PAYLOAD_FIELD.to_string(),
            FieldSlot {
                value: FieldValue::Text(String::new()),
                scope: FieldScope::PreOpen,
            },
        );
        Self {
            fields,
            frozen: false,
        }
    }

    /// Declare a field with its default value. Plugins call this at construction.
    pub fn declare(mut self, name: &str, default: FieldValue, scope: FieldScope) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSlot {
                value: default,
                scope,
            },
        );
        self
    }

    /// Typed read. `None` for unknown names or mismatched types.
    pub fn get<T: FieldType>(&self, name: &str) -> Option<T> {
        self.fields
            .get(name)
            .and_then(|slot| T::from_value(&slot.value))
    }

    /// Typed write. The value is left untouched on any error.
    pub fn set<T: FieldType>(&mut self, name: &str, value: T) -> Result<(), FieldError> {
        self.set_value(name, value.into_value())
    }

    pub fn set_value(&mut self, name: &str, value: FieldValue) -> Result<(), FieldError> {
        let frozen = self.frozen;
        let slot = self
            .fields
            .get_mut(name)
            .ok_or_else(|| FieldError::Unknown(name.to_string()))?;
        if slot.value.kind() != value.kind() {
            return Err(FieldError::TypeMismatch {
                name: name.to_string(),
                expected: slot.value.kind(),
                found: value.kind(),
            });
        }
        if frozen && slot.scope == FieldScope::PreOpen {
            log::warn!("configuration field '{}' set after open; ignored", name);
            return Err(FieldError::Frozen(name.to_string()));
        }
        slot.value = value;
        Ok(())
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).map(|slot| slot.value.kind())
    }

    /// Raw payload string.
    pub fn payload(&self) -> String {
        self.get::<String>(PAYLOAD_FIELD).unwrap_or_default()
    }

    pub fn set_payload(&mut self, payload: impl Into<String>) -> Result<(), FieldError> {
        self.set(PAYLOAD_FIELD, payload.into())
    }

    /// Fold `key=value;` pairs from the payload into declared fields.
    ///
    /// Unknown keys and unparsable values are logged and skipped. Returns the
    /// number of fields applied.
    pub fn apply_payload_pairs(&mut self) -> usize {
        let payload = self.payload();
        let mut applied = 0;
        for pair in payload.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, raw)) = pair.split_once('=') else {
                log::debug!("configuration payload entry '{}' is not key=value", pair);
                continue;
            };
            let key = key.trim();
            if key == PAYLOAD_FIELD {
                continue;
            }
            let Some(kind) = self.kind_of(key) else {
                log::warn!("configuration payload names unknown field '{}'", key);
                continue;
            };
            let Some(value) = FieldValue::parse_as(kind, raw) else {
                log::warn!("configuration payload value '{}' for '{}' is not {:?}", raw, key, kind);
                continue;
            };
            match self.set_value(key, value) {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("configuration payload: {}", e),
            }
        }
        applied
    }

    /// Freeze `PreOpen` fields. Called by the owner on open.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Field names in stable order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable handle to one field of a known type.
pub struct FieldHandle<'a, T> {
    config: &'a mut Configuration,
    name: String,
    _kind: PhantomData<T>,
}

impl<T: FieldType> FieldHandle<'_, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Option<T> {
        self.config.get(&self.name)
    }

    pub fn set(&mut self, value: T) -> Result<(), FieldError> {
        self.config.set(&self.name, value)
    }
}

/// Plugins that expose a `Configuration`.
pub trait Configurable {
    /// `None` when the plugin has no configurable parameters.
    fn configuration(&self) -> Option<&Configuration>;
    fn configuration_mut(&mut self) -> Option<&mut Configuration>;
}

/// Typed field access for any `Configurable`, including trait objects.
pub trait FieldAccess: Configurable {
    fn field<T: FieldType>(&self, name: &str) -> Option<T> {
        self.configuration()?.get(name)
    }

    /// Handle to `name`, present only if the field exists with type `T`.
    fn field_mut<T: FieldType>(&mut self, name: &str) -> Option<FieldHandle<'_, T>> {
        let config = self.configuration_mut()?;
        if config.kind_of(name)? != T::KIND {
            log::debug!("field '{}' requested as {:?}; type differs", name, T::KIND);
            return None;
        }
        Some(FieldHandle {
            config,
            name: name.to_string(),
            _kind: PhantomData,
        })
    }

    fn set_field<T: FieldType>(&mut self, name: &str, value: T) -> Result<(), FieldError> {
        match self.configuration_mut() {
            Some(config) => config.set(name, value),
            None => Err(FieldError::Unknown(name.to_string())),
        }
    }
}

impl<C: Configurable + ?Sized> FieldAccess for C {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        Configuration::new()
            .declare("flip_vertical", FieldValue::Bool(false), FieldScope::PreOpen)
            .declare("mode", FieldValue::Int(0), FieldScope::Live)
            .declare("distance", FieldValue::Float(500.0), FieldScope::Live)
    }

    #[test]
    fn typed_get_after_set() {
        let mut cfg = sample();
        cfg.set("flip_vertical", true).unwrap();
        cfg.set("mode", 2i64).unwrap();
        cfg.set("distance", 120.5f64).unwrap();
        assert_eq!(cfg.get::<bool>("flip_vertical"), Some(true));
        assert_eq!(cfg.get::<i64>("mode"), Some(2));
        assert_eq!(cfg.get::<f64>("distance"), Some(120.5));
    }

    #[test]
    fn wrong_type_or_name_is_absent() {
        let mut cfg = sample();
        assert_eq!(cfg.get::<i64>("flip_vertical"), None);
        assert_eq!(cfg.get::<bool>("missing"), None);
        assert!(matches!(
            cfg.set("mode", 1.5f64),
            Err(FieldError::TypeMismatch { .. })
        ));
        assert_eq!(cfg.set("nope", true), Err(FieldError::Unknown("nope".into())));
        assert_eq!(cfg.get::<i64>("mode"), Some(0));
    }

    #[test]
    fn pre_open_fields_freeze() {
        let mut cfg = sample();
        cfg.freeze();
        assert_eq!(
            cfg.set("flip_vertical", true),
            Err(FieldError::Frozen("flip_vertical".into()))
        );
        assert_eq!(cfg.get::<bool>("flip_vertical"), Some(false));
        cfg.set("mode", 3i64).unwrap();
        assert_eq!(cfg.get::<i64>("mode"), Some(3));
    }

    #[test]
    fn payload_pairs_fold_into_fields() {
        let mut cfg = sample();
        cfg.set_payload("mode=1; distance=250;bogus=3;flip_vertical=maybe")
            .unwrap();
        assert_eq!(cfg.apply_payload_pairs(), 2);
        assert_eq!(cfg.get::<i64>("mode"), Some(1));
        assert_eq!(cfg.get::<f64>("distance"), Some(250.0));
        assert_eq!(cfg.get::<bool>("flip_vertical"), Some(false));
        assert_eq!(cfg.payload(), "mode=1; distance=250;bogus=3;flip_vertical=maybe");
    }
}
