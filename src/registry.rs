use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::tracker::{self, DummyTracker, SharedTracker};
use crate::video::{self, DummyVideo, ReplayVideo, SharedVideoSource};

/// Capability roles a plugin can fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Video,
    Tracker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Video => "video",
            Role::Tracker => "tracker",
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("plugin '{0}' is not registered")]
    NotFound(String),
    #[error("plugin '{name}' does not provide a {role} capability")]
    CapabilityUnavailable { name: String, role: Role },
}

/// A loaded plugin, tagged with the roles it implements.
#[derive(Clone)]
pub struct PluginInstance {
    name: String,
    video: Option<SharedVideoSource>,
    tracker: Option<SharedTracker>,
}

impl PluginInstance {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            video: None,
            tracker: None,
        }
    }

    pub fn with_video(mut self, source: SharedVideoSource) -> Self {
        self.video = Some(source);
        self
    }

    pub fn with_tracker(mut self, tracker: SharedTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_video(&self) -> Option<SharedVideoSource> {
        self.video.clone()
    }

    pub fn as_tracker(&self) -> Option<SharedTracker> {
        self.tracker.clone()
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.video.is_some() {
            roles.push(Role::Video);
        }
        if self.tracker.is_some() {
            roles.push(Role::Tracker);
        }
        roles
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("roles", &self.roles())
            .finish()
    }
}

pub type PluginFactory = Box<dyn Fn() -> PluginInstance + Send + Sync>;

/// Compiled-in plugin registry.
///
/// Factories are registered by name; `load` instantiates a plugin once and
/// keeps it until `unload`. Lookups never panic: absence and wrong roles are
/// reported as errors and the caller decides whether they are fatal.
pub struct CapabilityRegistry {
    factories: BTreeMap<String, PluginFactory>,
    loaded: BTreeMap<String, PluginInstance>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            loaded: BTreeMap::new(),
        }
    }

    /// Registry with the bundled plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(video::dummy::NAME, || {
            PluginInstance::new(video::dummy::NAME).with_video(video::shared(DummyVideo::new()))
        });
        registry.register(video::replay::NAME, || {
            PluginInstance::new(video::replay::NAME).with_video(video::shared(ReplayVideo::new()))
        });
        registry.register(tracker::marker::DUMMY_NAME, || {
            PluginInstance::new(tracker::marker::DUMMY_NAME)
                .with_tracker(tracker::shared(DummyTracker::dummy()))
        });
        registry
    }

    /// Register a factory. Replaces any factory of the same name; already
    /// loaded instances are unaffected.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> PluginInstance + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate `name`. Loading a loaded plugin is a no-op.
    pub fn load(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.loaded.contains_key(name) {
            log::debug!("plugin '{}' already loaded", name);
            return Ok(());
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let instance = factory();
        log::info!("loaded plugin '{}' ({:?})", name, instance.roles());
        self.loaded.insert(name.to_string(), instance);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PluginInstance> {
        self.loaded.get(name).cloned()
    }

    pub fn video(&self, name: &str) -> Result<SharedVideoSource, RegistryError> {
        self.get(name)
            .and_then(|p| p.as_video())
            .ok_or_else(|| RegistryError::CapabilityUnavailable {
                name: name.to_string(),
                role: Role::Video,
            })
    }

    pub fn tracker(&self, name: &str) -> Result<SharedTracker, RegistryError> {
        self.get(name)
            .and_then(|p| p.as_tracker())
            .ok_or_else(|| RegistryError::CapabilityUnavailable {
                name: name.to_string(),
                role: Role::Tracker,
            })
    }

    /// Drop the registry's instance. Handles already given out stay valid.
    pub fn unload(&mut self, name: &str) -> bool {
        self.loaded.remove(name).is_some()
    }

    /// Names of loaded plugins, sorted.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
