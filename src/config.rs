use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::tracker::TargetSpec;

const DEFAULT_VIDEO_PLUGIN: &str = "dummyvideo";
const DEFAULT_VIDEO_CONFIG: &str = "stub://dummyvideo";
const DEFAULT_TRACKER_PLUGIN: &str = "dummytracker";
const DEFAULT_TRACKER_CONFIG: &str = "mode=0;";
const DEFAULT_TARGET: &str = "single;data/patt.hiro;80;0;0";
const DEFAULT_TIMEOUT_MS: u64 = 50;
const DEFAULT_CUBE_SIZE: f64 = 8.0;
const DEFAULT_STATS_NAME: &str = "ar timings";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    video: Option<VideoConfigFile>,
    tracker: Option<TrackerConfigFile>,
    calibration: Option<String>,
    targets: Option<Vec<String>>,
    overlay: Option<OverlayConfigFile>,
    stats_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    plugin: Option<String>,
    config: Option<String>,
    flip_vertical: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    plugin: Option<String>,
    config: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    background_order: Option<i32>,
    overlay_order: Option<i32>,
    cube_size: Option<f64>,
    smoothing: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub video: VideoSettings,
    pub tracker: TrackerSettings,
    /// Calibration source; empty selects the default intrinsics.
    pub calibration: String,
    pub targets: Vec<String>,
    pub overlay: OverlaySettings,
    pub stats_name: String,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub plugin: String,
    /// Payload handed to the plugin before `open`.
    pub config: String,
    pub flip_vertical: bool,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub plugin: String,
    pub config: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub background_order: i32,
    pub overlay_order: i32,
    pub cube_size: f64,
    /// Pose smoothing weight in `(0, 1]`; `None` disables the filter.
    pub smoothing: Option<f64>,
}

impl PipelineConfig {
    /// Load from the file named by `ARPIPE_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ARPIPE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let video = file.video.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let overlay = file.overlay.unwrap_or_default();
        Self {
            video: VideoSettings {
                plugin: video
                    .plugin
                    .unwrap_or_else(|| DEFAULT_VIDEO_PLUGIN.to_string()),
                config: video
                    .config
                    .unwrap_or_else(|| DEFAULT_VIDEO_CONFIG.to_string()),
                flip_vertical: video.flip_vertical.unwrap_or(true),
            },
            tracker: TrackerSettings {
                plugin: tracker
                    .plugin
                    .unwrap_or_else(|| DEFAULT_TRACKER_PLUGIN.to_string()),
                config: tracker
                    .config
                    .unwrap_or_else(|| DEFAULT_TRACKER_CONFIG.to_string()),
                timeout_ms: tracker.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            },
            calibration: file.calibration.unwrap_or_default(),
            targets: file
                .targets
                .unwrap_or_else(|| vec![DEFAULT_TARGET.to_string()]),
            overlay: OverlaySettings {
                background_order: overlay
                    .background_order
                    .unwrap_or(crate::compositor::BACKGROUND_ORDER),
                overlay_order: overlay
                    .overlay_order
                    .unwrap_or(crate::compositor::OVERLAY_ORDER),
                cube_size: overlay.cube_size.unwrap_or(DEFAULT_CUBE_SIZE),
                smoothing: overlay.smoothing,
            },
            stats_name: file
                .stats_name
                .unwrap_or_else(|| DEFAULT_STATS_NAME.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(plugin) = std::env::var("ARPIPE_VIDEO") {
            if !plugin.trim().is_empty() {
                self.video.plugin = plugin.trim().to_string();
            }
        }
        // An empty payload is meaningful (synthetic frames), so it is taken as is.
        if let Ok(config) = std::env::var("ARPIPE_VIDEO_CONFIG") {
            self.video.config = config;
        }
        if let Ok(plugin) = std::env::var("ARPIPE_TRACKER") {
            if !plugin.trim().is_empty() {
                self.tracker.plugin = plugin.trim().to_string();
            }
        }
        if let Ok(config) = std::env::var("ARPIPE_TRACKER_CONFIG") {
            self.tracker.config = config;
        }
        if let Ok(calibration) = std::env::var("ARPIPE_CALIBRATION") {
            self.calibration = calibration.trim().to_string();
        }
        if let Ok(targets) = std::env::var("ARPIPE_TARGETS") {
            let parsed = split_csv(&targets);
            if !parsed.is_empty() {
                self.targets = parsed;
            }
        }
        if let Ok(flip) = std::env::var("ARPIPE_FLIP_VERTICAL") {
            self.video.flip_vertical = parse_bool(&flip)
                .ok_or_else(|| anyhow!("ARPIPE_FLIP_VERTICAL must be true/false or 1/0"))?;
        }
        if let Ok(timeout) = std::env::var("ARPIPE_TIMEOUT_MS") {
            self.tracker.timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|_| anyhow!("ARPIPE_TIMEOUT_MS must be an integer number of milliseconds"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.video.plugin.is_empty() {
            return Err(anyhow!("video plugin name must not be empty"));
        }
        if self.tracker.plugin.is_empty() {
            return Err(anyhow!("tracker plugin name must not be empty"));
        }
        if self.tracker.timeout_ms == 0 {
            return Err(anyhow!("tracker timeout must be greater than zero"));
        }
        if self.targets.is_empty() {
            return Err(anyhow!("at least one target is required"));
        }
        for spec in &self.targets {
            TargetSpec::parse(spec).with_context(|| format!("invalid target '{}'", spec))?;
        }
        if self.overlay.background_order >= self.overlay.overlay_order {
            return Err(anyhow!(
                "background order {} must be below overlay order {}",
                self.overlay.background_order,
                self.overlay.overlay_order
            ));
        }
        if !(self.overlay.cube_size.is_finite() && self.overlay.cube_size > 0.0) {
            return Err(anyhow!("overlay cube size must be a positive number"));
        }
        if let Some(alpha) = self.overlay.smoothing {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(anyhow!("overlay smoothing must be in (0, 1]"));
            }
        }
        self.stats_name = self.stats_name.trim().to_string();
        if self.stats_name.is_empty() {
            self.stats_name = DEFAULT_STATS_NAME.to_string();
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

// Target specifications use ';' internally, so ',' separates them.
fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_bundled_demo() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.video.plugin, "dummyvideo");
        assert!(cfg.video.flip_vertical);
        assert_eq!(cfg.tracker.config, "mode=0;");
        assert_eq!(cfg.targets, vec![DEFAULT_TARGET]);
        assert_eq!(cfg.overlay.overlay_order, 100);
        assert!(cfg.overlay.smoothing.is_none());
    }

    #[test]
    fn validation_rejects_inverted_orders() {
        let mut cfg = PipelineConfig::default();
        cfg.overlay.background_order = 200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_target() {
        let mut cfg = PipelineConfig::default();
        cfg.targets = vec!["single;;".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("invalid target"));
    }

    #[test]
    fn bool_forms() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
