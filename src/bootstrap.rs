//! Application wiring.
//!
//! Loads the configured plugins, configures and opens the video source,
//! calibrates the tracker, attaches one stats collector to both producers,
//! registers the targets, builds the composed scene and starts streaming.
//! Missing plugins and unresolvable targets are fatal.

use anyhow::{anyhow, Context, Result};
use std::sync::{Mutex, MutexGuard};

use crate::compositor::{Compositor, CompositorSettings, OverlayGeometry};
use crate::config::PipelineConfig;
use crate::field::{FieldAccess, FieldError};
use crate::frame::FrameFormat;
use crate::pipeline::{FramePipeline, PoseFilter};
use crate::registry::CapabilityRegistry;
use crate::stats::StatsCollector;
use crate::tracker::TargetId;

/// A started pipeline and what bootstrap negotiated for it.
pub struct ArSession {
    pub pipeline: FramePipeline,
    pub targets: Vec<TargetId>,
    pub format: FrameFormat,
}

impl ArSession {
    /// Stop tracker and video. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Ok(mut tracker) = self.pipeline.tracker().lock() {
            tracker.stop();
        }
        if let Ok(mut video) = self.pipeline.video().lock() {
            video.stop();
        }
    }
}

pub fn bootstrap(cfg: &PipelineConfig, registry: &mut CapabilityRegistry) -> Result<ArSession> {
    bootstrap_with(cfg, registry, |_| {})
}

/// Like [`bootstrap`], calling `on_stage` as each stage begins.
pub fn bootstrap_with<F>(
    cfg: &PipelineConfig,
    registry: &mut CapabilityRegistry,
    mut on_stage: F,
) -> Result<ArSession>
where
    F: FnMut(&str),
{
    on_stage("load plugins");
    registry
        .load(&cfg.video.plugin)
        .context("could not initialize video plugin")?;
    registry
        .load(&cfg.tracker.plugin)
        .context("could not initialize tracker plugin")?;
    let video = registry
        .video(&cfg.video.plugin)
        .context("could not initialize video plugin")?;
    let tracker = registry
        .tracker(&cfg.tracker.plugin)
        .context("could not initialize tracker plugin")?;

    on_stage("open video");
    let format = {
        let mut video = lock(&video, "video")?;
        let name = video.name();
        match video.configuration_mut() {
            Some(config) => config
                .set_payload(cfg.video.config.clone())
                .context("video configuration rejected")?,
            None => log::warn!("{}: plugin takes no configuration", name),
        }
        optional_field(video.set_field("flip_vertical", cfg.video.flip_vertical))?;
        video
            .open()
            .with_context(|| format!("failed to open video '{}'", cfg.video.config))?
    };
    log::info!(
        "video format {}x{} {:?}",
        format.width,
        format.height,
        format.pixel_format
    );

    on_stage("configure tracker");
    let calibration = {
        let mut tracker = lock(&tracker, "tracker")?;
        if let Some(config) = tracker.configuration_mut() {
            config
                .set_payload(cfg.tracker.config.clone())
                .context("tracker configuration rejected")?;
        }
        let timeout = i64::try_from(cfg.tracker.timeout_ms)
            .map_err(|_| anyhow!("tracker timeout {} is too large", cfg.tracker.timeout_ms))?;
        optional_field(tracker.set_field("timeout_ms", timeout))?;
        let calibration = tracker.get_or_create_calibration();
        calibration
            .write()
            .map_err(|_| anyhow!("calibration lock poisoned"))?
            .load(&cfg.calibration)
            .with_context(|| format!("failed to load calibration '{}'", cfg.calibration))?;
        calibration
    };

    on_stage("attach stats");
    let stats = StatsCollector::new(&cfg.stats_name);
    lock(&tracker, "tracker")?.set_stats(stats.clone());
    lock(&video, "video")?.set_stats(stats.clone());
    lock(&tracker, "tracker")?.set_image(&video);

    on_stage("add targets");
    let mut targets = Vec::with_capacity(cfg.targets.len());
    {
        let mut tracker = lock(&tracker, "tracker")?;
        for spec in &cfg.targets {
            let id = tracker
                .add_target(spec)
                .with_context(|| format!("could not add target '{}'", spec))?;
            if let Some(target) = tracker.target_mut(id) {
                target.set_active(true);
            }
            targets.push(id);
        }
    }

    on_stage("build scene");
    let settings = CompositorSettings {
        background_order: cfg.overlay.background_order,
        overlay_order: cfg.overlay.overlay_order,
        ..CompositorSettings::default()
    };
    let mut compositor = Compositor::new(calibration, settings)?;
    compositor.fit_to_video(format)?;
    let mut pipeline = FramePipeline::new(video.clone(), tracker.clone(), compositor, stats);
    for id in &targets {
        pipeline.bind_overlay(
            *id,
            OverlayGeometry::Cube {
                size: cfg.overlay.cube_size,
            },
            cfg.overlay.smoothing.map(PoseFilter::new),
        )?;
    }

    on_stage("start");
    lock(&video, "video")?.start().context("failed to start video")?;
    lock(&tracker, "tracker")?
        .start()
        .context("failed to start tracker")?;

    Ok(ArSession {
        pipeline,
        targets,
        format,
    })
}

fn lock<'a, T: ?Sized>(handle: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    handle
        .lock()
        .map_err(|_| anyhow!("{} plugin lock poisoned", what))
}

// Plugins need not declare every optional field.
fn optional_field(result: Result<(), FieldError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(FieldError::Unknown(name)) => {
            log::debug!("plugin has no field '{}', skipped", name);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
