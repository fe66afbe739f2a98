//! ar_demo - run the AR pipeline headless and log per-frame timings
//!
//! Loads the dummy video and tracker plugins (or the ones named in the
//! configuration), tracks the configured targets and composes one frame per
//! tick until the frame limit or Ctrl-C. Stats reports are written to the log.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ar_pipeline::{bootstrap_with, CapabilityRegistry, PipelineConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frames to render (default: until Ctrl-C, or the replay length).
    #[arg(long)]
    frames: Option<u64>,
    /// Target frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// JSON configuration file.
    #[arg(long, env = "ARPIPE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Replay a marker visibility script (e.g. "1101") instead of the
    /// configured video; the tracker only reports visible markers.
    #[arg(long, value_name = "SCRIPT")]
    replay: Option<String>,
    /// Log the stats report every N frames (0 disables).
    #[arg(long, default_value_t = 30)]
    report_every: u64,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto)]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    let mut frame_limit = args.frames;
    if let Some(script) = &args.replay {
        let visible = ar_pipeline::video::replay::parse_script(script)
            .context("invalid replay script")?;
        cfg.video.plugin = ar_pipeline::video::replay::NAME.to_string();
        cfg.video.config = script.clone();
        cfg.tracker.config = "mode=1;".to_string();
        frame_limit = frame_limit.or(Some(visible.len() as u64));
    }

    let mut registry = CapabilityRegistry::with_builtins();
    let mut stages = ui.stages();
    let session = bootstrap_with(&cfg, &mut registry, |stage| stages.enter(stage));
    stages.finish(session.is_ok());
    let mut session = session?;
    log::info!(
        "running {} + {} with {} target(s) at {} fps",
        cfg.video.plugin,
        cfg.tracker.plugin,
        session.targets.len(),
        args.fps
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;

    let frame_budget = Duration::from_secs_f64(1.0 / f64::from(args.fps));
    let progress = ui.frames(frame_limit);
    let mut visible_frames = 0u64;
    while running.load(Ordering::SeqCst) {
        if frame_limit.is_some_and(|limit| session.pipeline.frames() >= limit) {
            break;
        }
        let started = Instant::now();
        let report = session.pipeline.tick();
        if !report.visible.is_empty() {
            visible_frames += 1;
        }
        if args.report_every > 0 && report.frame % args.report_every == 0 {
            if let Some(stats) = &report.stats {
                log::info!("{}", stats);
            }
        }
        progress.inc(1);
        progress.set_message(format!("{} overlay(s)", report.visible.len()));
        if let Some(rest) = frame_budget.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    progress.finish_and_clear();
    session.shutdown();

    let pipeline = &session.pipeline;
    log::info!(
        "rendered {} frames, overlay visible in {}, video errors {}, tracker errors {}",
        pipeline.frames(),
        visible_frames,
        pipeline.video_errors(),
        pipeline.tracker_errors()
    );
    Ok(())
}
