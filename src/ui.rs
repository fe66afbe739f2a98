use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Stderr progress for bootstrap stages and the frame loop.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        let pretty = is_tty
            && match mode {
                UiMode::Auto | UiMode::Pretty => true,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    /// Numbered log of bootstrap stages.
    pub fn stages(&self) -> StageLog {
        StageLog {
            pretty: self.pretty,
            entered: 0,
            current: None,
        }
    }

    /// Frame counter for the render loop. Hidden in plain mode, where the
    /// stats reports in the log show progress instead.
    pub fn frames(&self, total: Option<u64>) -> ProgressBar {
        if !self.pretty {
            return ProgressBar::hidden();
        }
        let (bar, template) = match total {
            Some(total) => (
                ProgressBar::new(total),
                "{bar:30} {pos}/{len} frames {msg}",
            ),
            None => (ProgressBar::new_spinner(), "{spinner} {pos} frames {msg}"),
        };
        bar.set_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar
    }
}

struct ActiveStage {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
}

/// Each stage runs until the next one is entered or the log is finished.
pub struct StageLog {
    pretty: bool,
    entered: usize,
    current: Option<ActiveStage>,
}

impl StageLog {
    pub fn enter(&mut self, name: &str) {
        self.close(true);
        self.entered += 1;
        let label = format!("[{}] {}", self.entered, name);
        let spinner = self.pretty.then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(label.clone());
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {}", label);
        }
        self.current = Some(ActiveStage {
            name: label,
            started: Instant::now(),
            spinner,
        });
    }

    /// Close the running stage, marking it failed unless `ok`.
    pub fn finish(mut self, ok: bool) {
        self.close(ok);
    }

    fn close(&mut self, ok: bool) {
        let Some(stage) = self.current.take() else {
            return;
        };
        let mark = if ok { "✔" } else { "✘" };
        let ms = stage.started.elapsed().as_secs_f64() * 1000.0;
        let message = format!("{} {} ({:.1} ms)", mark, stage.name, ms);
        match stage.spinner {
            Some(spinner) if ok => spinner.finish_with_message(message),
            Some(spinner) => spinner.abandon_with_message(message),
            None => eprintln!("{}", message),
        }
    }
}
