use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: &str, is_tty: bool) -> Self {
        let mode = match ui_flag {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Announce a setup step; the returned guard reports its duration on drop.
    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = if self.pretty() {
            let bar = spinner("{spinner} {msg}");
            bar.set_message(format!("{name}…"));
            Some(bar)
        } else {
            eprintln!("==> {}", name);
            None
        };
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
        }
    }

    /// A single status line that is rewritten while the stream runs.
    pub fn live(&self) -> LiveStatus {
        LiveStatus {
            spinner: self.pretty().then(|| spinner("{spinner} [{elapsed}] {msg}")),
            last_plain: None,
        }
    }
}

fn spinner(template: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style =
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub struct LiveStatus {
    spinner: Option<ProgressBar>,
    last_plain: Option<Instant>,
}

/// Plain-mode status lines are rate limited to one per interval.
const PLAIN_STATUS_INTERVAL: Duration = Duration::from_secs(5);

impl LiveStatus {
    pub fn update(&mut self, message: String) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(message);
            return;
        }
        let due = self
            .last_plain
            .map_or(true, |last| last.elapsed() >= PLAIN_STATUS_INTERVAL);
        if due {
            eprintln!("... {}", message);
            self.last_plain = Some(Instant::now());
        }
    }

    /// Print a line above the status without disturbing it.
    pub fn println(&self, line: &str) {
        match &self.spinner {
            Some(spinner) => spinner.println(line),
            None => eprintln!("{line}"),
        }
    }

    pub fn finish(self, message: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
