use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMode {
    Auto,
    Plain,
    Pretty,
}

impl ProgressMode {
    pub fn from_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => ProgressMode::Plain,
            "pretty" => ProgressMode::Pretty,
            _ => ProgressMode::Auto,
        }
    }
}

/// How upload progress is surfaced.
#[derive(Clone, Debug)]
pub struct ProgressSettings {
    mode: ProgressMode,
    is_tty: bool,
    enabled: bool,
    interval: Duration,
}

impl ProgressSettings {
    pub fn new(mode: ProgressMode, is_tty: bool, enabled: bool, interval: Duration) -> Self {
        Self {
            mode,
            is_tty,
            enabled,
            interval,
        }
    }

    pub fn detect(flag: &str, enabled: bool, interval: Duration) -> Self {
        Self::new(
            ProgressMode::from_flag(flag),
            std::io::stderr().is_terminal(),
            enabled,
            interval,
        )
    }

    pub fn disabled() -> Self {
        Self::new(ProgressMode::Plain, false, false, Duration::from_secs(2))
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                ProgressMode::Pretty | ProgressMode::Auto => true,
                ProgressMode::Plain => false,
            }
    }

    pub fn start(&self, name: &str, total: u64) -> UploadProgress {
        if !self.enabled {
            return UploadProgress::new(name, total, self.interval, None, false);
        }
        if self.use_pretty() {
            let bar = ProgressBar::new(total);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_message(name.to_string());
            UploadProgress::new(name, total, self.interval, Some(bar), true)
        } else {
            UploadProgress::new(name, total, self.interval, None, true)
        }
    }
}

/// Progress of one upload. Reports at most once per interval, plus once on finish.
pub struct UploadProgress {
    name: String,
    total: u64,
    sent: u64,
    interval: Duration,
    start: Instant,
    last_report: Instant,
    bar: Option<ProgressBar>,
    enabled: bool,
    finished: bool,
}

impl UploadProgress {
    fn new(
        name: &str,
        total: u64,
        interval: Duration,
        bar: Option<ProgressBar>,
        enabled: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_string(),
            total,
            sent: 0,
            interval,
            start: now,
            last_report: now,
            bar,
            enabled,
            finished: false,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn advance(&mut self, bytes: u64) {
        self.sent = self.sent.saturating_add(bytes);
        if !self.enabled {
            return;
        }
        if let Some(bar) = &self.bar {
            bar.set_position(self.sent);
            return;
        }
        if self.last_report.elapsed() >= self.interval {
            self.last_report = Instant::now();
            log::info!("{}", self.status_line());
        }
    }

    fn status_line(&self) -> String {
        format!(
            "upload {}: {} / {} ({:.0}%)",
            self.name,
            HumanBytes(self.sent),
            HumanBytes(self.total),
            percent(self.sent, self.total)
        )
    }

    pub fn finish(&mut self) {
        if self.finished || !self.enabled {
            return;
        }
        self.finished = true;
        let message = format!(
            "upload {} done: {} in {}",
            self.name,
            HumanBytes(self.sent),
            HumanDuration(self.start.elapsed())
        );
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message);
        } else {
            log::info!("{}", message);
        }
    }
}

impl Drop for UploadProgress {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            if !self.finished {
                bar.abandon();
            }
        }
    }
}

fn percent(sent: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    sent as f64 * 100.0 / total as f64
}
