//! Rate-limited operator reports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::delivery::Delivery;
use crate::ffmpeg::{tail_lines, ToolFailure};

pub const FAILURE_REPORT_WINDOW: Duration = Duration::from_secs(120);
const COMMAND_LIMIT: usize = 900;
const STDERR_LIMIT: usize = 2500;
const STDERR_TAIL_LINES: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Ffmpeg,
    Upload,
    Photo,
}

/// At most one report per kind per window.
#[derive(Debug)]
pub struct RateLimiter {
    windows: HashMap<ReportKind, Duration>,
    last: Mutex<HashMap<ReportKind, Instant>>,
}

impl RateLimiter {
    pub fn new(photo_window: Duration) -> Self {
        let mut windows = HashMap::new();
        windows.insert(ReportKind::Ffmpeg, FAILURE_REPORT_WINDOW);
        windows.insert(ReportKind::Upload, FAILURE_REPORT_WINDOW);
        windows.insert(ReportKind::Photo, photo_window);
        Self {
            windows,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, kind: ReportKind) -> bool {
        self.allow_at(kind, Instant::now())
    }

    /// Record an attempt at `now`; true if it falls outside the window.
    pub fn allow_at(&self, kind: ReportKind, now: Instant) -> bool {
        let window = self.windows.get(&kind).copied().unwrap_or_default();
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match last.get(&kind) {
            Some(prev) if now.saturating_duration_since(*prev) < window => false,
            _ => {
                last.insert(kind, now);
                true
            }
        }
    }
}

/// Sends reports through a delivery channel, dropping repeats inside the window.
pub struct Reporter<D> {
    delivery: D,
    limiter: RateLimiter,
}

impl<D: Delivery> Reporter<D> {
    pub fn new(delivery: D, limiter: RateLimiter) -> Self {
        Self { delivery, limiter }
    }

    pub fn delivery(&self) -> &D {
        &self.delivery
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Best effort: failures to report are logged only.
    pub fn report(&self, kind: ReportKind, text: &str) {
        if !self.limiter.allow(kind) {
            log::debug!("{:?} report suppressed by rate limit", kind);
            return;
        }
        if let Err(e) = self.delivery.send_text(text) {
            log::warn!("failed to deliver {:?} report: {:#}", kind, e);
        }
    }

    pub fn report_error(&self, kind: ReportKind, err: &anyhow::Error) {
        self.report(kind, &describe_error(kind, err));
    }
}

/// Operator-facing text for a failure.
pub fn describe_error(kind: ReportKind, err: &anyhow::Error) -> String {
    if let Some(failure) = err.chain().find_map(|e| e.downcast_ref::<ToolFailure>()) {
        return ffmpeg_report(failure);
    }
    let label = match kind {
        ReportKind::Ffmpeg => "ffmpeg",
        ReportKind::Upload => "upload",
        ReportKind::Photo => "photo",
    };
    truncate(&format!("{label} error: {err:#}"), STDERR_LIMIT)
}

pub fn ffmpeg_report(failure: &ToolFailure) -> String {
    let stderr = tail_lines(failure.stderr.trim(), STDERR_TAIL_LINES);
    format!(
        "ffmpeg failed ({})\nrc={}\ncmd: {}\nstderr:\n{}",
        failure.what,
        failure.code_label(),
        truncate(&failure.command, COMMAND_LIMIT),
        truncate(&stderr, STDERR_LIMIT)
    )
}

/// Cut `text` to at most `max` characters, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
