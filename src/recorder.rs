//! Recorder: owns the capture subprocess and the `.mkv.part` -> `.mkv`
//! finalisation rename.
//!
//! A capture always writes to the in-progress name. Only a clean exit is
//! renamed to the finalized name; a failed or timed-out capture has its
//! partial output deleted, so the Sender never sees a corrupt file.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::AlertSignal;
use crate::config::{CaptureMode, RecordingSettings};
use crate::ffmpeg::capture_command;
use crate::layout::{DirSnapshot, Layout, SegmentId};

const UNSET_SOURCE_WAIT: Duration = Duration::from_secs(5);
const UNSET_SOURCE_WARN_EVERY: Duration = Duration::from_secs(60);
const ALERT_WAIT_SLICE: Duration = Duration::from_secs(60);

/// Something that can write `duration` of camera video to `dest`.
pub trait Capture {
    fn capture(&self, duration: Duration, dest: &Path) -> Result<()>;
}

/// ffmpeg stream copy from an RTSP source.
#[derive(Clone, Debug)]
pub struct FfmpegCapture {
    loglevel: String,
    url: String,
    grace: Duration,
}

impl FfmpegCapture {
    pub fn new(loglevel: &str, url: &str, grace: Duration) -> Self {
        Self {
            loglevel: loglevel.to_string(),
            url: url.to_string(),
            grace,
        }
    }
}

impl Capture for FfmpegCapture {
    fn capture(&self, duration: Duration, dest: &Path) -> Result<()> {
        let secs = duration.as_secs().max(1);
        capture_command(&self.loglevel, &self.url, secs, dest)
            .run_checked("capture", Some(Duration::from_secs(secs) + self.grace))?;
        Ok(())
    }
}

/// Length of the capture that ends on the next multiple of `width` since
/// the epoch, never shorter than one second.
pub fn duration_until_boundary(now: DateTime<Utc>, width: Duration) -> Duration {
    let width_secs = width.as_secs().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let next_boundary_ms = (now.timestamp().div_euclid(width_secs) + 1) * width_secs * 1000;
    let secs = (next_boundary_ms - now_ms) / 1000;
    Duration::from_secs(secs.max(1) as u64)
}

pub struct Recorder<C> {
    layout: Layout,
    capture: C,
    settings: RecordingSettings,
    signal: Arc<AlertSignal>,
}

impl<C: Capture> Recorder<C> {
    pub fn new(
        layout: Layout,
        capture: C,
        settings: RecordingSettings,
        signal: Arc<AlertSignal>,
    ) -> Self {
        Self {
            layout,
            capture,
            settings,
            signal,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Finalize in-progress files left behind by an unclean shutdown.
    /// Returns how many were renamed.
    pub fn recover_in_progress(&self) -> Result<usize> {
        self.layout.ensure()?;
        let snapshot = DirSnapshot::scan(&self.layout)?;
        let mut renamed = 0;
        for id in snapshot.recordings() {
            let from = self.layout.recording_path(&id);
            let to = self.layout.raw_path(&id);
            if to.exists() {
                log::warn!(
                    "leftover {} not finalized: {} already exists",
                    from.display(),
                    to.display()
                );
                continue;
            }
            match std::fs::rename(&from, &to) {
                Ok(()) => {
                    log::info!("finalized leftover recording {}", to.display());
                    renamed += 1;
                }
                Err(e) => log::error!("failed to finalize {}: {}", from.display(), e),
            }
        }
        Ok(renamed)
    }

    /// Capture one segment starting at `at`, returning its identity once the
    /// finalized file exists.
    pub fn record_at(&self, at: DateTime<Utc>, duration: Duration) -> Result<SegmentId> {
        self.layout.ensure()?;
        let id = SegmentId::from_datetime(at);
        let recording = self.layout.recording_path(&id);
        let raw = self.layout.raw_path(&id);
        if recording.exists() || raw.exists() {
            bail!("segment {} already exists, refusing to overwrite", id);
        }

        log::info!("recording {} for {}s", id, duration.as_secs());
        if let Err(e) = self.capture.capture(duration, &recording) {
            discard_partial(&recording);
            return Err(e.context(format!("capture of segment {} failed", id)));
        }

        let size = std::fs::metadata(&recording)
            .map(|m| m.len())
            .map_err(|_| anyhow!("capture of segment {} produced no file", id))?;
        if size == 0 {
            discard_partial(&recording);
            bail!("capture of segment {} produced an empty file", id);
        }

        std::fs::rename(&recording, &raw)
            .with_context(|| format!("failed to finalize {}", recording.display()))?;
        log::info!("recording saved: {}", raw.display());
        Ok(id)
    }

    pub fn record(&self, duration: Duration) -> Result<SegmentId> {
        self.record_at(Utc::now(), duration)
    }

    /// Wait up to `wait` for an alert; on one, capture `alert_duration`.
    pub fn next_alert_capture(&self, wait: Duration) -> Result<Option<SegmentId>> {
        if !self.signal.wait_and_clear_timeout(wait) {
            return Ok(None);
        }
        log::info!("alert received, starting capture");
        self.record(self.settings.alert_duration).map(Some)
    }

    /// One grid-aligned continuous segment starting at `now`.
    pub fn continuous_step(&self, now: DateTime<Utc>) -> Result<SegmentId> {
        let duration = duration_until_boundary(now, self.settings.segment_width);
        self.record_at(now, duration)
    }

    /// Recover leftovers, then record forever in the configured mode.
    pub fn run(&self) -> Result<()> {
        match self.recover_in_progress() {
            Ok(0) => {}
            Ok(n) => log::info!("recovered {} leftover recording(s)", n),
            Err(e) => log::error!("leftover recovery failed: {:#}", e),
        }
        let mut source = SourceGate::default();
        match self.settings.mode {
            CaptureMode::AlertOnly => {
                log::info!(
                    "recorder: alert-only mode, {}s per alert",
                    self.settings.alert_duration.as_secs()
                );
                loop {
                    if !source.ready(&self.settings.rtsp_url) {
                        std::thread::sleep(UNSET_SOURCE_WAIT);
                        continue;
                    }
                    if let Err(e) = self.next_alert_capture(ALERT_WAIT_SLICE) {
                        log::error!("{:#}", e);
                        std::thread::sleep(self.settings.capture_backoff);
                    }
                }
            }
            CaptureMode::Continuous => {
                log::info!(
                    "recorder: continuous mode, {}s grid",
                    self.settings.segment_width.as_secs()
                );
                loop {
                    if !source.ready(&self.settings.rtsp_url) {
                        std::thread::sleep(UNSET_SOURCE_WAIT);
                        continue;
                    }
                    if let Err(e) = self.continuous_step(Utc::now()) {
                        log::error!("{:#}", e);
                        std::thread::sleep(self.settings.capture_backoff);
                    }
                }
            }
        }
    }
}

fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::warn!("discarded partial recording {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("failed to remove {}: {}", path.display(), e),
    }
}

/// Warns, at most once a minute, while no capture source is configured.
#[derive(Default)]
struct SourceGate {
    last_warn: Option<Instant>,
}

impl SourceGate {
    fn ready(&mut self, url: &str) -> bool {
        if !url.is_empty() {
            return true;
        }
        let due = self
            .last_warn
            .map(|at| at.elapsed() > UNSET_SOURCE_WARN_EVERY)
            .unwrap_or(true);
        if due {
            log::warn!("RTSP_URL is empty, recording is paused");
            self.last_warn = Some(Instant::now());
        }
        false
    }
}
