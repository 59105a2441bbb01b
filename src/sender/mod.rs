//! Sender: a state machine over the shared directory.
//!
//! Each pass lists the directory, drives every finalized raw segment
//! (oldest first) through preview, conversion, split, upload and cleanup,
//! and then runs the recovery sweeps for converted files and part groups
//! whose raw source is already gone. Every decision is re-derived from a
//! fresh listing, so a pass started after a crash at any step picks up
//! exactly where the previous process stopped.

pub mod media;
pub mod split;

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CourierConfig, DeliveryMode};
use crate::delivery::Delivery;
use crate::layout::{
    classify, display_stem, sent_marker_for, Artifact, DirSnapshot, Layout, SegmentFiles, SegmentId,
};
use crate::notify::{ReportKind, Reporter};

use self::media::MediaTools;
use self::split::{expected_parts, needs_split, part_duration, shrink_part_duration};

/// Seek used for previews when no trim is configured; skips a blank first frame.
const DEFAULT_PREVIEW_SEEK_SECS: f64 = 0.2;
const MAX_SPLIT_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Convert,
    Split,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Convert => "convert",
            Stage::Split => "split",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// A pipeline stage failed for one segment; the segment is retried next pass.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub segment: SegmentId,
    source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, segment: &SegmentId, source: anyhow::Error) -> Self {
        Self {
            stage,
            segment: segment.clone(),
            source,
        }
    }

    pub fn report_kind(&self) -> ReportKind {
        match self.stage {
            Stage::Upload => ReportKind::Upload,
            Stage::Convert | Stage::Split => ReportKind::Ffmpeg,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for segment {}: {:#}",
            self.stage, self.segment, self.source
        )
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

fn stage_err(stage: Stage, segment: &SegmentId) -> impl FnOnce(anyhow::Error) -> anyhow::Error + '_ {
    move |e| anyhow::Error::new(StageError::new(stage, segment, e))
}

#[derive(Clone, Debug)]
pub struct SenderSettings {
    pub mode: DeliveryMode,
    pub trim_start_secs: f64,
    /// Effective per-upload limit, safety margin already applied.
    pub part_limit_bytes: u64,
    pub preview_enabled: bool,
    pub poll_interval: Duration,
}

impl SenderSettings {
    pub fn from_config(cfg: &CourierConfig) -> Self {
        Self {
            mode: cfg.delivery.mode,
            trim_start_secs: cfg.delivery.trim_start_secs,
            part_limit_bytes: cfg.part_limit_bytes(),
            preview_enabled: cfg.delivery.preview_enabled,
            poll_interval: cfg.delivery.poll_interval,
        }
    }

    fn preview_seek_secs(&self) -> f64 {
        if self.trim_start_secs > 0.0 {
            self.trim_start_secs
        } else {
            DEFAULT_PREVIEW_SEEK_SECS
        }
    }
}

/// What one pass accomplished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub delivered: Vec<SegmentId>,
    pub failed: Vec<SegmentId>,
    pub uploads: usize,
}

/// How far a segment got within one pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    /// Every part confirmed; artifacts removed.
    Delivered { uploads: usize },
    /// Uploads succeeded but a marker could not be written; kept for next pass.
    Unconfirmed { uploads: usize },
}

pub struct Sender<M, D> {
    layout: Layout,
    media: M,
    reporter: Reporter<D>,
    settings: SenderSettings,
}

impl<M: MediaTools, D: Delivery> Sender<M, D> {
    pub fn new(layout: Layout, media: M, reporter: Reporter<D>, settings: SenderSettings) -> Self {
        Self {
            layout,
            media,
            reporter,
            settings,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn delivery(&self) -> &D {
        self.reporter.delivery()
    }

    /// Poll forever.
    pub fn run(&self) -> Result<()> {
        log::info!(
            "sender: polling {} every {}s (mode {:?}, part limit {} bytes)",
            self.layout.dir().display(),
            self.settings.poll_interval.as_secs(),
            self.settings.mode,
            self.settings.part_limit_bytes
        );
        loop {
            match self.run_once() {
                Ok(summary) if !summary.delivered.is_empty() || !summary.failed.is_empty() => {
                    log::info!(
                        "sender pass: delivered={} failed={} uploads={}",
                        summary.delivered.len(),
                        summary.failed.len(),
                        summary.uploads
                    );
                }
                Ok(_) => {}
                Err(e) => log::error!("sender pass failed: {:#}", e),
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    /// One discovery pass followed by both recovery sweeps.
    pub fn run_once(&self) -> Result<PassSummary> {
        self.layout.ensure()?;
        let mut summary = PassSummary::default();

        let snapshot = DirSnapshot::scan(&self.layout)?;
        for id in snapshot.finalized_raw() {
            let result = self.process_segment(&id);
            self.account(&mut summary, &id, result);
        }

        let snapshot = DirSnapshot::scan(&self.layout)?;
        for id in snapshot.orphan_converted() {
            log::info!("resuming converted segment {}", id);
            let converted = self.layout.converted_path(&id);
            let result = self.deliver_artifact(&id, &converted);
            self.account(&mut summary, &id, result);
        }

        let snapshot = DirSnapshot::scan(&self.layout)?;
        for id in snapshot.orphan_part_groups() {
            log::info!("resuming part group {}", id);
            let result = self.upload_parts(&id);
            self.account(&mut summary, &id, result);
        }

        Ok(summary)
    }

    fn account(&self, summary: &mut PassSummary, id: &SegmentId, result: Result<Outcome>) {
        match result {
            Ok(Outcome::Delivered { uploads }) => {
                summary.uploads += uploads;
                summary.delivered.push(id.clone());
            }
            Ok(Outcome::Unconfirmed { uploads }) => {
                summary.uploads += uploads;
            }
            Err(e) => {
                summary.failed.push(id.clone());
                self.handle_failure(&e);
            }
        }
    }

    fn handle_failure(&self, err: &anyhow::Error) {
        log::error!("{:#}", err);
        if let Some(stage) = err.downcast_ref::<StageError>() {
            self.reporter.report_error(stage.report_kind(), err);
        }
    }

    /// Drive one finalized raw segment as far as it will go this pass.
    fn process_segment(&self, id: &SegmentId) -> Result<Outcome> {
        let raw = self.layout.raw_path(id);
        let snapshot = DirSnapshot::scan(&self.layout)?;
        let resumed = snapshot
            .files(id)
            .map(|files| files.converted || !files.parts.is_empty())
            .unwrap_or(false);

        if self.settings.preview_enabled && !resumed {
            self.send_preview(id, &raw);
        }

        let Some(codec) = self.settings.mode.video_codec() else {
            return self.deliver_whole(id, &raw);
        };

        let converted = self.layout.converted_path(id);
        if converted.exists() {
            log::info!("{} already converted, skipping conversion", id);
        } else {
            self.convert(id, codec, &raw)?;
        }
        self.deliver_artifact(id, &converted)
    }

    /// Best effort: failures are logged and the preview file is always removed.
    fn send_preview(&self, id: &SegmentId, raw: &Path) {
        let preview = RemoveOnDrop(self.layout.preview_path(id));
        let result = (|| -> Result<()> {
            self.media
                .preview(raw, &preview.0, self.settings.preview_seek_secs())?;
            let bytes = std::fs::read(&preview.0)
                .with_context(|| format!("read preview {}", preview.0.display()))?;
            if bytes.is_empty() {
                return Err(anyhow!("preview {} is empty", preview.0.display()));
            }
            let filename = format!("{id}.jpg");
            self.delivery().send_image(&bytes, &filename, "")
        })();
        match result {
            Ok(()) => log::info!("sent preview for {}", id),
            Err(e) => log::warn!("preview for {} failed: {:#}", id, e),
        }
    }

    /// Convert into a temporary name and rename on success, so an existing
    /// `.mp4` is always a complete conversion.
    fn convert(&self, id: &SegmentId, codec: crate::ffmpeg::VideoCodec, raw: &Path) -> Result<()> {
        let tmp = self.layout.converting_path(id);
        let dest = self.layout.converted_path(id);
        remove_if_exists(&tmp);
        let converted = self
            .media
            .convert(codec, self.settings.trim_start_secs, raw, &tmp)
            .and_then(|()| {
                let size = std::fs::metadata(&tmp)
                    .with_context(|| format!("conversion produced no {}", tmp.display()))?
                    .len();
                if size == 0 {
                    return Err(anyhow!("conversion produced an empty {}", tmp.display()));
                }
                std::fs::rename(&tmp, &dest)
                    .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))
            });
        if let Err(e) = converted {
            remove_if_exists(&tmp);
            return Err(stage_err(Stage::Convert, id)(e));
        }
        log::info!("converted {} -> {}", raw.display(), dest.display());
        Ok(())
    }

    /// Deliver a converted artifact: whole if it fits, otherwise as parts.
    ///
    /// Once any part carries a sent marker the existing split is final: the
    /// parts are uploaded as they are, never regenerated, so marker indices
    /// keep referring to the same time ranges.
    fn deliver_artifact(&self, id: &SegmentId, artifact: &Path) -> Result<Outcome> {
        let snapshot = DirSnapshot::scan(&self.layout)?;
        if let Some(files) = snapshot.files(id).filter(|f| f.parts.values().any(|sent| *sent)) {
            if !parts_are_contiguous(files) {
                return Err(stage_err(Stage::Split, id)(anyhow!(
                    "part set for segment {} has gaps, refusing to resume",
                    id
                )));
            }
            log::info!("{} already partly sent, resuming existing parts", id);
            return self.upload_parts(id);
        }

        let size = std::fs::metadata(artifact)
            .with_context(|| format!("stat {}", artifact.display()))?
            .len();
        if !needs_split(size, self.settings.part_limit_bytes) {
            return self.deliver_whole(id, artifact);
        }

        let duration = match self.media.probe_duration(artifact) {
            Ok(secs) => Some(secs),
            Err(e) => {
                log::warn!("duration probe failed for {}: {:#}", artifact.display(), e);
                None
            }
        };
        let segment_secs = part_duration(duration, size, self.settings.part_limit_bytes);
        self.split_within_limit(id, artifact, size, segment_secs)
            .map_err(stage_err(Stage::Split, id))?;
        self.upload_parts(id)
    }

    /// Split until every part fits the limit, shrinking the part duration
    /// after an oversized result. Leaves no parts behind on failure.
    fn split_within_limit(
        &self,
        id: &SegmentId,
        artifact: &Path,
        size: u64,
        mut segment_secs: f64,
    ) -> Result<()> {
        let limit = self.settings.part_limit_bytes;
        for attempt in 1..=MAX_SPLIT_ATTEMPTS {
            self.remove_parts(id)?;
            log::info!(
                "splitting {} ({} bytes) into ~{:.1}s parts (about {} parts, attempt {}/{})",
                artifact.display(),
                size,
                segment_secs,
                expected_parts(size, limit),
                attempt,
                MAX_SPLIT_ATTEMPTS
            );
            if let Err(e) = self
                .media
                .split(artifact, &self.layout.split_pattern(id), segment_secs)
            {
                self.discard_parts(id);
                return Err(e);
            }
            let largest = match self.largest_part(id) {
                Ok(Some(largest)) => largest,
                Ok(None) => bail!("splitter produced no parts for {}", artifact.display()),
                Err(e) => {
                    self.discard_parts(id);
                    return Err(e);
                }
            };
            if largest <= limit {
                return Ok(());
            }
            log::warn!(
                "largest part of {} is {} bytes, over the {} byte limit",
                id,
                largest,
                limit
            );
            segment_secs = shrink_part_duration(segment_secs, largest, limit);
        }
        self.discard_parts(id);
        bail!(
            "parts of {} still exceed {} bytes after {} split attempts",
            artifact.display(),
            limit,
            MAX_SPLIT_ATTEMPTS
        )
    }

    fn largest_part(&self, id: &SegmentId) -> Result<Option<u64>> {
        let snapshot = DirSnapshot::scan(&self.layout)?;
        let Some(files) = snapshot.files(id) else {
            return Ok(None);
        };
        let mut largest = None;
        for index in files.parts.keys() {
            let part = self.layout.part_path(id, *index);
            let len = std::fs::metadata(&part)
                .with_context(|| format!("stat {}", part.display()))?
                .len();
            largest = Some(largest.map_or(len, |l: u64| l.max(len)));
        }
        Ok(largest)
    }

    /// Remove unsent parts of a split that has not started uploading.
    fn remove_parts(&self, id: &SegmentId) -> Result<()> {
        for path in self.layout.artifacts_of(id)? {
            let is_unsent_part = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(classify)
                .map(|a| matches!(a, Artifact::Part { sent: false, .. }))
                .unwrap_or(false);
            if is_unsent_part {
                std::fs::remove_file(&path)
                    .with_context(|| format!("remove stale part {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn discard_parts(&self, id: &SegmentId) {
        if let Err(e) = self.remove_parts(id) {
            log::error!("failed to discard parts of {}: {:#}", id, e);
        }
    }

    /// Single upload of the whole artifact; no marker, cleanup follows at once.
    fn deliver_whole(&self, id: &SegmentId, artifact: &Path) -> Result<Outcome> {
        let caption = display_stem(artifact)?;
        log::info!("sending {}", artifact.display());
        self.delivery()
            .send_video(artifact, &caption)
            .map_err(stage_err(Stage::Upload, id))?;
        self.cleanup(id);
        Ok(Outcome::Delivered { uploads: 1 })
    }

    /// Upload every unmarked part in index order, then clean up if all are marked.
    fn upload_parts(&self, id: &SegmentId) -> Result<Outcome> {
        let snapshot = DirSnapshot::scan(&self.layout)?;
        let pending: Vec<u32> = match snapshot.files(id) {
            Some(files) if !files.parts.is_empty() => files.pending_parts().collect(),
            _ => {
                return Err(stage_err(Stage::Split, id)(anyhow!(
                    "no parts found for segment {}",
                    id
                )))
            }
        };

        let mut uploads = 0;
        for index in pending {
            let part = self.layout.part_path(id, index);
            let caption = display_stem(&part)?;
            self.delivery()
                .send_video(&part, &caption)
                .map_err(stage_err(Stage::Upload, id))?;
            uploads += 1;
            let marker = sent_marker_for(&part);
            match std::fs::rename(&part, &marker) {
                Ok(()) => log::info!("part sent: {}", marker.display()),
                Err(e) => log::error!("failed to mark {} as sent: {}", part.display(), e),
            }
        }

        let confirmed = DirSnapshot::scan(&self.layout)?
            .files(id)
            .map(|files| files.all_parts_sent())
            .unwrap_or(false);
        if !confirmed {
            log::warn!("segment {} has unconfirmed parts, keeping its files", id);
            return Ok(Outcome::Unconfirmed { uploads });
        }
        self.cleanup(id);
        Ok(Outcome::Delivered { uploads })
    }

    /// Remove every artifact of a delivered segment. The raw source goes
    /// first so an interrupted cleanup resumes via the recovery sweeps.
    fn cleanup(&self, id: &SegmentId) {
        let paths = match self.layout.artifacts_of(id) {
            Ok(paths) => paths,
            Err(e) => {
                log::error!("cleanup listing for {} failed: {:#}", id, e);
                return;
            }
        };
        let mut ordered: Vec<(u8, PathBuf)> = paths
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let rank = match classify(name)? {
                    Artifact::Recording(_) => return None,
                    Artifact::Raw(_) => 0,
                    Artifact::Converted(_) => 1,
                    _ => 2,
                };
                Some((rank, path))
            })
            .collect();
        ordered.sort();
        for (_, path) in ordered {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::error!("failed to remove {}: {}", path.display(), e),
            }
        }
        log::info!("segment {} delivered", id);
    }
}

/// A finished split numbers its parts `0..n` with no gaps.
fn parts_are_contiguous(files: &SegmentFiles) -> bool {
    files
        .parts
        .keys()
        .enumerate()
        .all(|(position, index)| *index as usize == position)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {}: {}", path.display(), e),
    }
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        remove_if_exists(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_route_to_report_kinds() {
        let id = SegmentId::parse("a").expect("id");
        let upload = StageError::new(Stage::Upload, &id, anyhow!("reset"));
        let split = StageError::new(Stage::Split, &id, anyhow!("bad"));
        assert_eq!(upload.report_kind(), ReportKind::Upload);
        assert_eq!(split.report_kind(), ReportKind::Ffmpeg);
        assert_eq!(upload.to_string(), "upload failed for segment a: reset");
    }

    #[test]
    fn preview_seek_prefers_trim() {
        let mut settings = SenderSettings {
            mode: DeliveryMode::Remux,
            trim_start_secs: 0.0,
            part_limit_bytes: 1,
            preview_enabled: true,
            poll_interval: Duration::from_secs(10),
        };
        assert_eq!(settings.preview_seek_secs(), 0.2);
        settings.trim_start_secs = 2.5;
        assert_eq!(settings.preview_seek_secs(), 2.5);
    }
}
