//! Shared directory contract between the Recorder and the Sender.
//!
//! All pipeline state lives in file names. This module owns the naming rules
//! and turns a directory listing into a [`DirSnapshot`] that can be queried
//! without touching the disk again:
//!
//! | name                        | meaning                                  |
//! |-----------------------------|------------------------------------------|
//! | `<ts>.mkv.part`             | recorder in-progress write               |
//! | `<ts>.mkv`                  | finalized raw segment                    |
//! | `<ts>.jpg`                  | transient preview                        |
//! | `<ts>.mp4.part`             | conversion in progress                   |
//! | `<ts>.mp4`                  | converted artifact                       |
//! | `<ts>_part<NNN>.mp4`        | split part                               |
//! | `<ts>_part<NNN>.mp4.sent`   | delivered part (same file, renamed)      |
//!
//! Nothing here caches state between calls: every query is answered from a
//! fresh listing, so the filesystem is the only source of truth.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const RAW_EXT: &str = ".mkv";
pub const RECORDING_EXT: &str = ".mkv.part";
pub const PREVIEW_EXT: &str = ".jpg";
pub const CONVERTED_EXT: &str = ".mp4";
pub const CONVERTING_EXT: &str = ".mp4.part";
pub const SENT_SUFFIX: &str = ".sent";
pub const PART_INFIX: &str = "_part";
pub const PART_INDEX_WIDTH: usize = 3;

const TIMESTAMP_FORMAT: &str = "%Y.%m.%d_%H.%M.%S";

/// Identity of a segment: its capture start time, formatted so that
/// lexicographic order equals chronological order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Accept a file stem as a segment identity.
    ///
    /// Stems containing the part infix are rejected so part names can always
    /// be split back into `(segment, index)` unambiguously.
    pub fn parse(stem: &str) -> Option<Self> {
        if stem.is_empty()
            || stem.contains(PART_INFIX)
            || stem.contains('/')
            || stem.contains('\\')
        {
            return None;
        }
        Some(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a single file name in the shared directory stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    Recording(SegmentId),
    Raw(SegmentId),
    Preview(SegmentId),
    Converting(SegmentId),
    Converted(SegmentId),
    Part {
        segment: SegmentId,
        index: u32,
        sent: bool,
    },
}

impl Artifact {
    pub fn segment(&self) -> &SegmentId {
        match self {
            Artifact::Recording(id)
            | Artifact::Raw(id)
            | Artifact::Preview(id)
            | Artifact::Converting(id)
            | Artifact::Converted(id) => id,
            Artifact::Part { segment, .. } => segment,
        }
    }
}

/// Classify a bare file name. Unknown names yield `None` and are ignored by
/// both components.
pub fn classify(file_name: &str) -> Option<Artifact> {
    if let Some(stem) = file_name.strip_suffix(RECORDING_EXT) {
        return SegmentId::parse(stem).map(Artifact::Recording);
    }
    if let Some(stem) = file_name.strip_suffix(RAW_EXT) {
        return SegmentId::parse(stem).map(Artifact::Raw);
    }
    if let Some(stem) = file_name.strip_suffix(PREVIEW_EXT) {
        return SegmentId::parse(stem).map(Artifact::Preview);
    }
    if let Some(stem) = file_name.strip_suffix(CONVERTING_EXT) {
        return SegmentId::parse(stem).map(Artifact::Converting);
    }
    if let Some(marked) = file_name.strip_suffix(SENT_SUFFIX) {
        let stem = marked.strip_suffix(CONVERTED_EXT)?;
        let (segment, index) = parse_part_stem(stem)?;
        return Some(Artifact::Part {
            segment,
            index,
            sent: true,
        });
    }
    if let Some(stem) = file_name.strip_suffix(CONVERTED_EXT) {
        if let Some((segment, index)) = parse_part_stem(stem) {
            return Some(Artifact::Part {
                segment,
                index,
                sent: false,
            });
        }
        return SegmentId::parse(stem).map(Artifact::Converted);
    }
    None
}

fn parse_part_stem(stem: &str) -> Option<(SegmentId, u32)> {
    let (base, digits) = stem.rsplit_once(PART_INFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;
    Some((SegmentId::parse(base)?, index))
}

/// Path builder for the shared directory.
#[derive(Clone, Debug)]
pub struct Layout {
    dir: PathBuf,
}

impl Layout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create video dir {}", self.dir.display()))
    }

    pub fn recording_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{RECORDING_EXT}"))
    }

    pub fn raw_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{RAW_EXT}"))
    }

    pub fn preview_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{PREVIEW_EXT}"))
    }

    pub fn converting_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{CONVERTING_EXT}"))
    }

    pub fn converted_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{CONVERTED_EXT}"))
    }

    pub fn part_path(&self, id: &SegmentId, index: u32) -> PathBuf {
        self.dir.join(format!(
            "{id}{PART_INFIX}{index:0width$}{CONVERTED_EXT}",
            width = PART_INDEX_WIDTH
        ))
    }

    pub fn sent_marker_path(&self, id: &SegmentId, index: u32) -> PathBuf {
        sent_marker_for(&self.part_path(id, index))
    }

    /// Output pattern handed to the splitter; expands to [`Layout::part_path`].
    pub fn split_pattern(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!(
            "{id}{PART_INFIX}%0{PART_INDEX_WIDTH}d{CONVERTED_EXT}"
        ))
    }

    /// Every existing path that belongs to `id`, whatever its state.
    pub fn artifacts_of(&self, id: &SegmentId) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for name in list_names(&self.dir)? {
            if let Some(artifact) = classify(&name) {
                if artifact.segment() == id {
                    paths.push(self.dir.join(name));
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

pub fn sent_marker_for(part: &Path) -> PathBuf {
    let mut name = part.as_os_str().to_os_string();
    name.push(SENT_SUFFIX);
    PathBuf::from(name)
}

fn list_names(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list video dir {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => log::debug!("skipping non-utf8 file name {:?}", raw),
        }
    }
    Ok(names)
}

/// Files present for one segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentFiles {
    pub recording: bool,
    pub raw: bool,
    pub preview: bool,
    pub converting: bool,
    pub converted: bool,
    /// Part index -> sent marker present.
    pub parts: BTreeMap<u32, bool>,
}

impl SegmentFiles {
    pub fn all_parts_sent(&self) -> bool {
        !self.parts.is_empty() && self.parts.values().all(|sent| *sent)
    }

    pub fn pending_parts(&self) -> impl Iterator<Item = u32> + '_ {
        self.parts
            .iter()
            .filter(|(_, sent)| !**sent)
            .map(|(index, _)| *index)
    }
}

/// Per-segment lifecycle state, derived purely from [`SegmentFiles`].
///
/// Splitting has no state of its own: parts are regenerated from the
/// convertible file for as long as it exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Recording,
    FinalizedRaw,
    Converting,
    FinalizedConvertible,
    PartsPending,
    PartsSent,
    Delivered,
}

impl SegmentState {
    pub fn derive(files: Option<&SegmentFiles>) -> Self {
        let Some(files) = files else {
            return SegmentState::Delivered;
        };
        if !files.parts.is_empty() {
            if files.all_parts_sent() {
                return SegmentState::PartsSent;
            }
            return SegmentState::PartsPending;
        }
        if files.converted {
            return SegmentState::FinalizedConvertible;
        }
        if files.converting && files.raw {
            return SegmentState::Converting;
        }
        if files.raw {
            return SegmentState::FinalizedRaw;
        }
        if files.recording {
            return SegmentState::Recording;
        }
        SegmentState::Delivered
    }
}

/// Counts used for operator status replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Backlog {
    pub recording: usize,
    pub raw: usize,
    pub converted: usize,
    pub parts_pending: usize,
    pub parts_sent: usize,
}

/// Immutable view of the shared directory at one instant.
#[derive(Clone, Debug, Default)]
pub struct DirSnapshot {
    segments: BTreeMap<SegmentId, SegmentFiles>,
}

impl DirSnapshot {
    pub fn scan(layout: &Layout) -> Result<Self> {
        Ok(Self::from_names(list_names(layout.dir())?))
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments: BTreeMap<SegmentId, SegmentFiles> = BTreeMap::new();
        for name in names {
            let Some(artifact) = classify(name.as_ref()) else {
                continue;
            };
            let files = segments.entry(artifact.segment().clone()).or_default();
            match artifact {
                Artifact::Recording(_) => files.recording = true,
                Artifact::Raw(_) => files.raw = true,
                Artifact::Preview(_) => files.preview = true,
                Artifact::Converting(_) => files.converting = true,
                Artifact::Converted(_) => files.converted = true,
                Artifact::Part { index, sent, .. } => {
                    let entry = files.parts.entry(index).or_insert(false);
                    *entry |= sent;
                }
            }
        }
        Self { segments }
    }

    pub fn files(&self, id: &SegmentId) -> Option<&SegmentFiles> {
        self.segments.get(id)
    }

    pub fn state(&self, id: &SegmentId) -> SegmentState {
        SegmentState::derive(self.files(id))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments with a recorder temp file left behind.
    pub fn recordings(&self) -> Vec<SegmentId> {
        self.select(|files| files.recording)
    }

    /// Segments still holding their raw source, oldest first.
    pub fn finalized_raw(&self) -> Vec<SegmentId> {
        self.select(|files| files.raw)
    }

    /// Converted artifacts whose raw source is gone.
    pub fn orphan_converted(&self) -> Vec<SegmentId> {
        self.select(|files| files.converted && !files.raw)
    }

    /// Part groups with neither a raw source nor a whole converted artifact.
    pub fn orphan_part_groups(&self) -> Vec<SegmentId> {
        self.select(|files| !files.parts.is_empty() && !files.converted && !files.raw)
    }

    pub fn backlog(&self) -> Backlog {
        let mut backlog = Backlog::default();
        for files in self.segments.values() {
            if files.recording {
                backlog.recording += 1;
            }
            if files.raw {
                backlog.raw += 1;
            }
            if files.converted {
                backlog.converted += 1;
            }
            for sent in files.parts.values() {
                if *sent {
                    backlog.parts_sent += 1;
                } else {
                    backlog.parts_pending += 1;
                }
            }
        }
        backlog
    }

    fn select(&self, keep: impl Fn(&SegmentFiles) -> bool) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|(_, files)| keep(files))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Strip the directory and extension from a path, for captions and logs.
pub fn display_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("path {} has no usable file stem", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(s: &str) -> SegmentId {
        SegmentId::parse(s).expect("segment id")
    }

    #[test]
    fn segment_id_formats_utc_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(SegmentId::from_datetime(at).as_str(), "2024.03.09_07.05.00");
    }

    #[test]
    fn classify_covers_every_contract_name() {
        let ts = "2024.03.09_07.05.00";
        assert_eq!(
            classify(&format!("{ts}.mkv.part")),
            Some(Artifact::Recording(id(ts)))
        );
        assert_eq!(classify(&format!("{ts}.mkv")), Some(Artifact::Raw(id(ts))));
        assert_eq!(classify(&format!("{ts}.jpg")), Some(Artifact::Preview(id(ts))));
        assert_eq!(
            classify(&format!("{ts}.mp4.part")),
            Some(Artifact::Converting(id(ts)))
        );
        assert_eq!(
            classify(&format!("{ts}.mp4")),
            Some(Artifact::Converted(id(ts)))
        );
        assert_eq!(
            classify(&format!("{ts}_part002.mp4")),
            Some(Artifact::Part {
                segment: id(ts),
                index: 2,
                sent: false
            })
        );
        assert_eq!(
            classify(&format!("{ts}_part002.mp4.sent")),
            Some(Artifact::Part {
                segment: id(ts),
                index: 2,
                sent: true
            })
        );
    }

    #[test]
    fn classify_ignores_foreign_names() {
        assert_eq!(classify("notes.txt"), None);
        assert_eq!(classify(".mkv"), None);
        assert_eq!(classify("a_partX.mp4"), None);
        assert_eq!(classify("a_part001.mkv"), None);
        assert_eq!(classify("a.mp4.sent"), None);
    }

    #[test]
    fn part_paths_are_zero_padded_and_match_pattern() {
        let layout = Layout::new("/videos");
        let seg = id("2024.03.09_07.05.00");
        assert_eq!(
            layout.part_path(&seg, 7),
            PathBuf::from("/videos/2024.03.09_07.05.00_part007.mp4")
        );
        assert_eq!(
            layout.sent_marker_path(&seg, 7),
            PathBuf::from("/videos/2024.03.09_07.05.00_part007.mp4.sent")
        );
        assert_eq!(
            layout.split_pattern(&seg),
            PathBuf::from("/videos/2024.03.09_07.05.00_part%03d.mp4")
        );
    }

    #[test]
    fn snapshot_orders_oldest_first() {
        let snap = DirSnapshot::from_names([
            "2024.03.09_08.00.00.mkv",
            "2024.03.09_07.55.00.mkv",
            "2024.03.09_08.05.00.mkv.part",
        ]);
        assert_eq!(
            snap.finalized_raw(),
            vec![id("2024.03.09_07.55.00"), id("2024.03.09_08.00.00")]
        );
        assert_eq!(snap.recordings(), vec![id("2024.03.09_08.05.00")]);
    }

    #[test]
    fn state_is_derived_from_files() {
        let snap = DirSnapshot::from_names([
            "a.mkv.part",
            "b.mkv",
            "c.mkv",
            "c.mp4.part",
            "d.mkv",
            "d.mp4",
            "e.mp4",
            "e_part000.mp4.sent",
            "e_part001.mp4",
            "f_part000.mp4.sent",
            "f_part001.mp4.sent",
        ]);
        assert_eq!(snap.state(&id("a")), SegmentState::Recording);
        assert_eq!(snap.state(&id("b")), SegmentState::FinalizedRaw);
        assert_eq!(snap.state(&id("c")), SegmentState::Converting);
        assert_eq!(snap.state(&id("d")), SegmentState::FinalizedConvertible);
        assert_eq!(snap.state(&id("e")), SegmentState::PartsPending);
        assert_eq!(snap.state(&id("f")), SegmentState::PartsSent);
        assert_eq!(snap.state(&id("zzz")), SegmentState::Delivered);
    }

    #[test]
    fn regenerated_part_next_to_marker_counts_as_sent() {
        let snap = DirSnapshot::from_names(["s_part000.mp4", "s_part000.mp4.sent"]);
        let files = snap.files(&id("s")).expect("files");
        assert!(files.all_parts_sent());
        assert_eq!(files.pending_parts().count(), 0);
    }

    #[test]
    fn orphan_queries_exclude_segments_with_raw_source() {
        let snap = DirSnapshot::from_names([
            "a.mkv",
            "a.mp4",
            "a_part000.mp4",
            "b.mp4",
            "b_part000.mp4",
            "c_part000.mp4.sent",
            "c_part001.mp4",
        ]);
        assert_eq!(snap.orphan_converted(), vec![id("b")]);
        assert_eq!(snap.orphan_part_groups(), vec![id("c")]);
    }

    #[test]
    fn backlog_counts_parts_by_marker() {
        let snap = DirSnapshot::from_names([
            "a.mkv",
            "b.mp4",
            "c_part000.mp4.sent",
            "c_part001.mp4",
            "c_part002.mp4",
        ]);
        let backlog = snap.backlog();
        assert_eq!(backlog.raw, 1);
        assert_eq!(backlog.converted, 1);
        assert_eq!(backlog.parts_sent, 1);
        assert_eq!(backlog.parts_pending, 2);
    }

    #[test]
    fn artifacts_of_lists_only_matching_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        for name in ["a.mkv", "a_part000.mp4.sent", "ab.mkv", "b.mp4"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        let paths = layout.artifacts_of(&id("a")).expect("list");
        assert_eq!(
            paths,
            vec![dir.path().join("a.mkv"), dir.path().join("a_part000.mp4.sent")]
        );
    }
}
