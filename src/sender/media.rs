//! Media operations the Sender needs, behind a trait so the state machine
//! can run without ffmpeg.

use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

use crate::ffmpeg::{
    convert_command, parse_probe_duration, preview_command, probe_duration_command,
    split_command, VideoCodec,
};

pub const PREVIEW_MAX_WIDTH: u32 = 960;
pub const PREVIEW_QUALITY: u8 = 6;
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub trait MediaTools {
    /// Write one representative frame of `src` to `dest`.
    fn preview(&self, src: &Path, dest: &Path, seek_secs: f64) -> Result<()>;

    /// Write the deliverable form of `src` to `dest`.
    fn convert(&self, codec: VideoCodec, trim_start_secs: f64, src: &Path, dest: &Path)
        -> Result<()>;

    fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Cut `src` into parts named by `pattern` (printf-style index).
    fn split(&self, src: &Path, pattern: &Path, segment_secs: f64) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FfmpegTools {
    loglevel: String,
}

impl FfmpegTools {
    pub fn new(loglevel: &str) -> Self {
        Self {
            loglevel: loglevel.to_string(),
        }
    }
}

impl MediaTools for FfmpegTools {
    fn preview(&self, src: &Path, dest: &Path, seek_secs: f64) -> Result<()> {
        preview_command(
            &self.loglevel,
            src,
            dest,
            seek_secs,
            PREVIEW_MAX_WIDTH,
            PREVIEW_QUALITY,
        )
        .run_checked("preview", None)?;
        Ok(())
    }

    fn convert(
        &self,
        codec: VideoCodec,
        trim_start_secs: f64,
        src: &Path,
        dest: &Path,
    ) -> Result<()> {
        let what = match codec {
            VideoCodec::Transcode => "transcode",
            VideoCodec::Copy => "remux",
        };
        convert_command(&self.loglevel, codec, trim_start_secs, src, dest)
            .run_checked(what, None)?;
        Ok(())
    }

    fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = probe_duration_command(path).run(Some(PROBE_TIMEOUT))?;
        if !output.status.success() {
            bail!(
                "ffprobe failed for {}: {}",
                path.display(),
                output.stderr.trim()
            );
        }
        parse_probe_duration(&output.stdout)
    }

    fn split(&self, src: &Path, pattern: &Path, segment_secs: f64) -> Result<()> {
        split_command(&self.loglevel, src, pattern, segment_secs).run_checked("split", None)?;
        Ok(())
    }
}
