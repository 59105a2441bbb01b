//! ffmpeg / ffprobe invocation.
//!
//! Argument lists are built by plain functions so they can be checked in
//! tests; [`ToolCommand::run`] executes them with an optional deadline and
//! keeps stdout/stderr for diagnostics.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const LOG_TAIL_LINES: usize = 120;

/// A command line for an external media tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    fn ffmpeg(loglevel: &str) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: vec!["-y".into(), "-loglevel".into(), loglevel.to_string()],
        }
    }

    fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Run to completion (or until `timeout`), returning captured output
    /// regardless of exit status.
    pub fn run(&self, timeout: Option<Duration>) -> Result<ToolOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => Some(child.wait().context("wait for child process")?),
        };

        let stdout = join_drain(stdout);
        let stderr = join_drain(stderr);
        match status {
            Some(status) => Ok(ToolOutput {
                status,
                stdout,
                stderr,
            }),
            None => Err(anyhow::Error::new(ToolTimeout {
                command: self.display(),
                after: timeout.unwrap_or_default(),
            })),
        }
    }

    /// Run and turn a non-zero exit into a [`ToolFailure`] error.
    pub fn run_checked(&self, what: &str, timeout: Option<Duration>) -> Result<ToolOutput> {
        log::info!("{}: {}", what, self.display());
        let output = self.run(timeout)?;
        if output.status.success() {
            return Ok(output);
        }
        let failure = ToolFailure {
            what: what.to_string(),
            code: output.status.code(),
            command: self.display(),
            stderr: output.stderr.clone(),
        };
        log::error!("{} failed rc={}", what, failure.code_label());
        if !output.stdout.is_empty() {
            log::error!("{} stdout (tail):\n{}", what, tail_lines(&output.stdout, LOG_TAIL_LINES));
        }
        if !output.stderr.is_empty() {
            log::error!("{} stderr (tail):\n{}", what, tail_lines(&output.stderr, LOG_TAIL_LINES));
        }
        Err(anyhow::Error::new(failure))
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Non-zero exit of an external tool.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub what: String,
    pub code: Option<i32>,
    pub command: String,
    pub stderr: String,
}

impl ToolFailure {
    pub fn code_label(&self) -> String {
        self.code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed rc={}", self.what, self.code_label())
    }
}

impl std::error::Error for ToolFailure {}

/// The tool was still running at its deadline and has been killed.
#[derive(Debug, Clone)]
pub struct ToolTimeout {
    pub command: String,
    pub after: Duration,
}

impl fmt::Display for ToolTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {}s: {}",
            self.after.as_secs(),
            self.command
        )
    }
}

impl std::error::Error for ToolTimeout {}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().context("poll child process")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            log::warn!("child process exceeded {}s, killing", limit.as_secs());
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= n {
        return text.to_string();
    }
    lines[lines.len() - n..].join("\n")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn secs_arg(secs: f64) -> String {
    let rounded = (secs * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as u64)
    } else {
        format!("{rounded}")
    }
}

/// Stream copy from the camera into a matroska file, for `duration_secs`.
pub fn capture_command(loglevel: &str, url: &str, duration_secs: u64, dest: &Path) -> ToolCommand {
    ToolCommand::ffmpeg(loglevel)
        .args(["-rtsp_transport", "tcp", "-i", url])
        .args(["-map", "0:v:0", "-map", "0:a:0?", "-c", "copy"])
        .arg("-t")
        .arg(duration_secs.to_string())
        .args(["-f", "matroska"])
        .arg(path_arg(dest))
}

/// One downscaled JPEG frame taken `seek_secs` into the video.
pub fn preview_command(
    loglevel: &str,
    src: &Path,
    dest: &Path,
    seek_secs: f64,
    max_width: u32,
    quality: u8,
) -> ToolCommand {
    let mut cmd = ToolCommand::ffmpeg(loglevel)
        .arg("-ss")
        .arg(secs_arg(seek_secs))
        .arg("-i")
        .arg(path_arg(src))
        .args(["-an", "-frames:v", "1"]);
    if max_width > 0 {
        cmd = cmd.arg("-vf").arg(format!(
            "scale='min({max_width},iw)':-2:in_range=pc:out_range=pc,format=yuv420p"
        ));
    }
    cmd.arg("-q:v")
        .arg(quality.to_string())
        .args(["-update", "1"])
        .arg(path_arg(dest))
}

/// Video handling for the converted artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    /// Re-encode to H.264.
    Transcode,
    /// Keep the camera's video stream as is.
    Copy,
}

pub fn convert_command(
    loglevel: &str,
    codec: VideoCodec,
    trim_start_secs: f64,
    src: &Path,
    dest: &Path,
) -> ToolCommand {
    let mut cmd = ToolCommand::ffmpeg(loglevel);
    if trim_start_secs > 0.0 {
        cmd = cmd.arg("-ss").arg(secs_arg(trim_start_secs));
    }
    cmd = cmd
        .arg("-i")
        .arg(path_arg(src))
        .args(["-map", "0:v:0", "-map", "0:a:0?"]);
    cmd = match codec {
        VideoCodec::Transcode => {
            cmd.args(["-c:v", "libx264", "-preset", "fast", "-crf", "28"])
        }
        VideoCodec::Copy => cmd.args(["-c:v", "copy"]),
    };
    cmd = cmd.args(["-c:a", "libopus"]);
    if codec == VideoCodec::Transcode {
        cmd = cmd.args(["-b:a", "128k"]);
    }
    cmd.args(["-f", "mp4", "-movflags", "+faststart"])
        .arg(path_arg(dest))
}

pub fn probe_duration_command(path: &Path) -> ToolCommand {
    ToolCommand {
        program: "ffprobe".to_string(),
        args: vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path_arg(path),
        ],
    }
}

pub fn parse_probe_duration(stdout: &str) -> Result<f64> {
    let value = stdout.trim();
    let secs: f64 = value
        .parse()
        .map_err(|_| anyhow!("unexpected ffprobe duration output {:?}", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        bail!("ffprobe reported non-positive duration {}", secs);
    }
    Ok(secs)
}

/// Stream-copy split into parts of about `segment_secs`, timestamps reset per part.
pub fn split_command(loglevel: &str, src: &Path, pattern: &Path, segment_secs: f64) -> ToolCommand {
    ToolCommand::ffmpeg(loglevel)
        .arg("-i")
        .arg(path_arg(src))
        .args(["-c", "copy", "-f", "segment", "-segment_time"])
        .arg(secs_arg(segment_secs))
        .args(["-reset_timestamps", "1"])
        .arg(path_arg(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn capture_command_writes_matroska_to_temp_path() {
        let cmd = capture_command(
            "error",
            "rtsp://cam/stream",
            60,
            &PathBuf::from("/v/a.mkv.part"),
        );
        assert_eq!(
            cmd.display(),
            "ffmpeg -y -loglevel error -rtsp_transport tcp -i rtsp://cam/stream \
             -map 0:v:0 -map 0:a:0? -c copy -t 60 -f matroska /v/a.mkv.part"
        );
    }

    #[test]
    fn convert_command_places_trim_before_input() {
        let cmd = convert_command(
            "error",
            VideoCodec::Copy,
            1.5,
            &PathBuf::from("a.mkv"),
            &PathBuf::from("a.mp4.part"),
        );
        let joined = cmd.display();
        assert!(joined.starts_with("ffmpeg -y -loglevel error -ss 1.5 -i a.mkv"));
        assert!(joined.contains("-c:v copy -c:a libopus -f mp4"));
        assert!(joined.ends_with("a.mp4.part"));
    }

    #[test]
    fn convert_command_without_trim_has_no_seek() {
        let cmd = convert_command(
            "error",
            VideoCodec::Transcode,
            0.0,
            &PathBuf::from("a.mkv"),
            &PathBuf::from("a.mp4.part"),
        );
        assert!(!cmd.args.contains(&"-ss".to_string()));
        assert!(cmd.display().contains("-c:v libx264 -preset fast -crf 28"));
    }

    #[test]
    fn split_command_uses_segment_muxer() {
        let cmd = split_command(
            "error",
            &PathBuf::from("a.mp4"),
            &PathBuf::from("a_part%03d.mp4"),
            100.0,
        );
        assert!(cmd
            .display()
            .ends_with("-f segment -segment_time 100 -reset_timestamps 1 a_part%03d.mp4"));
    }

    #[test]
    fn probe_output_parsing() {
        assert_eq!(parse_probe_duration("300.040000\n").unwrap(), 300.04);
        assert!(parse_probe_duration("N/A").is_err());
        assert!(parse_probe_duration("0").is_err());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), text);
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_a_hung_tool() {
        let cmd = ToolCommand {
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
        };
        let started = Instant::now();
        let err = cmd
            .run_checked("capture", Some(Duration::from_millis(200)))
            .expect_err("must time out");
        assert!(started.elapsed() < Duration::from_secs(3));
        let timeout = err.downcast_ref::<ToolTimeout>().expect("timeout error");
        assert_eq!(timeout.command, "sleep 5");
        assert!(err.downcast_ref::<ToolFailure>().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn quick_tool_finishes_before_deadline() {
        let cmd = ToolCommand {
            program: "true".to_string(),
            args: Vec::new(),
        };
        let output = cmd.run(Some(Duration::from_secs(5))).expect("run");
        assert!(output.status.success());
    }
}
