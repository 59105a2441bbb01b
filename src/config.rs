use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::ffmpeg::VideoCodec;

const DEFAULT_VIDEO_DIR: &str = "/videos";
const DEFAULT_FFMPEG_LOGLEVEL: &str = "error";
const DEFAULT_ALERT_RECORD_SECS: u64 = 120;
const DEFAULT_SEGMENT_SECS: u64 = 300;
const DEFAULT_CAPTURE_GRACE_SECS: u64 = 30;
const DEFAULT_CAPTURE_BACKOFF_SECS: u64 = 3;
const DEFAULT_SEND_MODE: u8 = 3;
const DEFAULT_MAX_FILE_MB: f64 = 50.0;
const DEFAULT_SPLIT_SAFETY: f64 = 0.80;
const DEFAULT_POLL_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_READ_TIMEOUT_SECS: f64 = 600.0;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_RETRY_BACKOFF_SECS: f64 = 2.0;
const DEFAULT_PROGRESS_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_TOPIC: &str = "camera/events";
const DEFAULT_ALERT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Default)]
struct CourierConfigFile {
    video_dir: Option<PathBuf>,
    ffmpeg_loglevel: Option<String>,
    recording: Option<RecordingConfigFile>,
    delivery: Option<DeliveryConfigFile>,
    telegram: Option<TelegramConfigFile>,
    alerts: Option<AlertConfigFile>,
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    rtsp_url: Option<String>,
    alert_only: Option<bool>,
    alert_seconds: Option<u64>,
    segment_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    mode: Option<u8>,
    trim_start_seconds: Option<f64>,
    max_file_mb: Option<f64>,
    split_safety: Option<f64>,
    preview: Option<bool>,
    poll_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelegramConfigFile {
    token: Option<String>,
    chat_id: Option<String>,
    silent_mode: Option<u8>,
    connect_timeout: Option<f64>,
    read_timeout: Option<f64>,
    write_timeout: Option<f64>,
    retries: Option<u32>,
    retry_backoff: Option<f64>,
    upload_progress: Option<bool>,
    progress_interval: Option<f64>,
    chunk_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    mqtt_enabled: Option<bool>,
    mqtt_broker_addr: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_topic: Option<String>,
    snapshot_url: Option<String>,
    motion: Option<bool>,
    tamper: Option<bool>,
    photo_cooldown_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfigFile {
    debug: Option<bool>,
    level: Option<String>,
    ui: Option<String>,
}

/// Effective configuration, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub video_dir: PathBuf,
    pub ffmpeg_loglevel: String,
    pub recording: RecordingSettings,
    pub delivery: DeliverySettings,
    pub telegram: TelegramSettings,
    pub alerts: AlertSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    AlertOnly,
    Continuous,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    /// Empty disables capture.
    pub rtsp_url: String,
    pub mode: CaptureMode,
    pub alert_duration: Duration,
    pub segment_width: Duration,
    pub capture_grace: Duration,
    pub capture_backoff: Duration,
}

/// What the Sender hands to the delivery channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send the raw matroska file untouched.
    Raw,
    /// Re-encode video and audio into mp4.
    Transcode,
    /// Copy video, re-encode audio, into mp4.
    Remux,
}

impl DeliveryMode {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(DeliveryMode::Raw),
            2 => Ok(DeliveryMode::Transcode),
            3 => Ok(DeliveryMode::Remux),
            other => Err(anyhow!(
                "SEND_ORIGINAL_MKV must be 1 (raw), 2 (transcode) or 3 (remux), got {}",
                other
            )),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeliveryMode::Raw => 1,
            DeliveryMode::Transcode => 2,
            DeliveryMode::Remux => 3,
        }
    }

    pub fn video_codec(self) -> Option<VideoCodec> {
        match self {
            DeliveryMode::Raw => None,
            DeliveryMode::Transcode => Some(VideoCodec::Transcode),
            DeliveryMode::Remux => Some(VideoCodec::Copy),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub mode: DeliveryMode,
    pub trim_start_secs: f64,
    pub max_file_bytes: u64,
    pub split_safety: f64,
    pub preview_enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub token: String,
    pub chat_id: String,
    /// 0 sends without sound; anything else notifies.
    pub silent_mode: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub upload_progress: bool,
    pub progress_interval: Duration,
    pub chunk_size: usize,
}

impl TelegramSettings {
    pub fn is_configured(&self) -> bool {
        !self.token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub mqtt_enabled: bool,
    pub mqtt_broker_addr: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
    pub snapshot_url: String,
    pub motion_enabled: bool,
    pub tamper_enabled: bool,
    pub photo_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub debug: bool,
    pub level: String,
    pub ui: String,
}

impl CourierConfig {
    /// Load from an optional file (explicit path, else `CAMCOURIER_CONFIG`),
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CAMCOURIER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CourierConfigFile) -> Result<Self> {
        let rec = file.recording.unwrap_or_default();
        let del = file.delivery.unwrap_or_default();
        let tg = file.telegram.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();
        let logging = file.logging.unwrap_or_default();

        let read_timeout = tg.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT_SECS);
        let recording = RecordingSettings {
            rtsp_url: rec.rtsp_url.unwrap_or_default(),
            mode: if rec.alert_only.unwrap_or(false) {
                CaptureMode::AlertOnly
            } else {
                CaptureMode::Continuous
            },
            alert_duration: Duration::from_secs(
                rec.alert_seconds.unwrap_or(DEFAULT_ALERT_RECORD_SECS),
            ),
            segment_width: Duration::from_secs(rec.segment_seconds.unwrap_or(DEFAULT_SEGMENT_SECS)),
            capture_grace: Duration::from_secs(DEFAULT_CAPTURE_GRACE_SECS),
            capture_backoff: Duration::from_secs(DEFAULT_CAPTURE_BACKOFF_SECS),
        };
        let delivery = DeliverySettings {
            mode: DeliveryMode::from_code(del.mode.unwrap_or(DEFAULT_SEND_MODE))?,
            trim_start_secs: del.trim_start_seconds.unwrap_or(0.0),
            max_file_bytes: mb_to_bytes(del.max_file_mb.unwrap_or(DEFAULT_MAX_FILE_MB)),
            split_safety: del.split_safety.unwrap_or(DEFAULT_SPLIT_SAFETY),
            preview_enabled: del.preview.unwrap_or(true),
            poll_interval: Duration::from_secs(del.poll_seconds.unwrap_or(DEFAULT_POLL_SECS)),
        };
        let telegram = TelegramSettings {
            token: tg.token.unwrap_or_default(),
            chat_id: tg.chat_id.unwrap_or_default(),
            silent_mode: tg.silent_mode.unwrap_or(0),
            connect_timeout: secs_f64(tg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))?,
            read_timeout: secs_f64(read_timeout)?,
            write_timeout: secs_f64(tg.write_timeout.unwrap_or(read_timeout))?,
            retries: tg.retries.unwrap_or(DEFAULT_RETRIES),
            retry_backoff: secs_f64(tg.retry_backoff.unwrap_or(DEFAULT_RETRY_BACKOFF_SECS))?,
            upload_progress: tg.upload_progress.unwrap_or(false),
            progress_interval: secs_f64(
                tg.progress_interval.unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS),
            )?,
            chunk_size: tg.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        };
        let alerts = AlertSettings {
            mqtt_enabled: alerts.mqtt_enabled.unwrap_or(false),
            mqtt_broker_addr: alerts
                .mqtt_broker_addr
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            mqtt_username: alerts.mqtt_username,
            mqtt_password: alerts.mqtt_password,
            mqtt_topic: alerts
                .mqtt_topic
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            snapshot_url: alerts.snapshot_url.unwrap_or_default(),
            motion_enabled: alerts.motion.unwrap_or(true),
            tamper_enabled: alerts.tamper.unwrap_or(true),
            photo_cooldown: Duration::from_secs(
                alerts
                    .photo_cooldown_seconds
                    .unwrap_or(DEFAULT_ALERT_TIMEOUT_SECS),
            ),
        };
        let logging = LoggingSettings {
            debug: logging.debug.unwrap_or(false),
            level: logging
                .level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            ui: logging.ui.unwrap_or_else(|| "auto".to_string()),
        };
        Ok(Self {
            video_dir: file
                .video_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR)),
            ffmpeg_loglevel: file
                .ffmpeg_loglevel
                .unwrap_or_else(|| DEFAULT_FFMPEG_LOGLEVEL.to_string()),
            recording,
            delivery,
            telegram,
            alerts,
            logging,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_string("VIDEO_DIR") {
            self.video_dir = PathBuf::from(dir);
        }
        if let Some(level) = env_string("FFMPEG_LOGLEVEL") {
            self.ffmpeg_loglevel = level;
        }

        if let Some(url) = env_string("RTSP_URL") {
            self.recording.rtsp_url = url;
        }
        if let Some(flag) = env_string("RECORD_ON_ALERT_ONLY") {
            self.recording.mode = if parse_flag(&flag) {
                CaptureMode::AlertOnly
            } else {
                CaptureMode::Continuous
            };
        }
        if let Some(secs) = env_parse::<u64>("ALERT_RECORD_SECONDS")? {
            self.recording.alert_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CONTINUOUS_SEGMENT_SECONDS")? {
            self.recording.segment_width = Duration::from_secs(secs);
        }

        if let Some(code) = env_parse::<u8>("SEND_ORIGINAL_MKV")? {
            self.delivery.mode = DeliveryMode::from_code(code)?;
        }
        if let Some(secs) = env_parse::<f64>("TRIM_START_SECONDS")? {
            self.delivery.trim_start_secs = secs;
        }
        if let Some(mb) = env_parse::<f64>("TG_MAX_FILE_MB")? {
            self.delivery.max_file_bytes = mb_to_bytes(mb);
        }
        if let Some(safety) = env_parse::<f64>("TG_SPLIT_SAFETY")? {
            self.delivery.split_safety = safety;
        }
        if let Some(flag) = env_string("VIDEO_PREVIEW_ENABLED") {
            self.delivery.preview_enabled = parse_flag(&flag);
        }
        if let Some(secs) = env_parse::<u64>("SEND_POLL_SECONDS")? {
            self.delivery.poll_interval = Duration::from_secs(secs);
        }

        if let Some(token) = env_string("TG_TOKEN") {
            self.telegram.token = token;
        }
        if let Some(chat_id) = env_string("TG_CHAT_ID") {
            self.telegram.chat_id = chat_id;
        }
        if let Some(mode) = env_parse::<u8>("TG_SILENT_MODE")? {
            self.telegram.silent_mode = mode;
        }
        if let Some(secs) = env_parse::<f64>("TG_CONNECT_TIMEOUT")? {
            self.telegram.connect_timeout = secs_f64(secs)?;
        }
        let read_override = env_parse::<f64>("TG_READ_TIMEOUT")?;
        if let Some(secs) = read_override {
            self.telegram.read_timeout = secs_f64(secs)?;
        }
        match env_parse::<f64>("TG_WRITE_TIMEOUT")? {
            Some(secs) => self.telegram.write_timeout = secs_f64(secs)?,
            None if read_override.is_some() => {
                self.telegram.write_timeout = self.telegram.read_timeout;
            }
            None => {}
        }
        if let Some(retries) = env_parse::<u32>("TG_RETRIES")? {
            self.telegram.retries = retries;
        }
        if let Some(secs) = env_parse::<f64>("TG_RETRY_BACKOFF_SEC")? {
            self.telegram.retry_backoff = secs_f64(secs)?;
        }
        if let Some(flag) = env_string("TG_UPLOAD_PROGRESS") {
            self.telegram.upload_progress = parse_flag(&flag);
        }
        if let Some(secs) = env_parse::<f64>("TG_UPLOAD_PROGRESS_INTERVAL_SEC")? {
            self.telegram.progress_interval = secs_f64(secs)?;
        }
        if let Some(size) = env_parse::<usize>("TG_UPLOAD_CHUNK_SIZE")? {
            self.telegram.chunk_size = size;
        }

        if let Some(flag) = env_string("MQTT_ENABLED") {
            self.alerts.mqtt_enabled = parse_flag(&flag);
        }
        if let Some(addr) = env_string("MQTT_BROKER_ADDR") {
            self.alerts.mqtt_broker_addr = addr;
        }
        if let Some(user) = env_string("MQTT_USERNAME") {
            self.alerts.mqtt_username = Some(user);
        }
        if let Some(pass) = env_string("MQTT_PASSWORD") {
            self.alerts.mqtt_password = Some(pass);
        }
        if let Some(topic) = env_string("MQTT_EVENT_TOPIC") {
            self.alerts.mqtt_topic = topic;
        }
        if let Some(url) = env_string("SNAPSHOT_URL") {
            self.alerts.snapshot_url = url;
        }
        if let Some(flag) = env_string("IS_MOTION_ENABLED") {
            self.alerts.motion_enabled = parse_flag(&flag);
        }
        if let Some(flag) = env_string("IS_TAMPER_ENABLED") {
            self.alerts.tamper_enabled = parse_flag(&flag);
        }
        if let Some(secs) = env_parse::<u64>("ALERT_TIMEOUT")? {
            self.alerts.photo_cooldown = Duration::from_secs(secs);
        }

        if let Some(flag) = env_string("DEBUG") {
            self.logging.debug = parse_flag(&flag);
        }
        if let Some(level) = env_string("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(ui) = env_string("UI") {
            self.logging.ui = ui;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.recording.alert_duration.is_zero() {
            return Err(anyhow!("ALERT_RECORD_SECONDS must be greater than zero"));
        }
        if self.recording.segment_width.is_zero() {
            return Err(anyhow!("CONTINUOUS_SEGMENT_SECONDS must be greater than zero"));
        }
        if self.delivery.poll_interval.is_zero() {
            return Err(anyhow!("SEND_POLL_SECONDS must be greater than zero"));
        }
        if !(self.delivery.split_safety > 0.0 && self.delivery.split_safety <= 1.0) {
            return Err(anyhow!(
                "TG_SPLIT_SAFETY must be within (0, 1], got {}",
                self.delivery.split_safety
            ));
        }
        if self.delivery.max_file_bytes == 0 {
            return Err(anyhow!("TG_MAX_FILE_MB must be greater than zero"));
        }
        if !self.delivery.trim_start_secs.is_finite() || self.delivery.trim_start_secs < 0.0 {
            return Err(anyhow!("TRIM_START_SECONDS must be a non-negative number"));
        }
        if self.telegram.retries == 0 {
            return Err(anyhow!("TG_RETRIES must be at least 1"));
        }
        if self.telegram.chunk_size == 0 {
            return Err(anyhow!("TG_UPLOAD_CHUNK_SIZE must be greater than zero"));
        }
        let url = self.recording.rtsp_url.trim();
        if !url.is_empty() {
            Url::parse(url).map_err(|e| anyhow!("RTSP_URL is not a valid url: {}", e))?;
        }
        self.recording.rtsp_url = url.to_string();
        let snapshot = self.alerts.snapshot_url.trim();
        if !snapshot.is_empty() {
            Url::parse(snapshot).map_err(|e| anyhow!("SNAPSHOT_URL is not a valid url: {}", e))?;
        }
        self.alerts.snapshot_url = snapshot.to_string();
        Ok(())
    }

    /// Effective part size limit after the safety margin.
    pub fn part_limit_bytes(&self) -> u64 {
        crate::sender::split::effective_limit(
            self.delivery.max_file_bytes,
            self.delivery.split_safety,
        )
    }

    /// Secret values that must never appear in logs.
    pub fn secrets(&self) -> Vec<String> {
        let mut secrets = Vec::new();
        if !self.telegram.token.is_empty() {
            secrets.push(self.telegram.token.clone());
        }
        if let Some(pass) = &self.alerts.mqtt_password {
            if !pass.is_empty() {
                secrets.push(pass.clone());
            }
        }
        secrets
    }
}

fn read_config_file(path: &Path) -> Result<CourierConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value {:?}", key, raw)),
        None => Ok(None),
    }
}

/// `1`, `true`, `yes`, `y`, `on` are truthy; everything else is not.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn mb_to_bytes(mb: f64) -> u64 {
    if !mb.is_finite() || mb <= 0.0 {
        return 0;
    }
    (mb * 1024.0 * 1024.0) as u64
}

fn secs_f64(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid duration {} seconds", secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_codes_round_trip_through_config_values() {
        assert_eq!(DeliveryMode::from_code(1).unwrap(), DeliveryMode::Raw);
        assert_eq!(DeliveryMode::from_code(3).unwrap().code(), 3);
        assert!(DeliveryMode::from_code(0).is_err());
        assert_eq!(DeliveryMode::Raw.video_codec(), None);
        assert_eq!(
            DeliveryMode::Remux.video_codec(),
            Some(VideoCodec::Copy)
        );
    }

    #[test]
    fn flags_accept_common_truthy_spellings() {
        for v in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["0", "false", "off", ""] {
            assert!(!parse_flag(v), "{v}");
        }
    }

    #[test]
    fn part_limit_applies_safety_margin() {
        let mut cfg = CourierConfig::from_file(CourierConfigFile::default()).expect("defaults");
        cfg.delivery.max_file_bytes = 50 * 1024 * 1024;
        cfg.delivery.split_safety = 0.8;
        assert_eq!(cfg.part_limit_bytes(), 41_943_040);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CourierConfig::from_file(CourierConfigFile::default()).expect("defaults");
        assert_eq!(cfg.video_dir, PathBuf::from("/videos"));
        assert_eq!(cfg.recording.mode, CaptureMode::Continuous);
        assert_eq!(cfg.recording.alert_duration, Duration::from_secs(120));
        assert_eq!(cfg.recording.segment_width, Duration::from_secs(300));
        assert_eq!(cfg.delivery.mode, DeliveryMode::Remux);
        assert_eq!(cfg.delivery.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.telegram.write_timeout, cfg.telegram.read_timeout);
        assert_eq!(cfg.telegram.chunk_size, 256 * 1024);
    }
}
