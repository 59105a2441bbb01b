//! Operator command listener over Bot-API long polling.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CaptureMode, CourierConfig};
use crate::delivery::{Delivery, SnapshotSource};
use crate::layout::{DirSnapshot, Layout};
use crate::telegram::TelegramClient;

const POLL_TIMEOUT_SECS: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

const HELP: &str = "Available commands:\n\
/help - show this help\n\
/photo - send a snapshot from the camera\n\
/status - pipeline backlog and alert toggles\n\
/env - effective settings\n\
/exit - stop the bot";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Photo,
    Status,
    Env,
    Exit,
    Unknown(String),
}

/// `/<cmd>[@bot] args...`; anything not starting with `/` is ignored.
pub fn parse_command(text: &str) -> Option<(Command, Vec<String>)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut words = text.split_whitespace();
    let head = words.next()?;
    let name = head.split('@').next().unwrap_or(head);
    let command = match name {
        "/help" | "/start" => Command::Help,
        "/photo" => Command::Photo,
        "/status" => Command::Status,
        "/env" => Command::Env,
        "/exit" => Command::Exit,
        other => Command::Unknown(other.to_string()),
    };
    Some((command, words.map(str::to_string).collect()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// The command already answered through another channel.
    Silent,
    Exit(String),
}

pub struct CommandHandler<D, S> {
    config: Arc<CourierConfig>,
    layout: Layout,
    delivery: D,
    snapshot: S,
}

impl<D: Delivery, S: SnapshotSource> CommandHandler<D, S> {
    pub fn new(config: Arc<CourierConfig>, delivery: D, snapshot: S) -> Self {
        let layout = Layout::new(config.video_dir.clone());
        Self {
            config,
            layout,
            delivery,
            snapshot,
        }
    }

    pub fn handle(&self, command: &Command) -> Reply {
        match command {
            Command::Help => Reply::Text(HELP.to_string()),
            Command::Photo => self.photo(),
            Command::Status => Reply::Text(self.status()),
            Command::Env => Reply::Text(self.env()),
            Command::Exit => Reply::Exit("Stopping the bot on /exit".to_string()),
            Command::Unknown(name) => {
                Reply::Text(format!("Unknown command {name}. Use /help for the list."))
            }
        }
    }

    fn photo(&self) -> Reply {
        let sent = self
            .snapshot
            .snapshot()
            .and_then(|image| self.delivery.send_image(&image, "snapshot.jpg", ""));
        match sent {
            Ok(()) => Reply::Silent,
            Err(e) => {
                log::warn!("/photo failed: {:#}", e);
                Reply::Text("Failed to send a snapshot".to_string())
            }
        }
    }

    fn status(&self) -> String {
        let on_off = |flag: bool| if flag { "on" } else { "off" };
        let alerts = &self.config.alerts;
        let mut lines = vec![
            format!("Motion: {}", on_off(alerts.motion_enabled)),
            format!("Tamper: {}", on_off(alerts.tamper_enabled)),
            format!("Alert feed: {}", on_off(alerts.mqtt_enabled)),
            format!("Delivery mode: {:?}", self.config.delivery.mode),
        ];
        match DirSnapshot::scan(&self.layout) {
            Ok(snapshot) => {
                let backlog = snapshot.backlog();
                lines.push(format!("Recording: {}", backlog.recording));
                lines.push(format!("Raw pending: {}", backlog.raw));
                lines.push(format!("Converted pending: {}", backlog.converted));
                lines.push(format!(
                    "Parts: {} pending, {} sent",
                    backlog.parts_pending, backlog.parts_sent
                ));
            }
            Err(e) => lines.push(format!("Backlog unavailable: {e:#}")),
        }
        lines.join("\n")
    }

    fn env(&self) -> String {
        let cfg = &*self.config;
        let mode = match cfg.recording.mode {
            CaptureMode::AlertOnly => "alert-only",
            CaptureMode::Continuous => "continuous",
        };
        [
            format!("VIDEO_DIR = {}", cfg.video_dir.display()),
            format!("RECORD_MODE = {mode}"),
            format!(
                "ALERT_RECORD_SECONDS = {}",
                cfg.recording.alert_duration.as_secs()
            ),
            format!(
                "CONTINUOUS_SEGMENT_SECONDS = {}",
                cfg.recording.segment_width.as_secs()
            ),
            format!("SEND_ORIGINAL_MKV = {}", cfg.delivery.mode.code()),
            format!("TRIM_START_SECONDS = {}", cfg.delivery.trim_start_secs),
            format!(
                "TG_MAX_FILE_MB = {:.1}",
                cfg.delivery.max_file_bytes as f64 / (1024.0 * 1024.0)
            ),
            format!("TG_SPLIT_SAFETY = {}", cfg.delivery.split_safety),
            format!("VIDEO_PREVIEW_ENABLED = {}", cfg.delivery.preview_enabled),
            format!("TG_SILENT_MODE = {}", cfg.telegram.silent_mode),
            format!("IS_MOTION_ENABLED = {}", cfg.alerts.motion_enabled),
            format!("IS_TAMPER_ENABLED = {}", cfg.alerts.tamper_enabled),
            format!("ALERT_TIMEOUT = {}", cfg.alerts.photo_cooldown.as_secs()),
        ]
        .join("\n")
    }
}

/// Long-poll for commands from the configured chat. Returns once `/exit`
/// has been acknowledged.
pub fn run_listener<D: Delivery, S: SnapshotSource>(
    client: &TelegramClient,
    chat_id: &str,
    handler: &CommandHandler<D, S>,
) -> Result<()> {
    log::info!("command listener started");
    let mut offset: Option<i64> = None;
    loop {
        let updates = match client.get_updates(offset, POLL_TIMEOUT_SECS) {
            Ok(updates) => updates,
            Err(e) => {
                log::warn!("polling error: {:#}. retry in 5s", e);
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        for update in updates {
            offset = Some(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            if message.chat.id.to_string() != chat_id.trim() {
                continue;
            }
            let Some((command, _args)) = message.text.as_deref().and_then(parse_command) else {
                continue;
            };
            log::info!("command {:?}", command);
            match handler.handle(&command) {
                Reply::Text(text) => {
                    if let Err(e) = handler.delivery.send_text(&text) {
                        log::warn!("failed to reply: {:#}", e);
                    }
                }
                Reply::Silent => {}
                Reply::Exit(text) => {
                    if let Err(e) = handler.delivery.send_text(&text) {
                        log::warn!("failed to reply: {:#}", e);
                    }
                    // Acknowledge the update so /exit is not replayed on restart.
                    if let Err(e) = client.get_updates(offset, 0) {
                        log::debug!("final ack failed: {:#}", e);
                    }
                    return Ok(());
                }
            }
        }
    }
}
