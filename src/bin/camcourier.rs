//! camcourier - camera recorder + delivery daemon
//!
//! Threads:
//! 1. Recorder: captures segments into the shared directory
//! 2. Alert feed (optional): MQTT events -> alert signal + snapshot photos
//! 3. Command listener (optional): operator commands over the bot API
//! 4. Sender (main thread): preview/convert/split/upload/cleanup loop

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use camcourier::commands::{run_listener, CommandHandler};
use camcourier::delivery::LogOnly;
use camcourier::events::{run_mqtt, AlertHandler, EventRules};
use camcourier::notify::{RateLimiter, Reporter};
use camcourier::progress::ProgressSettings;
use camcourier::redact::{init_logger, Redactor};
use camcourier::telegram::{CameraSnapshot, TelegramClient};
use camcourier::{
    AlertSignal, CourierConfig, Delivery, FfmpegCapture, FfmpegTools, Layout, Recorder, Sender,
    SenderSettings,
};

type SharedDelivery = Arc<dyn Delivery + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera recorder with crash-safe delivery")]
struct Args {
    /// Config file (.toml, otherwise JSON). Environment variables override it.
    #[arg(long, env = "CAMCOURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single Sender pass over the video directory and exit.
    #[arg(long)]
    once: bool,

    /// Do not start the Recorder; only deliver what is already on disk.
    #[arg(long, env = "CAMCOURIER_NO_RECORDER")]
    no_recorder: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Arc::new(CourierConfig::load(args.config.as_deref())?);

    let level = if cfg.logging.debug {
        "debug"
    } else {
        cfg.logging.level.as_str()
    };
    init_logger(level, Redactor::new(cfg.secrets(), !cfg.logging.debug));

    let layout = Layout::new(cfg.video_dir.clone());
    layout.ensure()?;

    let progress = ProgressSettings::detect(
        &cfg.logging.ui,
        cfg.telegram.upload_progress,
        cfg.telegram.progress_interval,
    );
    let client = Arc::new(TelegramClient::new(cfg.telegram.clone(), progress));
    let delivery: SharedDelivery = if cfg.telegram.is_configured() {
        client.clone()
    } else {
        log::warn!("TG_TOKEN/TG_CHAT_ID are empty; videos stay on disk until configured");
        Arc::new(LogOnly)
    };

    let sender = Sender::new(
        layout.clone(),
        FfmpegTools::new(&cfg.ffmpeg_loglevel),
        Reporter::new(delivery.clone(), RateLimiter::new(cfg.alerts.photo_cooldown)),
        SenderSettings::from_config(&cfg),
    );

    if args.once {
        let summary = sender.run_once()?;
        log::info!(
            "single pass done: delivered={} failed={} uploads={}",
            summary.delivered.len(),
            summary.failed.len(),
            summary.uploads
        );
        return Ok(());
    }

    let stop_delivery = delivery.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        if let Err(e) = stop_delivery.send_text("camera bot stopped: signal") {
            log::warn!("stop notification failed: {:#}", e);
        }
        std::process::exit(0);
    })
    .context("error setting shutdown handler")?;

    let signal = Arc::new(AlertSignal::new());

    if args.no_recorder {
        log::info!("recorder disabled by --no-recorder");
    } else {
        let recorder = Recorder::new(
            layout.clone(),
            FfmpegCapture::new(
                &cfg.ffmpeg_loglevel,
                &cfg.recording.rtsp_url,
                cfg.recording.capture_grace,
            ),
            cfg.recording.clone(),
            Arc::clone(&signal),
        );
        std::thread::Builder::new()
            .name("recorder".into())
            .spawn(move || {
                if let Err(e) = recorder.run() {
                    log::error!("recorder stopped: {:#}", e);
                }
            })
            .context("spawn recorder thread")?;
    }

    if cfg.alerts.mqtt_enabled {
        let handler = AlertHandler::new(
            Arc::clone(&signal),
            EventRules::from_settings(&cfg.alerts),
            delivery.clone(),
            CameraSnapshot::new(client.clone(), &cfg.alerts.snapshot_url),
            cfg.alerts.photo_cooldown,
        );
        let settings = cfg.alerts.clone();
        std::thread::Builder::new()
            .name("alert-feed".into())
            .spawn(move || {
                if let Err(e) = run_mqtt(&settings, &handler) {
                    log::error!("alert feed stopped: {:#}", e);
                }
            })
            .context("spawn alert feed thread")?;
    }

    if cfg.telegram.is_configured() {
        let handler = CommandHandler::new(
            Arc::clone(&cfg),
            delivery.clone(),
            CameraSnapshot::new(client.clone(), &cfg.alerts.snapshot_url),
        );
        let client = client.clone();
        let chat_id = cfg.telegram.chat_id.clone();
        std::thread::Builder::new()
            .name("commands".into())
            .spawn(move || {
                match run_listener(&client, &chat_id, &handler) {
                    Ok(()) => log::info!("stopping on operator request"),
                    Err(e) => {
                        log::error!("command listener stopped: {:#}", e);
                        return;
                    }
                }
                std::process::exit(0);
            })
            .context("spawn command listener thread")?;
    } else {
        log::warn!("TG_TOKEN/TG_CHAT_ID are empty; command listener disabled");
    }

    if let Err(e) = delivery.send_text("camera bot started") {
        log::warn!("start notification failed: {:#}", e);
    }
    sender.run()
}
