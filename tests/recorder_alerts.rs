use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

use camcourier::config::{AlertSettings, RecordingSettings};
use camcourier::events::{AlertHandler, EventRules};
use camcourier::ffmpeg::ToolTimeout;
use camcourier::{AlertSignal, CaptureMode, Capture, Delivery, Layout, Recorder, SnapshotSource};

#[derive(Clone, Copy)]
enum Behavior {
    Write,
    WriteThenFail,
    Empty,
    /// Writes part of the segment, then hits the capture deadline.
    TimedOut,
}

/// Writes a few bytes per capture and remembers the requested durations.
struct FakeCamera {
    behavior: Behavior,
    durations: Mutex<Vec<Duration>>,
}

impl FakeCamera {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            durations: Mutex::new(Vec::new()),
        }
    }

    fn durations(&self) -> Vec<Duration> {
        self.durations.lock().unwrap().clone()
    }
}

impl Capture for &FakeCamera {
    fn capture(&self, duration: Duration, dest: &Path) -> Result<()> {
        self.durations.lock().unwrap().push(duration);
        assert!(
            dest.to_string_lossy().ends_with(".mkv.part"),
            "capture must target the in-progress name"
        );
        match self.behavior {
            Behavior::Write => std::fs::write(dest, b"matroska")?,
            Behavior::WriteThenFail => {
                std::fs::write(dest, b"matro")?;
                bail!("ffmpeg exited with status 1");
            }
            Behavior::Empty => std::fs::write(dest, b"")?,
            Behavior::TimedOut => {
                std::fs::write(dest, b"matroska, cut short")?;
                return Err(anyhow::Error::new(ToolTimeout {
                    command: "ffmpeg -rtsp_transport tcp -i rtsp://camera.local/stream".to_string(),
                    after: duration + Duration::from_secs(30),
                }));
            }
        }
        Ok(())
    }
}

fn settings(mode: CaptureMode) -> RecordingSettings {
    RecordingSettings {
        rtsp_url: "rtsp://camera.local/stream".to_string(),
        mode,
        alert_duration: Duration::from_secs(60),
        segment_width: Duration::from_secs(300),
        capture_grace: Duration::from_secs(30),
        capture_backoff: Duration::from_secs(3),
    }
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn coalesced_alerts_produce_a_single_capture() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    let signal = Arc::new(AlertSignal::new());
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::AlertOnly),
        Arc::clone(&signal),
    );

    assert!(signal.raise());
    assert!(!signal.raise());

    let id = recorder
        .next_alert_capture(Duration::from_millis(100))
        .expect("capture")
        .expect("alert was pending");
    assert!(recorder
        .next_alert_capture(Duration::from_millis(50))
        .expect("idle wait")
        .is_none());

    assert_eq!(camera.durations(), vec![Duration::from_secs(60)]);
    assert_eq!(listing(dir.path()), vec![format!("{id}.mkv")]);
}

#[test]
fn alert_raised_from_another_thread_wakes_the_recorder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    let signal = Arc::new(AlertSignal::new());
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::AlertOnly),
        Arc::clone(&signal),
    );

    let raiser = {
        let signal = Arc::clone(&signal);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signal.raise()
        })
    };
    let captured = recorder
        .next_alert_capture(Duration::from_secs(10))
        .expect("capture");
    assert!(raiser.join().expect("raiser thread"));
    assert!(captured.is_some());
    assert!(!signal.is_pending());
}

#[test]
fn continuous_segments_end_on_the_grid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::Continuous),
        Arc::new(AlertSignal::new()),
    );

    let first = recorder
        .continuous_step(Utc.timestamp_opt(1_000, 0).unwrap())
        .expect("first segment");
    let second = recorder
        .continuous_step(Utc.timestamp_opt(1_200, 0).unwrap())
        .expect("second segment");

    assert_eq!(first.as_str(), "1970.01.01_00.16.40");
    assert_eq!(second.as_str(), "1970.01.01_00.20.00");
    assert_eq!(
        camera.durations(),
        vec![Duration::from_secs(200), Duration::from_secs(300)]
    );
    assert!(first < second);
}

#[test]
fn existing_segment_is_never_overwritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::Continuous),
        Arc::new(AlertSignal::new()),
    );
    let at = Utc.timestamp_opt(1_000, 0).unwrap();

    recorder
        .record_at(at, Duration::from_secs(5))
        .expect("first capture");
    assert!(recorder.record_at(at, Duration::from_secs(5)).is_err());

    assert_eq!(camera.durations().len(), 1);
    assert_eq!(listing(dir.path()), vec!["1970.01.01_00.16.40.mkv".to_string()]);
}

#[test]
fn failed_or_empty_capture_leaves_nothing_behind() {
    for behavior in [Behavior::WriteThenFail, Behavior::Empty] {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = FakeCamera::new(behavior);
        let recorder = Recorder::new(
            Layout::new(dir.path()),
            &camera,
            settings(CaptureMode::Continuous),
            Arc::new(AlertSignal::new()),
        );

        let err = recorder
            .record(Duration::from_secs(5))
            .expect_err("capture must fail");
        assert!(err.to_string().contains("capture of segment"), "{err:#}");
        assert!(listing(dir.path()).is_empty());
    }
}

#[test]
fn hung_capture_is_discarded_and_reported_as_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::TimedOut);
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::Continuous),
        Arc::new(AlertSignal::new()),
    );

    let err = recorder
        .record(Duration::from_secs(5))
        .expect_err("capture must time out");

    assert!(err.to_string().contains("capture of segment"), "{err:#}");
    let timeout = err
        .chain()
        .find_map(|e| e.downcast_ref::<ToolTimeout>())
        .expect("timeout in error chain");
    assert_eq!(timeout.after, Duration::from_secs(35));
    assert!(listing(dir.path()).is_empty());
}

#[test]
fn leftover_recordings_are_finalized_on_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    std::fs::write(dir.path().join("2024.03.09_07.05.00.mkv.part"), b"a").expect("write");
    // both names present: the finalized file wins and the leftover stays put
    std::fs::write(dir.path().join("2024.03.09_07.10.00.mkv.part"), b"b").expect("write");
    std::fs::write(dir.path().join("2024.03.09_07.10.00.mkv"), b"c").expect("write");
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::Continuous),
        Arc::new(AlertSignal::new()),
    );

    assert_eq!(recorder.recover_in_progress().expect("recover"), 1);
    assert_eq!(
        listing(dir.path()),
        vec![
            "2024.03.09_07.05.00.mkv".to_string(),
            "2024.03.09_07.10.00.mkv".to_string(),
            "2024.03.09_07.10.00.mkv.part".to_string(),
        ]
    );
    assert_eq!(
        std::fs::read(dir.path().join("2024.03.09_07.10.00.mkv")).expect("read"),
        b"c"
    );
}

#[derive(Default)]
struct PhotoLog {
    images: Mutex<Vec<(String, String)>>,
}

impl Delivery for PhotoLog {
    fn send_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn send_image(&self, image: &[u8], filename: &str, caption: &str) -> Result<()> {
        assert_eq!(image, b"jpeg");
        self.images
            .lock()
            .unwrap()
            .push((filename.to_string(), caption.to_string()));
        Ok(())
    }

    fn send_video(&self, path: &Path, _caption: &str) -> Result<()> {
        bail!("unexpected video {}", path.display())
    }
}

struct StillImage;

impl SnapshotSource for StillImage {
    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(b"jpeg".to_vec())
    }
}

fn alert_settings() -> AlertSettings {
    AlertSettings {
        mqtt_enabled: true,
        mqtt_broker_addr: "127.0.0.1:1883".to_string(),
        mqtt_username: None,
        mqtt_password: None,
        mqtt_topic: "camera/events".to_string(),
        snapshot_url: "http://camera.local/snapshot.jpg".to_string(),
        motion_enabled: true,
        tamper_enabled: false,
        photo_cooldown: Duration::from_secs(30),
    }
}

#[test]
fn motion_event_triggers_recording_and_one_photo_per_cooldown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let camera = FakeCamera::new(Behavior::Write);
    let signal = Arc::new(AlertSignal::new());
    let photos = Arc::new(PhotoLog::default());
    let settings_alerts = alert_settings();
    let handler = AlertHandler::new(
        Arc::clone(&signal),
        EventRules::from_settings(&settings_alerts),
        Arc::clone(&photos),
        StillImage,
        settings_alerts.photo_cooldown,
    );
    let recorder = Recorder::new(
        Layout::new(dir.path()),
        &camera,
        settings(CaptureMode::AlertOnly),
        Arc::clone(&signal),
    );

    let motion = br#"{"items":[{"name":"IsMotion","value":"true"}]}"#;
    let tamper = br#"{"items":[{"name":"IsTamper","value":"true"}]}"#;
    assert!(handler.handle_payload(motion).expect("motion").motion);
    assert!(handler.handle_payload(motion).expect("motion again").motion);
    // tamper rule disabled
    assert!(!handler.handle_payload(tamper).expect("tamper").any());

    assert_eq!(
        *photos.images.lock().unwrap(),
        vec![("alert.jpg".to_string(), "ONVIF Alert: Motion".to_string())]
    );
    assert!(recorder
        .next_alert_capture(Duration::from_millis(100))
        .expect("capture")
        .is_some());
    assert_eq!(camera.durations(), vec![Duration::from_secs(60)]);
}
