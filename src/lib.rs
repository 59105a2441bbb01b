//! camcourier
//!
//! Records a camera into a shared directory and delivers the recordings to an
//! operator over a size-limited messaging channel, surviving a crash at any
//! point without losing or corrupting a segment.
//!
//! # Architecture
//!
//! Two loops share nothing but the [`alert::AlertSignal`] and a directory:
//!
//! 1. **Recorder** (`recorder`): captures to `<ts>.mkv.part` and renames to
//!    `<ts>.mkv` only after a clean capture.
//! 2. **Sender** (`sender`): preview, convert, split, upload, cleanup, driven
//!    purely by which files exist (`layout`).
//!
//! # Module Structure
//!
//! - `layout`: the file naming contract and directory snapshots
//! - `alert`: single-slot alert flag
//! - `ffmpeg`: capture/convert/probe/split command lines and runner
//! - `recorder`, `sender`: the two pipeline loops
//! - `delivery`, `telegram`, `progress`: the delivery channel
//! - `notify`, `redact`: operator reports and log hygiene
//! - `events`, `commands`: alert feed and operator commands
//! - `config`: startup configuration

pub mod alert;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod events;
pub mod ffmpeg;
pub mod layout;
pub mod notify;
pub mod progress;
pub mod recorder;
pub mod redact;
pub mod sender;
pub mod telegram;

pub use alert::AlertSignal;
pub use config::{CaptureMode, CourierConfig, DeliveryMode};
pub use delivery::{Delivery, SnapshotSource};
pub use layout::{DirSnapshot, Layout, SegmentId, SegmentState};
pub use recorder::{Capture, FfmpegCapture, Recorder};
pub use sender::media::{FfmpegTools, MediaTools};
pub use sender::{PassSummary, Sender, SenderSettings, Stage, StageError};
