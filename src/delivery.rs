//! The operator-facing delivery channel.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// Synchronous request/response channel used by the Sender and the
/// auxiliary listeners. Implementations retry transport errors internally;
/// an `Err` means the payload was not accepted.
pub trait Delivery {
    fn send_text(&self, text: &str) -> Result<()>;

    fn send_image(&self, image: &[u8], filename: &str, caption: &str) -> Result<()>;

    /// Upload a video file in chunks. `caption` is shown next to the video.
    fn send_video(&self, path: &Path, caption: &str) -> Result<()>;
}

impl<T: Delivery + ?Sized> Delivery for Arc<T> {
    fn send_text(&self, text: &str) -> Result<()> {
        (**self).send_text(text)
    }

    fn send_image(&self, image: &[u8], filename: &str, caption: &str) -> Result<()> {
        (**self).send_image(image, filename, caption)
    }

    fn send_video(&self, path: &Path, caption: &str) -> Result<()> {
        (**self).send_video(path, caption)
    }
}

impl<T: Delivery + ?Sized> Delivery for &T {
    fn send_text(&self, text: &str) -> Result<()> {
        (**self).send_text(text)
    }

    fn send_image(&self, image: &[u8], filename: &str, caption: &str) -> Result<()> {
        (**self).send_image(image, filename, caption)
    }

    fn send_video(&self, path: &Path, caption: &str) -> Result<()> {
        (**self).send_video(path, caption)
    }
}

/// A still image of the camera's current view.
pub trait SnapshotSource {
    fn snapshot(&self) -> Result<Vec<u8>>;
}

impl<T: SnapshotSource + ?Sized> SnapshotSource for Arc<T> {
    fn snapshot(&self) -> Result<Vec<u8>> {
        (**self).snapshot()
    }
}

/// Used when no channel is configured: everything is logged and dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnly;

impl Delivery for LogOnly {
    fn send_text(&self, text: &str) -> Result<()> {
        log::info!("(no delivery channel) text: {}", text);
        Ok(())
    }

    fn send_image(&self, image: &[u8], filename: &str, _caption: &str) -> Result<()> {
        log::info!(
            "(no delivery channel) image {} ({} bytes)",
            filename,
            image.len()
        );
        Ok(())
    }

    fn send_video(&self, path: &Path, _caption: &str) -> Result<()> {
        anyhow::bail!(
            "no delivery channel configured, keeping {}",
            path.display()
        )
    }
}
