//! The combined motion-JPEG video sink.
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{info, warn};

/// Appends combined frames to an MJPEG stream file. The file handle is
/// opened lazily and dropped after a period without frames; the next
/// frame reopens it in append mode.
pub(crate) struct MjpegVideoWriter {
    path: PathBuf,
    idle_timeout: Duration,
    file: Option<File>,
    last_write: Instant,
}

impl MjpegVideoWriter {
    pub(crate) fn new(path: &Path, idle_timeout: Duration) -> Self {
        Self {
            path: path.to_owned(),
            idle_timeout,
            file: None,
            last_write: Instant::now(),
        }
    }

    pub(crate) fn append(&mut self, jpeg: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            info!(path = %self.path.display(), "opened combined video");
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(jpeg)?;
        }
        self.last_write = Instant::now();
        Ok(())
    }

    /// Ends the writer's lifetime after the idle timeout.
    pub(crate) fn close_if_idle(&mut self) {
        if self.file.is_some() && self.last_write.elapsed() > self.idle_timeout {
            if let Some(mut file) = self.file.take() {
                if let Err(e) = file.flush() {
                    warn!("failed to flush combined video: {e}");
                }
            }
            info!(path = %self.path.display(), "combined video idle, closing");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_appended_back_to_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("combined.mjpeg");
        let mut writer = MjpegVideoWriter::new(&path, Duration::from_secs(60));

        writer.append(&[0xff, 0xd8, 0xff, 0xd9]).expect("append");
        writer.append(&[0xff, 0xd8, 0x00, 0xff, 0xd9]).expect("append");

        let written = std::fs::read(&path).expect("readable");
        assert_eq!(
            written,
            vec![0xff, 0xd8, 0xff, 0xd9, 0xff, 0xd8, 0x00, 0xff, 0xd9]
        );
    }

    #[test]
    fn writer_closes_after_idle_timeout_and_reopens() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("combined.mjpeg");
        let mut writer = MjpegVideoWriter::new(&path, Duration::from_millis(10));

        writer.append(&[0xff, 0xd8, 0xff, 0xd9]).expect("append");
        assert!(writer.is_open());

        writer.close_if_idle();
        assert!(writer.is_open());

        std::thread::sleep(Duration::from_millis(15));
        writer.close_if_idle();
        assert!(!writer.is_open());

        // The next frame reopens and appends.
        writer.append(&[0xff, 0xd8, 0xff, 0xd9]).expect("append");
        assert_eq!(std::fs::read(&path).expect("readable").len(), 8);
    }
}
