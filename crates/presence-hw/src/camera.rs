//! Camera source seam and the image-directory source.
//!
//! A [`CameraSource`] opens a [`FrameStream`]; the stream owns the device until
//! it is released, either explicitly or when dropped.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("unknown camera source: {0}")]
    UnknownSource(String),
}

/// Something that can be opened to yield frames.
pub trait CameraSource: Send {
    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// An open camera.
pub trait FrameStream: Send {
    /// Block until the next frame. `Ok(None)` means end of stream.
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Give the device back. Must be idempotent; implementations also release on drop.
    fn release(&mut self);
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

/// Replays the still images of a directory, in file-name order, as frames.
pub struct DirectorySource {
    dir: PathBuf,
    interval: Duration,
    repeat: bool,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration, repeat: bool) -> Self {
        Self {
            dir: dir.into(),
            interval,
            repeat,
        }
    }
}

impl CameraSource for DirectorySource {
    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
        let files = list_images(&self.dir)?;
        if files.is_empty() {
            return Err(CameraError::DeviceNotFound(format!(
                "{}: no images",
                self.dir.display()
            )));
        }
        tracing::info!(dir = %self.dir.display(), frames = files.len(), repeat = self.repeat, "directory source opened");
        Ok(Box::new(DirectoryStream {
            files,
            next: 0,
            sequence: 0,
            interval: self.interval,
            repeat: self.repeat,
            released: false,
        }))
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CameraError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

struct DirectoryStream {
    files: Vec<PathBuf>,
    next: usize,
    sequence: u32,
    interval: Duration,
    repeat: bool,
    released: bool,
}

impl FrameStream for DirectoryStream {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.released {
            return Err(CameraError::CaptureFailed("stream released".into()));
        }
        if self.next >= self.files.len() {
            if !self.repeat {
                return Ok(None);
            }
            self.next = 0;
        }

        if self.sequence > 0 && !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let path = &self.files[self.next];
        let image = image::open(path)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_luma8();

        let frame = Frame::from_image(image, self.sequence);
        self.next += 1;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::debug!(frames = self.sequence, "directory stream released");
        }
    }
}

impl Drop for DirectoryStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_frames(dir: &Path, shades: &[u8]) {
        for (i, shade) in shades.iter().enumerate() {
            GrayImage::from_pixel(8, 6, Luma([*shade]))
                .save(dir.join(format!("frame_{i:03}.png")))
                .unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
    }

    #[test]
    fn test_directory_source_plays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[50, 100, 150]);

        let mut source = DirectorySource::new(dir.path(), Duration::ZERO, false);
        let mut stream = source.open().unwrap();
        let shades: Vec<u8> = std::iter::from_fn(|| stream.read().unwrap())
            .map(|f| f.data[0])
            .collect();
        assert_eq!(shades, vec![50, 100, 150]);
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_directory_source_repeat() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[50, 100]);

        let mut source = DirectorySource::new(dir.path(), Duration::ZERO, true);
        let mut stream = source.open().unwrap();
        let seqs: Vec<u32> = (0..5).map(|_| stream.read().unwrap().unwrap().sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_directory_source_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirectorySource::new(dir.path(), Duration::ZERO, false);
        assert!(matches!(source.open(), Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_released_stream_fails_reads() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[50]);
        let mut stream = DirectorySource::new(dir.path(), Duration::ZERO, false).open().unwrap();
        stream.release();
        stream.release();
        assert!(stream.read().is_err());
    }
}
