//! V4L2 camera capture via the `v4l` crate (feature `v4l2`).

use crate::camera::{CameraError, CameraSource, FrameStream};
use crate::frame::{self, Frame};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// A V4L2 device path plus the capture size to request.
pub struct V4l2Source {
    device_path: String,
    width: u32,
    height: u32,
}

impl V4l2Source {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl CameraSource for V4l2Source {
    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
        Ok(Box::new(V4l2Stream::open(&self.device_path, self.width, self.height)?))
    }

    fn describe(&self) -> String {
        format!("v4l2 {}", self.device_path)
    }
}

/// Open V4L2 device. Dropping it closes the device.
pub struct V4l2Stream {
    device: Option<Device>,
    width: u32,
    height: u32,
    device_path: String,
    pixel_format: PixelFormat,
    sequence: u32,
}

impl V4l2Stream {
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            sequence: 0,
        })
    }

    fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;
        let converted = match self.pixel_format {
            PixelFormat::Grey if buf.len() >= pixels => Ok(buf[..pixels].to_vec()),
            PixelFormat::Grey => Err(frame::FrameError::InvalidLength { expected: pixels, actual: buf.len() }),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }
}

impl FrameStream for V4l2Stream {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CameraError::CaptureFailed("device released".into()))?;

        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let (buf, _meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.to_grayscale(buf)?;
        let frame = Frame::from_gray(gray, self.width, self.height, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, frames = self.sequence, "camera released");
        }
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.release();
    }
}
