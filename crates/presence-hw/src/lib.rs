//! presence-hw: Camera sources and frame conversion.
//!
//! Provides the camera seam used by the recognition loop, a still-image
//! directory source, and V4L2 capture behind the `v4l2` feature.

pub mod camera;
pub mod frame;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use camera::{CameraError, CameraSource, DirectorySource, FrameStream};
pub use frame::Frame;
#[cfg(feature = "v4l2")]
pub use v4l2::{PixelFormat, V4l2Source};
