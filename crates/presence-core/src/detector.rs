//! Face-region detection seam.
//!
//! The recognition pipeline only needs candidate rectangles; how they are found
//! is up to the detector behind [`FaceDetector`].

use crate::types::Region;
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unknown detector kind: {0}")]
    UnknownKind(String),
    #[cfg(feature = "scrfd")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face regions in a grayscale frame.
pub trait FaceDetector: Send {
    /// Candidate regions, highest confidence first.
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Reports the whole frame as a single face.
///
/// For kiosk cameras framed tightly on the subject and for enrolling from
/// photos that are already face crops.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Region::new(0, 0, frame.width(), frame.height())])
    }
}

/// Build a detector by configuration name (`full-frame` or `scrfd`).
pub fn from_kind(kind: &str, model_path: &str) -> Result<Box<dyn FaceDetector>, DetectorError> {
    match kind {
        "full-frame" => Ok(Box::new(FullFrameDetector)),
        #[cfg(feature = "scrfd")]
        "scrfd" => Ok(Box::new(crate::scrfd::ScrfdDetector::load(model_path)?)),
        other => {
            tracing::debug!(model_path, "detector kind not available in this build");
            Err(DetectorError::UnknownKind(other.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame_detector() {
        let frame = GrayImage::new(64, 48);
        let regions = FullFrameDetector.detect(&frame).unwrap();
        assert_eq!(regions, vec![Region::new(0, 0, 64, 48)]);
    }

    #[test]
    fn test_full_frame_detector_empty_frame() {
        assert!(FullFrameDetector.detect(&GrayImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_from_kind() {
        assert!(from_kind("full-frame", "").is_ok());
        assert!(matches!(from_kind("haar", ""), Err(DetectorError::UnknownKind(k)) if k == "haar"));
    }
}
