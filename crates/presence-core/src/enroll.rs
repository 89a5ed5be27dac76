//! Registration of identities from still images.
//!
//! An image is usable only when the detector finds exactly one face in it.
//! With several images, unusable ones are skipped and the remaining descriptors
//! are averaged into a single template.

use crate::detector::{DetectorError, FaceDetector};
use crate::features::{FeatureError, FeatureExtractor};
use crate::registry::{RegistryError, TemplateRegistry};
use crate::types::Descriptor;
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("face not found in image")]
    NoFace,
    #[error("{0} faces found; use an image with exactly one face")]
    MultipleFaces(usize),
    #[error("none of the {0} images contained exactly one face")]
    NoUsableImages(usize),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Enrollment {
    pub name: String,
    /// Whether `name` was already registered before this enrollment.
    pub replaced: bool,
    pub images_used: usize,
    pub images_skipped: usize,
}

/// Descriptor of the single face in `image`.
pub fn descriptor_from_image(
    detector: &mut dyn FaceDetector,
    image: &GrayImage,
) -> Result<Descriptor, EnrollError> {
    let regions = detector.detect(image)?;
    match regions.as_slice() {
        [] => Err(EnrollError::NoFace),
        [region] => Ok(FeatureExtractor.extract_region(image, region)?),
        many => Err(EnrollError::MultipleFaces(many.len())),
    }
}

/// Averaged descriptor over every image with exactly one face.
///
/// Returns the descriptor and how many images were skipped.
pub fn descriptor_from_images(
    detector: &mut dyn FaceDetector,
    images: &[GrayImage],
) -> Result<(Descriptor, usize), EnrollError> {
    if let [single] = images {
        return Ok((descriptor_from_image(detector, single)?, 0));
    }

    let mut descriptors = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        match descriptor_from_image(detector, image) {
            Ok(d) => descriptors.push(d),
            Err(e @ (EnrollError::NoFace | EnrollError::MultipleFaces(_) | EnrollError::Feature(_))) => {
                tracing::warn!(image = i, error = %e, "skipping enrollment image");
            }
            Err(e) => return Err(e),
        }
    }

    let skipped = images.len() - descriptors.len();
    let descriptor = Descriptor::average(&descriptors).ok_or(EnrollError::NoUsableImages(images.len()))?;
    Ok((descriptor, skipped))
}

/// Extract a template from `images` and upsert it under `name`.
///
/// Nothing is written to the registry unless extraction succeeds. Persisting
/// the registry is left to the caller.
pub fn enroll(
    registry: &TemplateRegistry,
    detector: &mut dyn FaceDetector,
    name: &str,
    images: &[GrayImage],
) -> Result<Enrollment, EnrollError> {
    let (descriptor, skipped) = descriptor_from_images(detector, images)?;
    let replaced = registry.upsert(name, descriptor)?.existed();
    tracing::info!(name, replaced, used = images.len() - skipped, skipped, "identity enrolled");
    Ok(Enrollment {
        name: name.to_string(),
        replaced,
        images_used: images.len() - skipped,
        images_skipped: skipped,
    })
}
