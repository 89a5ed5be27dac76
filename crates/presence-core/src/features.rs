//! Histogram feature extraction.
//!
//! Turns a cropped face region into a fixed-length intensity histogram that the
//! correlation matcher can compare.

use crate::types::{Descriptor, Region};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use thiserror::Error;

/// Side of the square every region is resized to before histogramming.
pub const CANONICAL_SIZE: u32 = 100;
/// Number of histogram bins, i.e. descriptor dimensionality.
pub const HISTOGRAM_BINS: usize = 256;
/// Added to the histogram sum so degenerate regions never divide by zero.
pub const NORMALIZATION_EPSILON: f32 = 1e-7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeatureError {
    #[error("face region is empty")]
    EmptyRegion,
}

/// Stateless histogram extractor.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Extract a descriptor from a grayscale face crop.
    pub fn extract(&self, region: &GrayImage) -> Result<Descriptor, FeatureError> {
        if region.width() == 0 || region.height() == 0 {
            return Err(FeatureError::EmptyRegion);
        }

        let canonical = imageops::resize(region, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle);

        let mut hist = [0u32; HISTOGRAM_BINS];
        for pixel in canonical.pixels() {
            hist[pixel.0[0] as usize] += 1;
        }

        let total = hist.iter().map(|&c| c as f32).sum::<f32>() + NORMALIZATION_EPSILON;
        let values = hist.iter().map(|&c| c as f32 / total).collect();

        Ok(Descriptor::new(values))
    }

    /// Extract from an image of any colour type, converting to intensity first.
    pub fn extract_image(&self, region: &DynamicImage) -> Result<Descriptor, FeatureError> {
        self.extract(&region.to_luma8())
    }

    /// Crop and extract a detector region from a full frame.
    pub fn extract_region(&self, frame: &GrayImage, region: &Region) -> Result<Descriptor, FeatureError> {
        let crop = crop(frame, region)?;
        self.extract(&crop)
    }
}

/// Copy `region` out of `frame`, clamped to the frame bounds.
pub fn crop(frame: &GrayImage, region: &Region) -> Result<GrayImage, FeatureError> {
    let x = region.x.min(frame.width());
    let y = region.y.min(frame.height());
    let width = region.width.min(frame.width() - x);
    let height = region.height.min(frame.height() - y);

    if width == 0 || height == 0 {
        return Err(FeatureError::EmptyRegion);
    }

    Ok(imageops::crop_imm(frame, x, y, width, height).to_image())
}
