use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name reported for a face that matched no registered identity.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Axis-aligned face region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence for this region, 1.0 when the detector does not score.
    pub confidence: f32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, confidence: 1.0 }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Intensity-histogram descriptor of a face region.
///
/// Produced by [`FeatureExtractor`](crate::features::FeatureExtractor): non-negative
/// bins summing to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pearson correlation between two histograms.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A histogram with zero
    /// variance correlates with nothing and yields 0, as do empty descriptors and
    /// descriptors of different lengths.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let n = self.values.len();
        if n == 0 || n != other.values.len() {
            return 0.0;
        }

        let mean_a = self.values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let mean_b = other.values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;

        let mut cov = 0.0f64;
        let mut var_a = 0.0f64;
        let mut var_b = 0.0f64;
        for (&a, &b) in self.values.iter().zip(&other.values) {
            let da = a as f64 - mean_a;
            let db = b as f64 - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = (var_a * var_b).sqrt();
        if denom > f64::EPSILON {
            (cov / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Bin-wise mean of several descriptors, renormalized to sum to 1.
    ///
    /// Returns `None` for an empty input or mixed dimensionality.
    pub fn average(descriptors: &[Descriptor]) -> Option<Descriptor> {
        let first = descriptors.first()?;
        let dim = first.len();
        if descriptors.iter().any(|d| d.len() != dim) {
            return None;
        }

        let mut sums = vec![0.0f64; dim];
        for d in descriptors {
            for (acc, &v) in sums.iter_mut().zip(&d.values) {
                *acc += v as f64;
            }
        }
        let total: f64 = sums.iter().sum();
        let values = sums
            .iter()
            .map(|&s| (s / (total + crate::features::NORMALIZATION_EPSILON as f64)) as f32)
            .collect();
        Some(Descriptor { values })
    }
}

/// Outcome of matching a query descriptor against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, or `None` when the best score fell below the threshold.
    pub identity: Option<String>,
    /// Best correlation found, 0.0 for an empty registry.
    pub confidence: f32,
}

impl MatchResult {
    pub fn unknown(confidence: f32) -> Self {
        Self { identity: None, confidence }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Identity name for display, `"Unknown"` when unmatched.
    pub fn display_name(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }
}

/// Strategy for comparing a query descriptor against the registered templates.
pub trait Matcher {
    fn best_match(
        &self,
        query: &Descriptor,
        templates: &BTreeMap<String, Descriptor>,
        threshold: f32,
    ) -> MatchResult;
}

/// Histogram-correlation matcher.
///
/// Scores every template. Ties keep the first maximum in iteration order, which
/// for the registry's ordered map is lexicographic by name.
pub struct CorrelationMatcher;

impl Matcher for CorrelationMatcher {
    fn best_match(
        &self,
        query: &Descriptor,
        templates: &BTreeMap<String, Descriptor>,
        threshold: f32,
    ) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_name: Option<&String> = None;

        for (name, template) in templates {
            let sim = query.similarity(template);
            if sim > best_sim {
                best_sim = sim;
                best_name = Some(name);
            }
        }

        match best_name {
            Some(name) if best_sim >= threshold => MatchResult {
                identity: Some(name.clone()),
                confidence: best_sim,
            },
            Some(_) => MatchResult::unknown(best_sim),
            None => MatchResult::unknown(0.0),
        }
    }
}
