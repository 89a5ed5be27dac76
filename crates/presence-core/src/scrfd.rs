//! SCRFD face detector via ONNX Runtime (feature `scrfd`).
//!
//! Letterboxes the frame to 640×640, decodes the three anchor-free stride heads
//! and suppresses overlaps. Landmarks are not decoded: the histogram pipeline
//! only needs the face rectangle.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::Region;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Float box in frame coordinates, before clamping to pixels.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Scale and padding applied by the letterbox, needed to map boxes back.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

pub struct ScrfdDetector {
    session: Session,
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs = session.outputs().len();
        if outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {outputs}"
            )));
        }

        tracing::info!(path = model_path, outputs, "loaded SCRFD model");
        Ok(Self { session })
    }

    fn preprocess(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
        let scale = (INPUT_SIZE as f32 / frame.width() as f32).min(INPUT_SIZE as f32 / frame.height() as f32);
        let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let pad_x = (INPUT_SIZE - new_w) / 2;
        let pad_y = (INPUT_SIZE - new_h) / 2;

        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let size = INPUT_SIZE as usize;
        // Padding is the mean value, which normalizes to zero.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let v = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
            let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }

        let letterbox = Letterbox { scale, pad_x: pad_x as f32, pad_y: pad_y as f32 };
        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        // Standard export order: scores for strides 8/16/32, then bboxes, then kps.
        for (i, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[i + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox));
        }

        let regions = nms(candidates, NMS_IOU_THRESHOLD)
            .into_iter()
            .filter_map(|c| to_region(&c, frame.width(), frame.height()))
            .collect();
        Ok(regions)
    }
}

fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<Candidate> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;
    let unmap = |v: f32, pad: f32| (v - pad) / letterbox.scale;

    (0..grid * grid * ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCORE_THRESHOLD {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;
            Some(Candidate {
                x1: unmap(cx - offsets[0] * step, letterbox.pad_x),
                y1: unmap(cy - offsets[1] * step, letterbox.pad_y),
                x2: unmap(cx + offsets[2] * step, letterbox.pad_x),
                y2: unmap(cy + offsets[3] * step, letterbox.pad_y),
                score,
            })
        })
        .collect()
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Greedy non-maximum suppression; output sorted by score, best first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn to_region(c: &Candidate, width: u32, height: u32) -> Option<Region> {
    let x1 = c.x1.max(0.0).min(width as f32);
    let y1 = c.y1.max(0.0).min(height as f32);
    let x2 = c.x2.max(0.0).min(width as f32);
    let y2 = c.y2.max(0.0).min(height as f32);
    let region = Region {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1).round() as u32,
        height: (y2 - y1).round() as u32,
        confidence: c.score,
    };
    (!region.is_empty()).then_some(region)
}
