//! Face detection capability and its ONNX Runtime backend.
//!
//! The backend runs an Ultra-Light-Fast (RFB-320) detector: a fixed 320×240
//! RGB input, per-anchor two-class scores and normalized corner boxes,
//! followed by NMS post-processing.

use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: u32 = 320;
const DETECTOR_INPUT_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DETECTOR_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a decoded image.
pub trait FaceDetector: Send {
    /// Return every face region found, in detector order.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        (**self).detect(image)
    }
}

/// ONNX-backed face detector.
pub struct OnnxDetector {
    session: Session,
    /// Output positions of (scores, boxes), discovered by name at load time.
    output_indices: (usize, usize),
}

impl OnnxDetector {
    /// Load the detector model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded face detector model");

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            output_indices: discover_output_indices(&output_names),
        })
    }

    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let resized = image::imageops::resize(
            image,
            DETECTOR_INPUT_WIDTH,
            DETECTOR_INPUT_HEIGHT,
            FilterType::Triangle,
        );

        let (w, h) = (DETECTOR_INPUT_WIDTH as usize, DETECTOR_INPUT_HEIGHT as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }
        tensor
    }
}

impl FaceDetector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (score_idx, box_idx) = self.output_indices;
        let (_, scores) = outputs[score_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[box_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode_candidates(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            DETECTOR_CONFIDENCE_THRESHOLD,
        );
        Ok(nms(candidates, DETECTOR_NMS_THRESHOLD))
    }
}

/// Find the (scores, boxes) outputs by name, falling back to positional order.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "detector output names not recognized, using positional mapping");
            (0, 1)
        }
    }
}

/// Turn raw per-anchor outputs into face regions in image coordinates.
///
/// `scores` holds `[background, face]` pairs; `boxes` holds normalized
/// `[x1, y1, x2, y2]` quadruples.
fn decode_candidates(
    scores: &[f32],
    boxes: &[f32],
    width: f32,
    height: f32,
    threshold: f32,
) -> Vec<FaceRegion> {
    let anchors = (scores.len() / 2).min(boxes.len() / 4);
    let mut regions = Vec::new();

    for i in 0..anchors {
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }
        let x1 = boxes[i * 4].clamp(0.0, 1.0) * width;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * height;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * width;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * height;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        regions.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            score,
        });
    }

    regions
}

/// Non-Maximum Suppression: keep the highest-scoring of overlapping regions.
fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceRegion> = Vec::new();
    for region in regions {
        if keep.iter().all(|k| iou(k, &region) <= iou_threshold) {
            keep.push(region);
        }
    }
    keep
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
