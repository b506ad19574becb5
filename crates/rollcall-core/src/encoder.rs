//! Face signature capability and its ONNX Runtime backend.
//!
//! The backend crops the detected region (with a small margin), resizes it
//! to 112×112 RGB and runs a 128-dimensional embedding model.

use crate::types::{FaceRegion, Signature, SIGNATURE_DIM};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_INPUT_SIZE: u32 = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;
/// Fraction of the region size added on every side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the image")]
    InvalidRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Computes the signature of one face region.
pub trait SignatureEncoder: Send {
    fn encode(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Signature, EncoderError>;
}

impl<T: SignatureEncoder + ?Sized> SignatureEncoder for Box<T> {
    fn encode(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Signature, EncoderError> {
        (**self).encode(image, face)
    }
}

/// ONNX-backed signature encoder.
pub struct OnnxEncoder {
    session: Session,
}

impl OnnxEncoder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded signature model"
        );

        Ok(Self { session })
    }

    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = ENCODER_INPUT_SIZE as usize;
        let resized = image::imageops::resize(
            crop,
            ENCODER_INPUT_SIZE,
            ENCODER_INPUT_SIZE,
            FilterType::Triangle,
        );

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
            }
        }
        tensor
    }
}

impl SignatureEncoder for OnnxEncoder {
    fn encode(&mut self, image: &RgbImage, face: &FaceRegion) -> Result<Signature, EncoderError> {
        let (x, y, w, h) = crop_bounds(face, image.width(), image.height())
            .ok_or(EncoderError::InvalidRegion)?;
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let input = Self::preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("signature extraction: {e}")))?;

        if raw.len() != SIGNATURE_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {SIGNATURE_DIM}-dim signature, got {}",
                raw.len()
            )));
        }

        Ok(Signature::new(l2_normalize(raw)))
    }
}

/// Expand a region by [`CROP_MARGIN`] and clamp it to the image.
/// Returns `(x, y, width, height)` or `None` if nothing is left.
fn crop_bounds(face: &FaceRegion, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x1 = (face.x - mx).max(0.0);
    let y1 = (face.y - my).max(0.0);
    let x2 = (face.x + face.width + mx).min(width as f32);
    let y2 = (face.y + face.height + my).min(height as f32);

    if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
        return None;
    }
    Some((
        x1.floor() as u32,
        y1.floor() as u32,
        (x2 - x1).round() as u32,
        (y2 - y1).round() as u32,
    ))
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, score: 0.9 }
    }

    #[test]
    fn test_crop_bounds_adds_margin() {
        let bounds = crop_bounds(&region(50.0, 50.0, 100.0, 100.0), 400, 400).unwrap();
        assert_eq!(bounds, (40, 40, 120, 120));
    }

    #[test]
    fn test_crop_bounds_clamps_to_image() {
        let (x, y, w, h) = crop_bounds(&region(-20.0, 0.0, 60.0, 30.0), 50, 25).unwrap();
        assert_eq!((x, y), (0, 0));
        assert!(w <= 50 && h <= 25);
    }

    #[test]
    fn test_crop_bounds_outside_image() {
        assert!(crop_bounds(&region(500.0, 500.0, 10.0, 10.0), 100, 100).is_none());
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(40, 60, image::Rgb([128, 128, 128]));
        let tensor = OnnxEncoder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }
}
