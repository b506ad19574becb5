//! Nearest-neighbour resolution of a probe face against a group gallery.

use crate::detector::FaceDetector;
use crate::encoder::SignatureEncoder;
use crate::types::{FaceRegion, Gallery, Signature};
use image::RgbImage;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default acceptance threshold on Euclidean distance.
pub const DEFAULT_THRESHOLD: f32 = 0.40;

/// Under [`Strictness::Majority`] the voted identity's own best distance must
/// be below `threshold * MAJORITY_MARGIN`.
pub const MAJORITY_MARGIN: f32 = 0.9;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("recognition unavailable: {0}")]
    RecognitionUnavailable(String),
}

/// How a best candidate is turned into an accepted identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Accept the single closest signature if it is under the threshold.
    #[default]
    Nearest,
    /// Vote among all signatures under the threshold, then require the
    /// winner's closest signature to clear a tighter margin.
    Majority,
}

impl FromStr for Strictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "majority" => Ok(Self::Majority),
            other => Err(format!("unknown strictness {other:?} (expected nearest|majority)")),
        }
    }
}

/// Why a probe did not resolve to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatchReason {
    NoFaceDetected,
    NoEnrollmentData,
    BelowThreshold,
    /// Majority vote produced a winner whose distance missed the margin.
    Inconclusive,
}

impl fmt::Display for NoMatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoFaceDetected => "no face detected",
            Self::NoEnrollmentData => "no enrollment data",
            Self::BelowThreshold => "no match",
            Self::Inconclusive => "inconclusive match",
        })
    }
}

/// Result of matching one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity: Option<String>,
    /// `1 - distance`, clamped to [0, 1]. Zero when nothing was compared.
    pub confidence: f32,
    /// Distance backing `confidence`, if any signature was compared.
    pub distance: Option<f32>,
    pub reason: Option<NoMatchReason>,
}

impl MatchOutcome {
    fn none(reason: NoMatchReason) -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            distance: None,
            reason: Some(reason),
        }
    }

    fn rejected(distance: f32, reason: NoMatchReason) -> Self {
        Self {
            identity: None,
            confidence: confidence_of(distance),
            distance: Some(distance),
            reason: Some(reason),
        }
    }

    fn accepted(identity: &str, distance: f32) -> Self {
        Self {
            identity: Some(identity.to_string()),
            confidence: confidence_of(distance),
            distance: Some(distance),
            reason: None,
        }
    }
}

fn confidence_of(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Threshold plus strictness; fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub threshold: f32,
    pub strictness: Strictness,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            strictness: Strictness::default(),
        }
    }
}

impl MatchPolicy {
    pub fn new(threshold: f32, strictness: Strictness) -> Self {
        Self { threshold, strictness }
    }

    /// Resolve a probe signature against a gallery.
    ///
    /// Every gallery entry is compared; the scan never exits early.
    pub fn resolve(&self, gallery: &Gallery, probe: &Signature) -> MatchOutcome {
        if gallery.is_empty() {
            return MatchOutcome::none(NoMatchReason::NoEnrollmentData);
        }

        let distances: Vec<f32> = gallery
            .signatures()
            .iter()
            .map(|s| probe.distance(s))
            .collect();

        let mut best_idx = 0;
        for (i, &d) in distances.iter().enumerate() {
            if d < distances[best_idx] {
                best_idx = i;
            }
        }
        let best = distances[best_idx];

        match self.strictness {
            Strictness::Nearest => {
                if best < self.threshold {
                    MatchOutcome::accepted(&gallery.identities()[best_idx], best)
                } else {
                    MatchOutcome::rejected(best, NoMatchReason::BelowThreshold)
                }
            }
            Strictness::Majority => self.vote(gallery, &distances, best),
        }
    }

    fn vote(&self, gallery: &Gallery, distances: &[f32], best: f32) -> MatchOutcome {
        // (identity, votes, closest distance) in first-seen order.
        let mut tally: Vec<(&str, usize, f32)> = Vec::new();
        for (identity, &d) in gallery.identities().iter().zip(distances) {
            if d >= self.threshold {
                continue;
            }
            match tally.iter_mut().find(|(name, _, _)| *name == identity.as_str()) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 = entry.2.min(d);
                }
                None => tally.push((identity.as_str(), 1, d)),
            }
        }

        let mut winner: Option<&(&str, usize, f32)> = None;
        for entry in &tally {
            if winner.map_or(true, |w| entry.1 > w.1) {
                winner = Some(entry);
            }
        }

        match winner {
            None => MatchOutcome::rejected(best, NoMatchReason::BelowThreshold),
            Some(&(identity, _, closest)) if closest < self.threshold * MAJORITY_MARGIN => {
                MatchOutcome::accepted(identity, closest)
            }
            Some(&(_, _, closest)) => MatchOutcome::rejected(closest, NoMatchReason::Inconclusive),
        }
    }
}

/// Pick the subject among several detected faces: the largest region,
/// ties going to the earliest one.
pub fn select_subject(regions: &[FaceRegion]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, region) in regions.iter().enumerate() {
        let area = region.area();
        if best.map_or(true, |(_, a)| area > a) {
            best = Some((i, area));
        }
    }
    best.map(|(i, _)| i)
}

/// Decode compressed image bytes (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, MatchError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| MatchError::InvalidImage(e.to_string()))
}

/// Detector + encoder + policy. One instance per worker thread.
pub struct Recognizer<D, E> {
    detector: D,
    encoder: E,
    policy: MatchPolicy,
}

impl<D: FaceDetector, E: SignatureEncoder> Recognizer<D, E> {
    pub fn new(detector: D, encoder: E, policy: MatchPolicy) -> Self {
        Self { detector, encoder, policy }
    }

    /// Match a probe image against `gallery`.
    ///
    /// An empty gallery short-circuits before the image is even decoded.
    pub fn identify(&mut self, gallery: &Gallery, image: &[u8]) -> Result<MatchOutcome, MatchError> {
        if gallery.is_empty() {
            return Ok(MatchOutcome::none(NoMatchReason::NoEnrollmentData));
        }

        match self.signature_of(image)? {
            Some(probe) => Ok(self.policy.resolve(gallery, &probe)),
            None => Ok(MatchOutcome::none(NoMatchReason::NoFaceDetected)),
        }
    }

    /// Signature of the subject face in `image`, or `None` if no face is found.
    pub fn signature_of(&mut self, image: &[u8]) -> Result<Option<Signature>, MatchError> {
        let rgb = decode_image(image)?;

        let regions = self.detector.detect(&rgb).map_err(|e| {
            tracing::warn!(error = %e, "face detector failed");
            MatchError::RecognitionUnavailable(e.to_string())
        })?;

        let Some(idx) = select_subject(&regions) else {
            return Ok(None);
        };
        if regions.len() > 1 {
            tracing::debug!(faces = regions.len(), selected = idx, "multiple faces, using largest");
        }

        let signature = self.encoder.encode(&rgb, &regions[idx]).map_err(|e| {
            tracing::warn!(error = %e, "signature encoder failed");
            MatchError::RecognitionUnavailable(e.to_string())
        })?;

        Ok(Some(signature))
    }
}
