//! rollcall-core — face matching engine for attendance ingestion.
//!
//! Defines the detection and signature capabilities (with an ONNX Runtime
//! backend), the gallery cache, and the matching policy.

pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod matcher;
pub mod types;

pub use detector::{FaceDetector, OnnxDetector};
pub use encoder::{OnnxEncoder, SignatureEncoder};
pub use gallery::{GalleryError, GallerySource, SignatureGallery};
pub use matcher::{MatchError, MatchOutcome, MatchPolicy, NoMatchReason, Recognizer, Strictness};
pub use types::{FaceRegion, Gallery, Signature, SIGNATURE_DIM};

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
