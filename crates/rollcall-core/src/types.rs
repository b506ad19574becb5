use serde::{Deserialize, Serialize};

/// Length of a face signature produced by the encoder.
pub const SIGNATURE_DIM: usize = 128;

/// Axis-aligned face region in pixel coordinates of the probe image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub score: f32,
}

impl FaceRegion {
    /// Pixel area (width × height). Degenerate regions have zero area.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Fixed-length face descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two signatures. Signatures of different
    /// lengths, or empty ones, are infinitely far apart.
    pub fn distance(&self, other: &Signature) -> f32 {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian byte encoding used by the enrollment store.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). Returns `None` when the
    /// length is not a multiple of four.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// Known signatures of one group, with the identity each one belongs to.
///
/// `signatures[i]` belongs to `identities[i]`. An identity may appear more
/// than once when several photos were enrolled for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    signatures: Vec<Signature>,
    identities: Vec<String>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, identity: impl Into<String>, signature: Signature) {
        self.identities.push(identity.into());
        self.signatures.push(signature);
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl FromIterator<(String, Signature)> for Gallery {
    fn from_iter<T: IntoIterator<Item = (String, Signature)>>(iter: T) -> Self {
        let mut gallery = Gallery::new();
        for (identity, signature) in iter {
            gallery.push(identity, signature);
        }
        gallery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identical() {
        let a = Signature::new(vec![0.5, -0.5, 1.0]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        let a = Signature::new(vec![0.0, 0.0]);
        let b = Signature::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_mismatched_lengths_never_close() {
        let query = Signature::new(vec![0.1; SIGNATURE_DIM]);
        assert_eq!(query.distance(&Signature::new(Vec::new())), f32::INFINITY);
        assert_eq!(query.distance(&Signature::new(vec![0.1; 4])), f32::INFINITY);
        assert_eq!(Signature::new(Vec::new()).distance(&Signature::new(Vec::new())), f32::INFINITY);
    }

    #[test]
    fn test_signature_bytes_roundtrip() {
        let sig = Signature::new(vec![0.25, -1.5, 3.0e-7]);
        let back = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn test_signature_from_bytes_rejects_ragged() {
        assert!(Signature::from_bytes(&[0, 1, 2]).is_none());
    }

    #[test]
    fn test_region_area_ignores_negative_extent() {
        let r = FaceRegion { x: 0.0, y: 0.0, width: -4.0, height: 10.0, score: 0.9 };
        assert_eq!(r.area(), 0.0);
    }

    #[test]
    fn test_gallery_keeps_parallel_order() {
        let gallery: Gallery = vec![
            ("alice".to_string(), Signature::new(vec![1.0])),
            ("bob".to_string(), Signature::new(vec![2.0])),
            ("alice".to_string(), Signature::new(vec![3.0])),
        ]
        .into_iter()
        .collect();

        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.identities(), &["alice", "bob", "alice"]);
        let firsts: Vec<f32> = gallery.signatures().iter().map(|s| s.values[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0]);
    }
}
