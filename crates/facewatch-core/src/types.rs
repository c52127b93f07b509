use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bins in one cell histogram (one per 8-bit texture code).
pub const CELL_BINS: usize = 256;

/// Guards the chi-square denominator for bins that are empty in both histograms.
pub const CHI_SQUARE_EPSILON: f32 = 1e-10;

/// Axis-aligned face box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = (x2 - x1).max(0.0);
        let inter_h = (y2 - y1).max(0.0);
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Concatenated, per-cell L1-normalized texture histograms of one face crop.
///
/// Signatures are only comparable when produced with identical encoder
/// parameters; the database records those parameters alongside the vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Per-cell histograms, each [`CELL_BINS`] long.
    pub fn cells(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks(CELL_BINS)
    }

    /// Chi-square distance: `Σ (a - b)² / (a + b + ε)`.
    ///
    /// Symmetric, and zero only when both vectors are identical. Vectors of
    /// different length are not comparable and are infinitely far apart.
    pub fn distance(&self, other: &Signature) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let diff = a - b;
                diff * diff / (a + b + CHI_SQUARE_EPSILON)
            })
            .sum()
    }
}

/// Classification outcome for one query signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Result of matching a query signature against the database.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Best per-identity chi-square distance; infinite when nothing is enrolled.
    pub distance: f32,
    /// `1 - distance / tolerance` for a match, 0 for unknown.
    pub confidence: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity: Identity::Unknown,
            distance,
            confidence: 0.0,
        }
    }
}

/// An enrolled person with their signatures.
#[derive(Debug, Clone, Serialize)]
pub struct PersonRecord {
    pub name: String,
    pub signatures: Vec<Signature>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec())
    }

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((a.iou(&b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = BoundingBox::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_distance_self_is_zero() {
        let a = sig(&[0.5, 0.25, 0.25, 0.0]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = sig(&[0.5, 0.25, 0.25, 0.0]);
        let b = sig(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&b) > 0.0);
    }

    #[test]
    fn test_distance_disjoint_histograms() {
        // Each bin contributes (a - b)^2 / (a + b) = a when the other side is 0.
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[0.0, 1.0]);
        assert!((a.distance(&b) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_distance_length_mismatch_is_infinite() {
        let a = sig(&[0.5, 0.5, 0.0, 0.0]);
        let prefix = sig(&[0.5, 0.5]);
        assert!(a.distance(&prefix).is_infinite());
        assert!(prefix.distance(&a).is_infinite());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Known("Alice".into()).to_string(), "Alice");
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn test_cells_chunking() {
        let s = Signature::new(vec![0.0; CELL_BINS * 3]);
        assert_eq!(s.cells().count(), 3);
        assert!(s.cells().all(|c| c.len() == CELL_BINS));
    }
}
