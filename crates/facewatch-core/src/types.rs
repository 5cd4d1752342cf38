use serde::{Deserialize, Serialize};
use std::fmt;

/// A face region proposed by a detector, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceRegion {
    /// Region covering a whole `width` x `height` image.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
        }
    }

    /// Integer crop rectangle `(x, y, w, h)` clamped to the frame.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn crop_rect(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = (self.x + self.width).ceil().min(frame_width as f32);
        let y1 = (self.y + self.height).ceil().min(frame_height as f32);

        if !(x1 > x0 && y1 > y0) {
            return None;
        }

        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2]. Lower = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).max(0.0)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Best gallery candidate for one face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub identity: String,
    /// Dissimilarity to the closest reference embedding of `identity`.
    pub distance: f32,
}

/// What a [`Matcher`](crate::matcher::Matcher) produced for one face crop.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Candidate(MatchCandidate),
    /// The gallery had nothing comparable to the probe.
    NoCandidate,
    /// Embedding or lookup failed; the reason is kept for logging only.
    Failed(String),
}

impl MatchOutcome {
    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchOutcome::Candidate(c) => Some(c.distance),
            _ => None,
        }
    }
}

/// Final label for a face after thresholding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedLabel {
    Known(String),
    Unknown,
}

impl ResolvedLabel {
    pub fn is_unknown(&self) -> bool {
        matches!(self, ResolvedLabel::Unknown)
    }
}

impl fmt::Display for ResolvedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedLabel::Known(name) => f.write_str(name),
            ResolvedLabel::Unknown => f.write_str("Unknown"),
        }
    }
}

/// A resolved label plus the candidate distance it was decided on, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub label: ResolvedLabel,
    pub distance: Option<f32>,
}

impl Resolution {
    pub fn unknown() -> Self {
        Self {
            label: ResolvedLabel::Unknown,
            distance: None,
        }
    }

    /// Annotation text, e.g. `Ada (0.40)` or `Unknown`.
    pub fn caption(&self) -> String {
        match self.distance {
            Some(d) => format!("{} ({d:.2})", self.label),
            None => self.label.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_distance_range() {
        let a = emb(&[1.0, 0.0]);
        assert!(a.cosine_distance(&a.clone()).abs() < 1e-6);
        assert!((a.cosine_distance(&emb(&[0.0, 1.0])) - 1.0).abs() < 1e-6);
        assert!((a.cosine_distance(&emb(&[-1.0, 0.0])) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_rect_clamps_to_frame() {
        let region = FaceRegion { x: -5.5, y: 10.2, width: 30.0, height: 500.0, confidence: 0.9 };
        assert_eq!(region.crop_rect(100, 100), Some((0, 10, 25, 90)));
    }

    #[test]
    fn test_crop_rect_outside_frame() {
        let region = FaceRegion { x: 120.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 };
        assert_eq!(region.crop_rect(100, 100), None);
    }

    #[test]
    fn test_caption_formats_distance() {
        let known = Resolution { label: ResolvedLabel::Known("Ada".into()), distance: Some(0.4) };
        assert_eq!(known.caption(), "Ada (0.40)");
        assert_eq!(Resolution::unknown().caption(), "Unknown");
    }
}
