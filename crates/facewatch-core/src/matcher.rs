use crate::gallery::GalleryIndex;
use crate::recognizer::FaceEmbedder;
use crate::types::MatchOutcome;
use image::RgbImage;

/// Strategy for looking up the closest gallery identity for a face crop.
///
/// Implementations never fail: every failure mode is reported as
/// [`MatchOutcome::Failed`] so callers can fall back to `Unknown`.
pub trait Matcher: Send {
    fn find(&mut self, crop: &RgbImage, gallery: &GalleryIndex) -> MatchOutcome;
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn find(&mut self, crop: &RgbImage, gallery: &GalleryIndex) -> MatchOutcome {
        (**self).find(crop, gallery)
    }
}

/// Embeds the crop, then takes the nearest reference embedding in the gallery.
pub struct EmbeddingMatcher<E> {
    embedder: E,
}

impl<E: FaceEmbedder> EmbeddingMatcher<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn embedder_mut(&mut self) -> &mut E {
        &mut self.embedder
    }
}

impl<E: FaceEmbedder> Matcher for EmbeddingMatcher<E> {
    fn find(&mut self, crop: &RgbImage, gallery: &GalleryIndex) -> MatchOutcome {
        let probe = match self.embedder.embed(crop) {
            Ok(e) => e,
            Err(e) => return MatchOutcome::Failed(e.to_string()),
        };

        match gallery.nearest(&probe) {
            Some(candidate) => MatchOutcome::Candidate(candidate),
            None => MatchOutcome::NoCandidate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::KnownIdentity;
    use crate::recognizer::RecognizerError;
    use crate::types::{Embedding, MatchCandidate};

    struct FixedEmbedder(Option<Vec<f32>>);

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _crop: &RgbImage) -> Result<Embedding, RecognizerError> {
            match &self.0 {
                Some(v) => Ok(Embedding { values: v.clone(), model_version: None }),
                None => Err(RecognizerError::InferenceFailed("boom".into())),
            }
        }
    }

    fn gallery() -> GalleryIndex {
        GalleryIndex::from_identities(vec![
            KnownIdentity::new("Ada", vec![Embedding { values: vec![1.0, 0.0], model_version: None }]),
            KnownIdentity::new("Bob", vec![Embedding { values: vec![0.0, 1.0], model_version: None }]),
        ])
    }

    #[test]
    fn test_embedding_matcher_finds_nearest() {
        let mut matcher = EmbeddingMatcher::new(FixedEmbedder(Some(vec![0.1, 1.0])));
        let crop = RgbImage::new(4, 4);
        match matcher.find(&crop, &gallery()) {
            MatchOutcome::Candidate(MatchCandidate { identity, distance }) => {
                assert_eq!(identity, "Bob");
                assert!(distance < 0.01);
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_embedding_matcher_reports_embed_failure() {
        let mut matcher = EmbeddingMatcher::new(FixedEmbedder(None));
        let outcome = matcher.find(&RgbImage::new(4, 4), &gallery());
        assert!(matches!(outcome, MatchOutcome::Failed(reason) if reason.contains("boom")));
    }

    #[test]
    fn test_embedding_matcher_empty_gallery() {
        let mut matcher = EmbeddingMatcher::new(FixedEmbedder(Some(vec![1.0, 0.0])));
        let outcome = matcher.find(&RgbImage::new(4, 4), &GalleryIndex::from_identities(vec![]));
        assert_eq!(outcome, MatchOutcome::NoCandidate);
    }
}
