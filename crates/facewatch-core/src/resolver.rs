use crate::gallery::GalleryIndex;
use crate::matcher::Matcher;
use crate::types::{MatchOutcome, Resolution, ResolvedLabel};
use image::RgbImage;

/// Accepts the best candidate when its distance is within a global threshold.
#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    threshold: f32,
}

impl IdentityResolver {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Label a face crop. Matcher failures and empty results resolve to `Unknown`.
    pub fn resolve(&self, matcher: &mut dyn Matcher, crop: &RgbImage, gallery: &GalleryIndex) -> Resolution {
        self.decide(matcher.find(crop, gallery))
    }

    /// Apply the threshold to a matcher outcome.
    ///
    /// `distance <= threshold` is a match; a NaN distance never is.
    pub fn decide(&self, outcome: MatchOutcome) -> Resolution {
        match outcome {
            MatchOutcome::Candidate(candidate) => {
                let label = if candidate.distance <= self.threshold {
                    ResolvedLabel::Known(candidate.identity)
                } else {
                    ResolvedLabel::Unknown
                };
                Resolution {
                    label,
                    distance: Some(candidate.distance),
                }
            }
            MatchOutcome::NoCandidate => Resolution::unknown(),
            MatchOutcome::Failed(reason) => {
                tracing::debug!(%reason, "matcher failed; resolving to Unknown");
                Resolution::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchCandidate;

    fn candidate(identity: &str, distance: f32) -> MatchOutcome {
        MatchOutcome::Candidate(MatchCandidate {
            identity: identity.into(),
            distance,
        })
    }

    struct Scripted(MatchOutcome);

    impl Matcher for Scripted {
        fn find(&mut self, _crop: &RgbImage, _gallery: &GalleryIndex) -> MatchOutcome {
            self.0.clone()
        }
    }

    #[test]
    fn test_known_iff_within_threshold() {
        let resolver = IdentityResolver::new(0.55);
        for d in [0.0f32, 0.1, 0.3, 0.549, 0.55, 0.5501, 0.7, 1.2, 2.0] {
            let resolution = resolver.decide(candidate("Ada", d));
            assert_eq!(resolution.label == ResolvedLabel::Known("Ada".into()), d <= 0.55, "d = {d}");
            assert_eq!(resolution.distance, Some(d));
        }
    }

    #[test]
    fn test_boundary_is_known() {
        let resolver = IdentityResolver::new(0.45);
        assert_eq!(resolver.decide(candidate("Ada", 0.45)).label, ResolvedLabel::Known("Ada".into()));
    }

    #[test]
    fn test_nan_distance_is_unknown() {
        let resolver = IdentityResolver::new(0.55);
        assert_eq!(resolver.decide(candidate("Ada", f32::NAN)).label, ResolvedLabel::Unknown);
    }

    #[test]
    fn test_no_candidate_and_failure_are_unknown() {
        let resolver = IdentityResolver::new(0.55);
        assert_eq!(resolver.decide(MatchOutcome::NoCandidate), Resolution::unknown());
        assert_eq!(resolver.decide(MatchOutcome::Failed("model crashed".into())), Resolution::unknown());
    }

    #[test]
    fn test_scenario_known_ada() {
        let resolver = IdentityResolver::new(0.55);
        let mut matcher = Scripted(candidate("Ada", 0.40));
        let resolution = resolver.resolve(&mut matcher, &RgbImage::new(2, 2), &GalleryIndex::default());
        assert_eq!(resolution.label, ResolvedLabel::Known("Ada".into()));
        assert_eq!(resolution.caption(), "Ada (0.40)");
    }

    #[test]
    fn test_scenario_too_far_is_unknown() {
        let resolver = IdentityResolver::new(0.55);
        let mut matcher = Scripted(candidate("Ada", 0.70));
        let resolution = resolver.resolve(&mut matcher, &RgbImage::new(2, 2), &GalleryIndex::default());
        assert_eq!(resolution.label, ResolvedLabel::Unknown);
        assert_eq!(resolution.caption(), "Unknown (0.70)");
    }

    #[test]
    fn test_raw_directory_name_is_kept() {
        let resolver = IdentityResolver::new(0.55);
        let label = resolver.decide(candidate("  weird name_01 ", 0.1)).label;
        assert_eq!(label, ResolvedLabel::Known("  weird name_01 ".into()));
    }
}
