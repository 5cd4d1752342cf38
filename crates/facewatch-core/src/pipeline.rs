//! Per-frame recognition: detect, crop, resolve and annotate every face.

use crate::annotate::annotate_face;
use crate::detector::FaceDetector;
use crate::gallery::GalleryIndex;
use crate::matcher::Matcher;
use crate::resolver::IdentityResolver;
use crate::types::{FaceRegion, Resolution};
use image::imageops;
use image::RgbImage;

/// Copy of the part of `image` covered by `region`, clamped to the image.
pub fn crop_face(image: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
    let (x, y, w, h) = region.crop_rect(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// One labelled face in a processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceReport {
    pub region: FaceRegion,
    pub resolution: Resolution,
}

/// Result of running the pipeline over one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Annotated copy of the input; identical to the input when no face was found.
    pub annotated: RgbImage,
    pub faces: Vec<FaceReport>,
    /// The detector errored and the frame was treated as having no faces.
    pub detection_failed: bool,
}

impl FrameReport {
    pub fn has_unknown(&self) -> bool {
        self.faces.iter().any(|f| f.resolution.label.is_unknown())
    }

    pub fn unknown_count(&self) -> usize {
        self.faces.iter().filter(|f| f.resolution.label.is_unknown()).count()
    }

    pub fn known_count(&self) -> usize {
        self.faces.len() - self.unknown_count()
    }
}

/// Detector + matcher + threshold, applied frame by frame.
pub struct RecognitionPipeline<D, M> {
    detector: D,
    matcher: M,
    resolver: IdentityResolver,
}

impl<D: FaceDetector, M: Matcher> RecognitionPipeline<D, M> {
    pub fn new(detector: D, matcher: M, resolver: IdentityResolver) -> Self {
        Self {
            detector,
            matcher,
            resolver,
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Warm the detector and matcher against `gallery`.
    pub fn warm_up(&mut self, gallery: &GalleryIndex) -> std::time::Duration {
        gallery.warm_up(&mut self.detector, &mut self.matcher)
    }

    /// Detect and label every face in `image`.
    ///
    /// Detector errors degrade to "no faces"; matcher errors degrade to
    /// `Unknown` for that face only. Crops always come from the unannotated
    /// input so neighbouring annotations never leak into a match.
    pub fn process(&mut self, image: &RgbImage, gallery: &GalleryIndex) -> FrameReport {
        let (regions, detection_failed) = match self.detector.detect(image) {
            Ok(regions) => (regions, false),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                (Vec::new(), true)
            }
        };

        let mut annotated = image.clone();
        let mut faces = Vec::with_capacity(regions.len());

        for region in regions {
            let Some(crop) = crop_face(image, &region) else {
                tracing::debug!(?region, "face region outside frame; skipping");
                continue;
            };
            let resolution = self.resolver.resolve(&mut self.matcher, &crop, gallery);
            annotate_face(&mut annotated, &region, &resolution);
            faces.push(FaceReport { region, resolution });
        }

        FrameReport {
            annotated,
            faces,
            detection_failed,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::types::{MatchCandidate, MatchOutcome, ResolvedLabel};
    use image::Rgb;
    use std::collections::VecDeque;

    /// Returns the same regions for every frame, or an error when `None`.
    pub(crate) struct FixedRegions(pub Option<Vec<FaceRegion>>);

    impl FaceDetector for FixedRegions {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            self.0
                .clone()
                .ok_or_else(|| DetectorError::InferenceFailed("detector crashed".into()))
        }
    }

    /// Hands out queued outcomes in order, then `NoCandidate`.
    pub(crate) struct QueuedMatcher(pub VecDeque<MatchOutcome>);

    impl Matcher for QueuedMatcher {
        fn find(&mut self, _crop: &RgbImage, _gallery: &GalleryIndex) -> MatchOutcome {
            self.0.pop_front().unwrap_or(MatchOutcome::NoCandidate)
        }
    }

    pub(crate) fn region(x: f32, y: f32) -> FaceRegion {
        FaceRegion { x, y, width: 40.0, height: 40.0, confidence: 0.9 }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(160, 120, Rgb([90, 90, 90]))
    }

    #[test]
    fn test_no_faces_passes_frame_through() {
        let mut pipeline = RecognitionPipeline::new(
            FixedRegions(Some(vec![])),
            QueuedMatcher(VecDeque::new()),
            IdentityResolver::new(0.55),
        );
        let input = frame();
        let report = pipeline.process(&input, &GalleryIndex::default());
        assert!(report.faces.is_empty());
        assert!(!report.has_unknown());
        assert_eq!(report.annotated, input);
    }

    #[test]
    fn test_detector_failure_degrades_to_empty() {
        let mut pipeline = RecognitionPipeline::new(
            FixedRegions(None),
            QueuedMatcher(VecDeque::new()),
            IdentityResolver::new(0.55),
        );
        let input = frame();
        let report = pipeline.process(&input, &GalleryIndex::default());
        assert!(report.detection_failed);
        assert!(report.faces.is_empty());
        assert_eq!(report.annotated, input);
    }

    #[test]
    fn test_matcher_failure_only_affects_its_face() {
        let outcomes = VecDeque::from(vec![
            MatchOutcome::Failed("internal error".into()),
            MatchOutcome::Candidate(MatchCandidate { identity: "Ada".into(), distance: 0.40 }),
        ]);
        let mut pipeline = RecognitionPipeline::new(
            FixedRegions(Some(vec![region(10.0, 60.0), region(100.0, 60.0)])),
            QueuedMatcher(outcomes),
            IdentityResolver::new(0.55),
        );
        let report = pipeline.process(&frame(), &GalleryIndex::default());

        assert_eq!(report.faces.len(), 2);
        assert_eq!(report.faces[0].resolution, Resolution::unknown());
        assert_eq!(report.faces[1].resolution.label, ResolvedLabel::Known("Ada".into()));
        assert!(report.has_unknown());
        assert_eq!(report.unknown_count(), 1);
        assert_eq!(report.known_count(), 1);
        assert_ne!(report.annotated, frame());
    }

    #[test]
    fn test_regions_outside_frame_are_skipped() {
        let mut pipeline = RecognitionPipeline::new(
            FixedRegions(Some(vec![region(1000.0, 1000.0)])),
            QueuedMatcher(VecDeque::new()),
            IdentityResolver::new(0.55),
        );
        let report = pipeline.process(&frame(), &GalleryIndex::default());
        assert!(report.faces.is_empty());
    }

    #[test]
    fn test_crop_face_clamps() {
        let image = frame();
        let crop = crop_face(&image, &region(140.0, 100.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
    }
}
