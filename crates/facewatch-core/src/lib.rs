//! facewatch-core — gallery matching, identity resolution and unknown-face auditing.
//!
//! Detection and embedding are consumed through the [`FaceDetector`] and
//! [`FaceEmbedder`] traits. SCRFD and ArcFace backends running on ONNX Runtime
//! are provided as the default implementations.

pub mod annotate;
pub mod config;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod resolver;
pub mod types;
pub mod unknown_log;

pub use config::{default_model_dir, ConfigError, RecognitionConfig, Settings};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use gallery::{GalleryError, GalleryIndex, KnownIdentity};
pub use matcher::{EmbeddingMatcher, Matcher};
pub use pipeline::{FrameReport, RecognitionPipeline};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder, RecognizerError};
pub use resolver::IdentityResolver;
pub use types::{Embedding, FaceRegion, MatchCandidate, MatchOutcome, Resolution, ResolvedLabel};
pub use unknown_log::{LogError, UnknownEvent, UnknownEventLogger, UnknownLog};
