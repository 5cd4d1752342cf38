//! Known-identity gallery.
//!
//! Built once per session from an enrollment directory (one subdirectory per
//! person, reference photos inside). Reference embeddings can be persisted in a
//! JSON cache keyed by the SHA-256 of each photo, so restarts only embed photos
//! that changed.

use crate::detector::FaceDetector;
use crate::matcher::Matcher;
use crate::pipeline::crop_face;
use crate::recognizer::FaceEmbedder;
use crate::types::{Embedding, MatchCandidate};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Side length of the blank crop used for warm-up when no reference photo is readable.
const WARM_UP_FALLBACK_SIZE: u32 = 112;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("enrollment directory not found: {0}")]
    RootNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no usable reference images under {0}")]
    Empty(PathBuf),
}

/// One enrolled person and their reference embeddings.
#[derive(Debug, Clone)]
pub struct KnownIdentity {
    pub name: String,
    pub reference_embeddings: Vec<Embedding>,
    /// Photos the embeddings came from, same order as `reference_embeddings`.
    pub sources: Vec<PathBuf>,
}

impl KnownIdentity {
    pub fn new(name: impl Into<String>, reference_embeddings: Vec<Embedding>) -> Self {
        Self {
            name: name.into(),
            reference_embeddings,
            sources: Vec::new(),
        }
    }
}

/// Immutable set of known identities for one session.
#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    identities: BTreeMap<String, KnownIdentity>,
    representative: Option<PathBuf>,
}

impl GalleryIndex {
    /// Assemble a gallery from already-embedded identities.
    ///
    /// Entries sharing a name are merged.
    pub fn from_identities(identities: Vec<KnownIdentity>) -> Self {
        let mut map: BTreeMap<String, KnownIdentity> = BTreeMap::new();
        for identity in identities {
            match map.get_mut(&identity.name) {
                Some(existing) => {
                    existing.reference_embeddings.extend(identity.reference_embeddings);
                    existing.sources.extend(identity.sources);
                }
                None => {
                    map.insert(identity.name.clone(), identity);
                }
            }
        }
        Self {
            identities: map,
            representative: None,
        }
    }

    /// Embed every reference photo under `root`.
    ///
    /// Detection is permissive: when the detector fails or finds nothing, the
    /// whole photo is embedded. Unreadable photos are skipped with a warning.
    pub fn build(
        root: &Path,
        detector: &mut dyn FaceDetector,
        embedder: &mut dyn FaceEmbedder,
        cache_path: Option<&Path>,
    ) -> Result<Self, GalleryError> {
        if !root.is_dir() {
            return Err(GalleryError::RootNotFound(root.to_path_buf()));
        }

        let mut new_cache = GalleryCache {
            model_version: embedder.model_version().map(str::to_string),
            detector: detector.cache_key(),
            entries: BTreeMap::new(),
        };
        let old_cache = cache_path.map(|p| new_cache.load_matching(p)).unwrap_or_default();

        let mut identities = BTreeMap::new();
        let mut representative = None;
        let mut cache_hits = 0usize;

        for (name, dir) in identity_dirs(root)? {
            let mut identity = KnownIdentity::new(name.clone(), Vec::new());

            for path in reference_images(&dir) {
                let bytes = match std::fs::read(&path) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable reference image");
                        continue;
                    }
                };
                let key = format!("{:x}", Sha256::digest(&bytes));

                let embedding = match old_cache.entries.get(&key) {
                    Some(cached) => {
                        cache_hits += 1;
                        cached.clone()
                    }
                    None => match embed_reference(&bytes, detector, embedder) {
                        Ok(e) => e,
                        Err(reason) => {
                            tracing::warn!(path = %path.display(), %reason, "skipping reference image");
                            continue;
                        }
                    },
                };

                new_cache.entries.insert(key, embedding.clone());
                if representative.is_none() {
                    representative = Some(path.clone());
                }
                identity.reference_embeddings.push(embedding);
                identity.sources.push(path);
            }

            if identity.reference_embeddings.is_empty() {
                tracing::warn!(identity = %name, "identity has no usable reference images");
                continue;
            }
            tracing::debug!(
                identity = %name,
                references = identity.reference_embeddings.len(),
                "identity enrolled"
            );
            identities.insert(name, identity);
        }

        if identities.is_empty() {
            return Err(GalleryError::Empty(root.to_path_buf()));
        }

        if let Some(path) = cache_path {
            if let Err(e) = new_cache.save(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write gallery cache");
            }
        }

        let gallery = Self {
            identities,
            representative,
        };
        tracing::info!(
            root = %root.display(),
            identities = gallery.len(),
            references = gallery.reference_count(),
            cache_hits,
            "gallery built"
        );
        Ok(gallery)
    }

    /// Closest reference embedding across all identities, by cosine distance.
    ///
    /// Ties keep the identity that sorts first. References whose dimension
    /// differs from the probe are ignored.
    pub fn nearest(&self, probe: &Embedding) -> Option<MatchCandidate> {
        let mut best: Option<MatchCandidate> = None;

        for identity in self.identities.values() {
            for reference in &identity.reference_embeddings {
                if reference.dim() != probe.dim() {
                    continue;
                }
                let distance = probe.cosine_distance(reference);
                if distance.is_nan() {
                    continue;
                }
                if best.as_ref().map_or(true, |b| distance < b.distance) {
                    best = Some(MatchCandidate {
                        identity: identity.name.clone(),
                        distance,
                    });
                }
            }
        }

        best
    }

    /// Run one throwaway detection and lookup so lazy backend initialization
    /// happens before the first live frame.
    pub fn warm_up(&self, detector: &mut dyn FaceDetector, matcher: &mut dyn Matcher) -> Duration {
        let start = Instant::now();

        let image = self
            .representative
            .as_deref()
            .and_then(|p| image::open(p).ok())
            .map(|img| img.to_rgb8())
            .unwrap_or_else(|| RgbImage::new(WARM_UP_FALLBACK_SIZE, WARM_UP_FALLBACK_SIZE));

        let crop = reference_crop(&image, detector);
        let outcome = matcher.find(&crop, self);

        let elapsed = start.elapsed();
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, ?outcome, "gallery warm-up complete");
        elapsed
    }

    pub fn get(&self, name: &str) -> Option<&KnownIdentity> {
        self.identities.get(name)
    }

    pub fn identities(&self) -> impl Iterator<Item = &KnownIdentity> {
        self.identities.values()
    }

    pub fn identity_names(&self) -> Vec<&str> {
        self.identities.keys().map(String::as_str).collect()
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total number of reference embeddings.
    pub fn reference_count(&self) -> usize {
        self.identities.values().map(|i| i.reference_embeddings.len()).sum()
    }

    /// Reference photo used for warm-up.
    pub fn representative(&self) -> Option<&Path> {
        self.representative.as_deref()
    }
}

/// Persisted reference embeddings, keyed by SHA-256 of the photo bytes.
/// Valid only for the embedder model and detector settings recorded with it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GalleryCache {
    model_version: Option<String>,
    #[serde(default)]
    detector: Option<String>,
    entries: BTreeMap<String, Embedding>,
}

impl GalleryCache {
    /// Load the cache at `path` if it was built with the same models as `self`.
    /// Anything unreadable or built differently is treated as empty.
    fn load_matching(&self, path: &Path) -> Self {
        let Ok(raw) = std::fs::read(path) else {
            return Self::default();
        };
        match serde_json::from_slice::<GalleryCache>(&raw) {
            Ok(cache) if cache.model_version == self.model_version && cache.detector == self.detector => cache,
            Ok(_) => {
                tracing::info!(path = %path.display(), "gallery cache built with other models or settings; ignoring");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt gallery cache; ignoring");
                Self::default()
            }
        }
    }

    fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)
    }
}

/// Identity subdirectories of `root`, sorted by name. Hidden entries are ignored.
fn identity_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>, GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: root.to_path_buf(),
        source,
    };

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Reference photos anywhere below an identity directory, in sorted order.
fn reference_images(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "skipping enrollment entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && is_image(e.path()))
        .map(|e| e.into_path())
        .collect()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn embed_reference(
    bytes: &[u8],
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
) -> Result<Embedding, String> {
    let image = image::load_from_memory(bytes).map_err(|e| e.to_string())?.to_rgb8();
    let crop = reference_crop(&image, detector);
    embedder.embed(&crop).map_err(|e| e.to_string())
}

/// Crop of the most confident face, or the whole image when none is found.
fn reference_crop(image: &RgbImage, detector: &mut dyn FaceDetector) -> RgbImage {
    let best = match detector.detect(image) {
        Ok(regions) => regions
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence)),
        Err(e) => {
            tracing::debug!(error = %e, "detector failed on reference image; using whole image");
            None
        }
    };

    best.and_then(|region| crop_face(image, &region))
        .unwrap_or_else(|| image.clone())
}
