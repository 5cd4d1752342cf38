//! Frame sources: the [`VideoSource`] trait, still-image replay and source selection.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Why a frame could not be produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Transient; the caller may try again.
    #[error("no frame: {0}")]
    NoFrame(String),
    /// The source is exhausted.
    #[error("end of stream")]
    EndOfStream,
    /// The device is gone and will not come back.
    #[error("device lost: {0}")]
    DeviceLost(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("failed to read image directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A blocking producer of RGB frames.
pub trait VideoSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Plays a directory of still images in file-name order, once.
pub struct ImageSequence {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();

        if paths.is_empty() {
            tracing::warn!(dir = %dir.display(), "image sequence has no images");
        } else {
            tracing::info!(dir = %dir.display(), frames = paths.len(), "opened image sequence");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            paths,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl VideoSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let Some(path) = self.paths.get(self.next) else {
            return Err(CaptureError::EndOfStream);
        };
        self.next += 1;

        let image = image::open(path)
            .map_err(|e| CaptureError::NoFrame(format!("{}: {e}", path.display())))?;
        Ok(Frame::new(image.to_rgb8(), self.next as u64))
    }

    fn describe(&self) -> String {
        format!("image sequence {} ({} frames)", self.dir.display(), self.paths.len())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Open `location` as a video source: a directory replays its images, anything
/// else is treated as a V4L2 device path.
pub fn open_source(location: &str) -> Result<Box<dyn VideoSource>, SourceError> {
    let path = Path::new(location);
    if path.is_dir() {
        return Ok(Box::new(ImageSequence::open(path)?));
    }
    Ok(Box::new(Camera::open(location)?))
}
