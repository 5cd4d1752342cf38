//! Face embedding extraction.
//!
//! [`FaceEmbedder`] turns a face crop into an [`Embedding`]. The bundled
//! [`ArcFaceEmbedder`] runs the w600k_r50 ArcFace model through ONNX Runtime on
//! a 112x112 resize of the crop.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an embedding for a cropped face.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError>;

    /// Identifier of the model behind the embeddings, used to invalidate caches.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
        (**self).embed(crop)
    }

    fn model_version(&self) -> Option<&str> {
        (**self).model_version()
    }
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize a crop to 112x112 and normalize into a NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized = imageops::resize(crop, size, size, FilterType::Triangle);

        let n = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, RecognizerError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let input = Self::preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw_data.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
