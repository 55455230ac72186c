//! moodwatch-models — ONNX Runtime implementations of the model capabilities.
//!
//! SCRFD locates faces and five landmarks, ArcFace embeds the aligned crop
//! and FER+ scores the crop against the emotion labels.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod embedder;
pub mod emotion;

pub use analyzer::{load_models, ModelPaths, OnnxFaceAnalyzer};
pub use detector::{Detection, FaceDetector};
pub use embedder::FaceEmbedder;
pub use emotion::FerPlusClassifier;

use moodwatch_core::ModelError;
use thiserror::Error;

/// Errors raised while talking to ONNX Runtime.
#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<OnnxError> for ModelError {
    fn from(e: OnnxError) -> Self {
        match e {
            OnnxError::ModelNotFound(path) => ModelError::ModelNotFound(path),
            other => ModelError::InferenceFailed(other.to_string()),
        }
    }
}

/// Load an ONNX session the same way for every model.
pub(crate) fn open_session(path: &std::path::Path, kind: &str) -> Result<ort::session::Session, OnnxError> {
    if !path.exists() {
        return Err(OnnxError::ModelNotFound(path.display().to_string()));
    }
    let session = ort::session::Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    tracing::info!(
        path = %path.display(),
        model = kind,
        inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
        "loaded model"
    );
    Ok(session)
}

/// Grayscale view of a frame as an `image` buffer.
pub(crate) fn gray_image(data: &[u8], width: u32, height: u32) -> Option<image::GrayImage> {
    image::GrayImage::from_raw(width, height, data.to_vec())
}
