use crate::detector::FaceDetector;
use crate::embedder::FaceEmbedder;
use crate::emotion::FerPlusClassifier;
use crate::OnnxError;
use moodwatch_core::{DetectedFace, FaceAnalyzer, Frame, ModelError, Models};
use std::path::{Path, PathBuf};

/// Detection followed by per-face embedding.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxFaceAnalyzer {
    pub fn new(detector: FaceDetector, embedder: FaceEmbedder) -> Self {
        Self { detector, embedder }
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect_and_embed(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ModelError> {
        let detections = self.detector.detect(frame)?;
        let mut faces = Vec::with_capacity(detections.len());
        for det in &detections {
            match self.embedder.embed(frame, det) {
                Ok(embedding) => faces.push(DetectedFace {
                    embedding,
                    bbox: det.bbox,
                }),
                // a face at the frame edge may not crop; skip just that face
                Err(OnnxError::BadOutput(reason)) => {
                    tracing::debug!(%reason, confidence = det.bbox.confidence, "face skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(faces)
    }
}

/// Model file locations inside a model directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub embedder: PathBuf,
    pub emotion: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join("det_10g.onnx"),
            embedder: dir.join("w600k_r50.onnx"),
            emotion: dir.join("emotion-ferplus-8.onnx"),
        }
    }
}

/// Load all three models. Fails on the first missing or unloadable file.
pub fn load_models(paths: &ModelPaths) -> Result<Models, OnnxError> {
    let detector = FaceDetector::load(&paths.detector)?;
    let embedder = FaceEmbedder::load(&paths.embedder)?;
    let emotions = FerPlusClassifier::load(&paths.emotion)?;
    Ok(Models::new(
        Box::new(OnnxFaceAnalyzer::new(detector, embedder)),
        Box::new(emotions),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"));
        assert_eq!(paths.detector, PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(paths.emotion, PathBuf::from("/opt/models/emotion-ferplus-8.onnx"));
    }

    #[test]
    fn test_missing_model_reported() {
        let dir = std::env::temp_dir().join("moodwatch-no-models");
        match load_models(&ModelPaths::in_dir(&dir)) {
            Err(OnnxError::ModelNotFound(path)) => assert!(path.ends_with("det_10g.onnx")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("models loaded from an empty directory"),
        }
    }
}
