//! Model capabilities consumed by the pipeline.
//!
//! Implementations own their inference sessions; the pipeline only ever
//! calls them from the single frame-processing thread of a session.

use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding, EmotionScores};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Locates faces and extracts an identity embedding for each.
pub trait FaceAnalyzer: Send {
    /// Faces in `frame`, highest detection confidence first.
    fn detect_and_embed(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ModelError>;
}

/// Scores a face crop against every emotion label.
pub trait EmotionClassifier: Send {
    fn classify_emotion(&mut self, face: &Frame) -> Result<EmotionScores, ModelError>;
}

/// The model pair a session runs with.
pub struct Models {
    pub faces: Box<dyn FaceAnalyzer>,
    pub emotions: Box<dyn EmotionClassifier>,
}

impl Models {
    pub fn new(faces: Box<dyn FaceAnalyzer>, emotions: Box<dyn EmotionClassifier>) -> Self {
        Self { faces, emotions }
    }
}
