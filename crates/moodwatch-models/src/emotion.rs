//! FER+ emotion classifier (emotion-ferplus-8).
//!
//! Input is a 1x1x64x64 grayscale crop with raw 0-255 pixel values; output
//! is eight unnormalized scores.

use crate::{gray_image, open_session, OnnxError};
use image::imageops::{self, FilterType};
use moodwatch_core::{Emotion, EmotionClassifier, EmotionScores, Frame, ModelError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 64;

/// FER+ output order. Contempt has no label of its own and counts as disgust.
const FERPLUS_LABELS: [Emotion; 8] = [
    Emotion::Neutral,
    Emotion::Happy,
    Emotion::Surprise,
    Emotion::Sad,
    Emotion::Angry,
    Emotion::Disgust,
    Emotion::Fear,
    Emotion::Disgust,
];

pub struct FerPlusClassifier {
    session: Session,
}

impl FerPlusClassifier {
    pub fn load(path: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            session: open_session(path, "ferplus")?,
        })
    }

    fn scores(&mut self, face: &Frame) -> Result<EmotionScores, OnnxError> {
        let input = preprocess(face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;
        if logits.len() != FERPLUS_LABELS.len() {
            return Err(OnnxError::BadOutput(format!(
                "expected {} emotion scores, got {}",
                FERPLUS_LABELS.len(),
                logits.len()
            )));
        }
        Ok(to_scores(&softmax(logits)))
    }
}

impl EmotionClassifier for FerPlusClassifier {
    fn classify_emotion(&mut self, face: &Frame) -> Result<EmotionScores, ModelError> {
        Ok(self.scores(face)?)
    }
}

fn preprocess(face: &Frame) -> Result<Array4<f32>, OnnxError> {
    let img = gray_image(&face.data, face.width, face.height)
        .filter(|_| face.width > 0 && face.height > 0)
        .ok_or_else(|| OnnxError::BadOutput("face crop is empty".to_string()))?;
    let resized = imageops::resize(&img, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    Ok(Array4::from_shape_fn((1, 1, size, size), |(_, _, y, x)| {
        resized.get_pixel(x as u32, y as u32).0[0] as f32
    }))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn to_scores(probabilities: &[f32]) -> EmotionScores {
    let mut scores: EmotionScores = Emotion::ALL.iter().map(|&e| (e, 0.0)).collect();
    for (&label, &p) in FERPLUS_LABELS.iter().zip(probabilities) {
        let sum = scores.get(label).unwrap_or(0.0) + p;
        scores.insert(label, sum);
    }
    scores
}
