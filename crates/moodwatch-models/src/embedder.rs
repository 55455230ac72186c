//! ArcFace embedder (w600k_r50): 112x112 aligned crop in, L2-normalized
//! 512-d vector out.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::Detection;
use crate::{gray_image, open_session, OnnxError};
use image::imageops::{self, FilterType};
use moodwatch_core::{Embedding, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(path: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            session: open_session(path, "arcface")?,
        })
    }

    /// Embed one detected face. Uses landmark alignment when the detector
    /// provided landmarks, a plain box crop otherwise.
    pub fn embed(&mut self, frame: &Frame, face: &Detection) -> Result<Embedding, OnnxError> {
        let crop = face_crop(frame, face)
            .ok_or_else(|| OnnxError::BadOutput("face crop is empty".to_string()))?;
        let input = to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
        if raw.len() != EMBEDDING_DIM {
            return Err(OnnxError::BadOutput(format!(
                "expected {EMBEDDING_DIM}-d embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn face_crop(frame: &Frame, face: &Detection) -> Option<Frame> {
    if let Some(aligned) = face.landmarks.as_ref().and_then(|lm| alignment::align_face(frame, lm)) {
        return Some(aligned);
    }
    let crop = frame.crop(&face.bbox)?;
    let img = gray_image(&crop.data, crop.width, crop.height)?;
    let resized = imageops::resize(&img, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle);
    Some(Frame::new(resized.into_raw(), ALIGNED_SIZE, ALIGNED_SIZE, frame.sequence))
}

/// Grayscale replicated into three channels, scaled to roughly [-1, 1].
fn to_tensor(face: &Frame) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        let px = face.data.get(y * size + x).copied().unwrap_or(0) as f32;
        (px - MEAN) / STD
    })
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
