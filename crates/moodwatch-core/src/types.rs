use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the default embedder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `f32::INFINITY` when the dimensions differ, so a mismatched
    /// vector can never win a nearest-neighbor search.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A registered person. The embedding lives in the store and is fetched
/// separately through [`IdentityStore::get_embedding`](crate::store::IdentityStore::get_embedding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    /// Unique registration key.
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Data supplied by the operator when starting a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub display_name: String,
    pub email: String,
}

impl Registration {
    pub fn new(display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into().trim().to_string(),
            email: email.into().trim().to_string(),
        }
    }

    /// Returns the name of the first missing field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.display_name.is_empty() {
            Some("display_name")
        } else if self.email.is_empty() {
            Some("email")
        } else {
            None
        }
    }
}

/// Emotion categories produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}

/// A single (label, confidence) reading. Confidence is in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionObservation {
    pub label: Emotion,
    pub confidence: f32,
}

/// Probability per emotion label, as returned by a classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmotionScores(pub BTreeMap<Emotion, f32>);

impl EmotionScores {
    pub fn insert(&mut self, label: Emotion, probability: f32) {
        *self.0.entry(label).or_insert(0.0) += probability;
    }

    pub fn get(&self, label: Emotion) -> Option<f32> {
        self.0.get(&label).copied()
    }

    /// Label with the highest probability. Ties resolve to the label that
    /// sorts first; non-finite scores are ignored.
    pub fn dominant(&self) -> Option<EmotionObservation> {
        let mut best: Option<EmotionObservation> = None;
        for (&label, &p) in &self.0 {
            if !p.is_finite() {
                continue;
            }
            match best {
                Some(b) if p <= b.confidence => {}
                _ => {
                    best = Some(EmotionObservation {
                        label,
                        confidence: p.clamp(0.0, 1.0),
                    })
                }
            }
        }
        best
    }
}

impl FromIterator<(Emotion, f32)> for EmotionScores {
    fn from_iter<I: IntoIterator<Item = (Emotion, f32)>>(iter: I) -> Self {
        let mut scores = EmotionScores::default();
        for (label, p) in iter {
            scores.insert(label, p);
        }
        scores
    }
}

/// A persisted emotion detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub identity_id: String,
    pub label: Emotion,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}
