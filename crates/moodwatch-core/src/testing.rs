//! Fakes shared by the unit tests.

use crate::frame::Frame;
use crate::models::{DetectedFace, EmotionClassifier, FaceAnalyzer, ModelError, Models};
use crate::session::{CaptureError, FrameSource, PresentationSink, SessionEvent};
use crate::types::{BoundingBox, Embedding, Emotion, EmotionScores};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub fn frame() -> Frame {
    Frame::new(vec![128; 64 * 64], 64, 64, 0)
}

pub fn face_at(values: Vec<f32>) -> DetectedFace {
    DetectedFace {
        embedding: Embedding::new(values),
        bbox: BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 20.0,
            height: 20.0,
            confidence: 0.9,
        },
    }
}

pub fn models(faces: FakeFaces, emotions: FakeClassifier) -> Models {
    Models::new(Box::new(faces), Box::new(emotions))
}

/// Returns scripted faces; the last script entry repeats forever.
pub struct FakeFaces {
    script: VecDeque<Result<Vec<DetectedFace>, ()>>,
}

impl FakeFaces {
    pub fn always(faces: Vec<DetectedFace>) -> Self {
        Self {
            script: VecDeque::from([Ok(faces)]),
        }
    }

    pub fn failing_then(faces: Vec<DetectedFace>) -> Self {
        Self {
            script: VecDeque::from([Err(()), Ok(faces)]),
        }
    }

    pub fn scripted(script: Vec<Vec<DetectedFace>>) -> Self {
        Self {
            script: script.into_iter().map(Ok).collect(),
        }
    }
}

impl FaceAnalyzer for FakeFaces {
    fn detect_and_embed(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, ModelError> {
        let next = if self.script.len() > 1 {
            self.script.pop_front()
        } else {
            self.script.front().cloned()
        };
        match next {
            Some(Ok(faces)) => Ok(faces),
            Some(Err(())) => Err(ModelError::InferenceFailed("scripted failure".into())),
            None => Ok(Vec::new()),
        }
    }
}

/// Cycles through a list of dominant emotions.
pub struct FakeClassifier {
    sequence: Vec<(Emotion, f32)>,
    calls: Arc<Mutex<usize>>,
    fail_after: Option<usize>,
}

impl FakeClassifier {
    pub fn sequence(sequence: Vec<(Emotion, f32)>) -> Self {
        Self {
            sequence,
            calls: Arc::new(Mutex::new(0)),
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        self.calls.clone()
    }
}

impl EmotionClassifier for FakeClassifier {
    fn classify_emotion(&mut self, _face: &Frame) -> Result<EmotionScores, ModelError> {
        let mut calls = self.calls.lock().unwrap();
        let n = *calls;
        *calls += 1;
        if self.fail_after.is_some_and(|limit| n >= limit) {
            return Err(ModelError::InferenceFailed("scripted failure".into()));
        }
        let (label, p) = self.sequence[n % self.sequence.len()];
        let mut scores = EmotionScores::default();
        for e in Emotion::ALL {
            scores.insert(e, if e == label { p } else { (1.0 - p) / 10.0 });
        }
        Ok(scores)
    }
}

/// Produces uniform frames until `fail_at` frames have been served, then
/// reports the device as gone.
pub struct FakeCamera {
    served: u32,
    fail_at: Option<u32>,
    level: u8,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            served: 0,
            fail_at: None,
            level: 128,
        }
    }

    /// Frames dark enough to count as `is_dark`.
    pub fn dim() -> Self {
        Self {
            level: 10,
            ..Self::new()
        }
    }

    pub fn failing_at(n: u32) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::new()
        }
    }
}

impl FrameSource for FakeCamera {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.fail_at.is_some_and(|n| self.served >= n) {
            return Err(CaptureError::DeviceUnavailable("unplugged".into()));
        }
        self.served += 1;
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(Frame::new(vec![self.level; 64 * 64], 64, 64, self.served))
    }
}

/// Records every published event.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PresentationSink for RecordingSink {
    fn publish(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
