//! Per-frame detection pipeline: detect, match, classify, smooth, persist.

use crate::cache::EmbeddingCache;
use crate::frame::Frame;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::models::Models;
use crate::smoother::{EmotionSmoother, SmoothingScope, DEFAULT_WINDOW_CAPACITY};
use crate::store::IdentityStore;
use crate::throttle::{DetectionThrottle, DEFAULT_PERSIST_EVERY_N};
use crate::types::{BoundingBox, Emotion, EmotionObservation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default emotion classification period, in frames.
pub const DEFAULT_CLASSIFY_EVERY_N: u64 = 2;

/// Tunables for a detection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum Euclidean distance for a positive identity match.
    pub match_threshold: f32,
    /// Run the emotion classifier on every n-th frame (0 behaves as 1).
    pub classify_every_n: u64,
    /// Persist a detection on every n-th frame (0 disables persistence).
    pub persist_every_n: u64,
    pub smoothing_capacity: usize,
    pub smoothing_scope: SmoothingScope,
    /// Drop mostly-black frames before face detection. Off by default:
    /// a dim frame can still hold a detectable face.
    pub skip_dark_frames: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            classify_every_n: DEFAULT_CLASSIFY_EVERY_N,
            persist_every_n: DEFAULT_PERSIST_EVERY_N,
            smoothing_capacity: DEFAULT_WINDOW_CAPACITY,
            smoothing_scope: SmoothingScope::Global,
            skip_dark_frames: false,
        }
    }
}

/// What the presentation layer shows for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayState {
    pub identity_id: Option<String>,
    /// `None` renders as "Unknown".
    pub identity_label: Option<String>,
    /// `None` renders as "-".
    pub emotion: Option<Emotion>,
    /// Percentage in [0, 100].
    pub recognition_confidence: Option<f32>,
    /// Fraction in [0, 1].
    pub emotion_confidence: Option<f32>,
    pub bbox: Option<BoundingBox>,
    /// Whether this face produced a detection record on this frame.
    pub persisted: bool,
}

impl DisplayState {
    pub fn unknown(bbox: Option<BoundingBox>) -> Self {
        Self {
            identity_id: None,
            identity_label: None,
            emotion: None,
            recognition_confidence: None,
            emotion_confidence: None,
            bbox,
            persisted: false,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity_id.is_some()
    }
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.identity_label, self.recognition_confidence) {
            (Some(name), Some(conf)) => write!(f, "{name} ({conf:.1}%)")?,
            (Some(name), None) => write!(f, "{name}")?,
            _ => f.write_str("Unknown")?,
        }
        match (self.emotion, self.emotion_confidence) {
            (Some(e), Some(conf)) => write!(f, " - {e} ({:.1}%)", conf * 100.0),
            (Some(e), None) => write!(f, " - {e}"),
            _ => f.write_str(" - -"),
        }
    }
}

/// Display update for one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub frame_index: u64,
    pub sequence: u32,
    /// Whether the emotion classifier ran on this frame.
    pub classified: bool,
    pub faces: Vec<DisplayState>,
}

/// Why a frame produced no display update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Dark,
    NoFace,
    ModelFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Report(FrameReport),
    Skipped(SkipReason),
}

/// Running counters for a detection session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub skipped: u64,
    pub recognized: u64,
    pub unknown: u64,
    pub persisted: u64,
    pub dropped_writes: u64,
}

/// Stateful per-session frame processor.
pub struct DetectionPipeline {
    config: PipelineConfig,
    matcher: Box<dyn Matcher>,
    cache: Arc<EmbeddingCache>,
    store: Arc<dyn IdentityStore>,
    smoother: EmotionSmoother,
    throttle: DetectionThrottle,
    frame_index: u64,
    stats: PipelineStats,
}

impl DetectionPipeline {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<EmbeddingCache>,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            smoother: EmotionSmoother::new(config.smoothing_scope, config.smoothing_capacity),
            throttle: DetectionThrottle::new(config.persist_every_n),
            matcher: Box::new(EuclideanMatcher),
            config,
            cache,
            store,
            frame_index: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Replace the default exhaustive matcher.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Index the next frame will get.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Run one frame through the pipeline.
    ///
    /// Frames without faces and face-model failures are skipped without
    /// touching any smoothing state. So are dark frames, when configured.
    pub fn process_frame(&mut self, frame: &Frame, models: &mut Models) -> FrameOutcome {
        let index = self.frame_index;
        self.frame_index += 1;
        self.stats.frames += 1;

        if self.config.skip_dark_frames && frame.is_dark {
            return self.skip(index, SkipReason::Dark);
        }

        let faces = match models.faces.detect_and_embed(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(frame = index, error = %e, "face analysis failed; skipping frame");
                return self.skip(index, SkipReason::ModelFailure);
            }
        };
        if faces.is_empty() {
            return self.skip(index, SkipReason::NoFace);
        }

        let snapshot = self.cache.current();
        let classify = index % self.config.classify_every_n.max(1) == 0;
        let persist_frame = self.throttle.should_persist(index);
        let mut persisted_ids: Vec<String> = Vec::new();
        let mut states = Vec::with_capacity(faces.len());

        for face in faces {
            let result = self
                .matcher
                .find(&face.embedding, &snapshot, self.config.match_threshold);

            let MatchResult::Matched {
                identity,
                distance,
                confidence,
            } = result
            else {
                self.stats.unknown += 1;
                tracing::debug!(frame = index, "unknown subject");
                states.push(DisplayState::unknown(Some(face.bbox)));
                continue;
            };
            self.stats.recognized += 1;

            let emotion = if classify {
                self.classify_and_smooth(frame, &face.bbox, &identity.id, models)
            } else {
                self.smoother.held(&identity.id)
            };

            let mut persisted = false;
            if persist_frame && !persisted_ids.contains(&identity.id) {
                if let Some(obs) = emotion {
                    persisted = self.persist(&identity.id, obs);
                    persisted_ids.push(identity.id.clone());
                }
            }

            tracing::debug!(
                frame = index,
                id = %identity.id,
                distance,
                confidence,
                emotion = ?emotion.map(|e| e.label),
                persisted,
                "recognized subject"
            );

            states.push(DisplayState {
                identity_id: Some(identity.id),
                identity_label: Some(identity.display_name),
                emotion: emotion.map(|e| e.label),
                recognition_confidence: Some(confidence),
                emotion_confidence: emotion.map(|e| e.confidence),
                bbox: Some(face.bbox),
                persisted,
            });
        }

        FrameOutcome::Report(FrameReport {
            frame_index: index,
            sequence: frame.sequence,
            classified: classify,
            faces: states,
        })
    }

    fn skip(&mut self, index: u64, reason: SkipReason) -> FrameOutcome {
        self.stats.skipped += 1;
        tracing::trace!(frame = index, ?reason, "frame skipped");
        FrameOutcome::Skipped(reason)
    }

    /// Classify the face crop and feed the smoother. Falls back to the held
    /// result when the crop is empty or the classifier fails.
    fn classify_and_smooth(
        &mut self,
        frame: &Frame,
        bbox: &BoundingBox,
        subject: &str,
        models: &mut Models,
    ) -> Option<EmotionObservation> {
        let Some(crop) = frame.crop(bbox) else {
            return self.smoother.held(subject);
        };

        match models.emotions.classify_emotion(&crop) {
            Ok(scores) => match scores.dominant() {
                Some(obs) => Some(self.smoother.observe(subject, obs.label, obs.confidence)),
                None => self.smoother.held(subject),
            },
            Err(e) => {
                tracing::warn!(error = %e, "emotion classification failed; holding previous result");
                self.smoother.held(subject)
            }
        }
    }

    /// Best-effort write: a failure is logged, counted and dropped.
    fn persist(&mut self, identity_id: &str, obs: EmotionObservation) -> bool {
        match self
            .store
            .append_detection(identity_id, obs.label, obs.confidence, Utc::now())
        {
            Ok(()) => {
                self.stats.persisted += 1;
                true
            }
            Err(e) => {
                self.stats.dropped_writes += 1;
                tracing::warn!(id = identity_id, error = %e, "detection write dropped");
                false
            }
        }
    }
}
