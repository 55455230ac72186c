//! moodwatch-core — identity matching, enrollment and emotion smoothing.
//!
//! Everything here is hardware- and model-agnostic: frames come in through
//! [`session::FrameSource`], inference through the traits in [`models`],
//! and persistence through [`store::IdentityStore`].

pub mod cache;
pub mod codec;
pub mod enrollment;
pub mod frame;
pub mod matcher;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod session;
pub mod smoother;
pub mod store;
pub mod throttle;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{EmbeddingCache, IdentityRef, Snapshot};
pub use frame::Frame;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use models::{DetectedFace, EmotionClassifier, FaceAnalyzer, ModelError, Models};
pub use orchestrator::{Mode, Orchestrator, OrchestratorError, OrchestratorSettings};
pub use pipeline::{DetectionPipeline, DisplayState, PipelineConfig};
pub use session::{CaptureError, FrameSource, PresentationSink, SessionEvent};
pub use store::{IdentityStore, MemoryStore, StoreError};
pub use types::{
    BoundingBox, DetectionRecord, Embedding, Emotion, EmotionObservation, EmotionScores, Identity,
    Registration,
};
