//! Capture sessions: one dedicated thread per active session, owning the
//! frame source, the models and its own stop flag.

use crate::cache::EmbeddingCache;
use crate::enrollment::{self, EnrollmentAccumulator};
use crate::frame::Frame;
use crate::models::Models;
use crate::pipeline::{DetectionPipeline, FrameOutcome, FrameReport, PipelineStats};
use crate::store::IdentityStore;
use crate::types::{BoundingBox, Identity, Registration};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The device is gone or cannot deliver frames; ends the session.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// A single frame was lost; the session carries on.
    #[error("frame dropped: {0}")]
    Dropped(String),
}

/// Anything that yields frames one at a time.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// What a session needs exclusive ownership of while it runs.
pub struct Resources<S> {
    pub source: S,
    pub models: Models,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Detecting,
    Capturing,
}

/// Why a session thread exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    Completed,
    DeviceLost(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentOutcome {
    Registered(Identity),
    Failed { reason: String, validation: bool },
}

/// Updates pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Frame(FrameReport),
    EnrollmentProgress {
        captured: usize,
        required: usize,
        bbox: BoundingBox,
    },
    EnrollmentFinished(EnrollmentOutcome),
    SessionEnded {
        kind: SessionKind,
        reason: EndReason,
        stats: Option<PipelineStats>,
    },
}

/// Receiver of session events. Called from the session thread.
pub trait PresentationSink: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Everything a capture (registration) session needs besides its resources.
pub struct EnrollmentJob {
    pub registration: Registration,
    pub accumulator: EnrollmentAccumulator,
    pub store: Arc<dyn IdentityStore>,
    pub cache: Arc<EmbeddingCache>,
    /// Pause between accepted samples so they are not near-duplicates.
    pub capture_interval: Duration,
}

pub enum SessionTask {
    Detect(DetectionPipeline),
    Enroll(EnrollmentJob),
}

impl SessionTask {
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionTask::Detect(_) => SessionKind::Detecting,
            SessionTask::Enroll(_) => SessionKind::Capturing,
        }
    }
}

/// Resources handed back when a session thread exits.
pub struct SessionExit<S> {
    pub resources: Resources<S>,
    pub reason: EndReason,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("session thread panicked")]
    Panicked,
}

/// Handle to a running session thread.
pub struct SessionHandle<S> {
    kind: SessionKind,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<SessionExit<S>>,
}

impl<S: FrameSource + 'static> SessionHandle<S> {
    /// Start `task` on a new thread. The thread loops until its stop flag
    /// is set, the task completes or the device fails.
    pub fn spawn(
        task: SessionTask,
        resources: Resources<S>,
        sink: Arc<dyn PresentationSink>,
    ) -> Result<Self, SessionError> {
        let kind = task.kind();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name(format!("moodwatch-{kind:?}").to_lowercase())
            .spawn(move || {
                tracing::info!(?kind, "session started");
                let mut resources = resources;
                let (reason, stats) = match task {
                    SessionTask::Detect(mut pipeline) => {
                        let reason = run_detection(&mut pipeline, &mut resources, &flag, sink.as_ref());
                        (reason, Some(pipeline.stats()))
                    }
                    SessionTask::Enroll(mut job) => {
                        (run_enrollment(&mut job, &mut resources, &flag, sink.as_ref()), None)
                    }
                };
                tracing::info!(?kind, ?reason, ?stats, "session ended");
                sink.publish(SessionEvent::SessionEnded {
                    kind,
                    reason: reason.clone(),
                    stats,
                });
                SessionExit { resources, reason }
            })?;

        Ok(Self { kind, stop, thread })
    }
}

impl<S> SessionHandle<S> {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the loop to stop after the frame in flight.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the session and wait for the thread to hand its resources back.
    pub fn stop(self) -> Result<SessionExit<S>, SessionError> {
        self.request_stop();
        self.join()
    }

    /// Wait for the thread without signalling it.
    pub fn join(self) -> Result<SessionExit<S>, SessionError> {
        self.thread.join().map_err(|_| SessionError::Panicked)
    }
}

fn next_frame<S: FrameSource>(source: &mut S) -> Result<Option<Frame>, EndReason> {
    match source.next_frame() {
        Ok(frame) => Ok(Some(frame)),
        Err(CaptureError::Dropped(msg)) => {
            tracing::debug!(reason = %msg, "frame dropped");
            Ok(None)
        }
        Err(CaptureError::DeviceUnavailable(msg)) => {
            tracing::error!(reason = %msg, "capture device lost");
            Err(EndReason::DeviceLost(msg))
        }
    }
}

fn run_detection<S: FrameSource>(
    pipeline: &mut DetectionPipeline,
    resources: &mut Resources<S>,
    stop: &AtomicBool,
    sink: &dyn PresentationSink,
) -> EndReason {
    while !stop.load(Ordering::Acquire) {
        let frame = match next_frame(&mut resources.source) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(reason) => return reason,
        };

        if let FrameOutcome::Report(report) = pipeline.process_frame(&frame, &mut resources.models) {
            sink.publish(SessionEvent::Frame(report));
        }
    }
    EndReason::Stopped
}

fn run_enrollment<S: FrameSource>(
    job: &mut EnrollmentJob,
    resources: &mut Resources<S>,
    stop: &AtomicBool,
    sink: &dyn PresentationSink,
) -> EndReason {
    job.accumulator.cancel();

    while !stop.load(Ordering::Acquire) {
        let frame = match next_frame(&mut resources.source) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(reason) => {
                job.accumulator.cancel();
                return reason;
            }
        };

        let faces = match resources.models.faces.detect_and_embed(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face analysis failed during enrollment");
                continue;
            }
        };
        let Some(face) = faces.into_iter().max_by(|a, b| {
            a.bbox
                .confidence
                .partial_cmp(&b.bbox.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            continue;
        };

        match job.accumulator.add_sample(face.embedding) {
            Ok(true) => {
                tracing::debug!(captured = job.accumulator.len(), "enrollment sample accepted");
                sink.publish(SessionEvent::EnrollmentProgress {
                    captured: job.accumulator.len(),
                    required: job.accumulator.required_count(),
                    bbox: face.bbox,
                });
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "enrollment sample rejected"),
        }

        if job.accumulator.is_complete() {
            let outcome = match enrollment::commit(
                &mut job.accumulator,
                &job.registration,
                job.store.as_ref(),
                &job.cache,
            ) {
                Ok(identity) => EnrollmentOutcome::Registered(identity),
                Err(e) => {
                    tracing::warn!(error = %e, "enrollment failed");
                    EnrollmentOutcome::Failed {
                        validation: e.is_validation(),
                        reason: e.to_string(),
                    }
                }
            };
            job.accumulator.cancel();
            sink.publish(SessionEvent::EnrollmentFinished(outcome));
            return EndReason::Completed;
        }

        if !job.capture_interval.is_zero() {
            std::thread::sleep(job.capture_interval);
        }
    }

    job.accumulator.cancel();
    EndReason::Stopped
}
