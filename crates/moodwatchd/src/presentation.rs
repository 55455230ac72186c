//! Latest session state, kept for D-Bus clients to poll.

use chrono::{DateTime, Utc};
use moodwatch_core::pipeline::{FrameReport, PipelineStats};
use moodwatch_core::session::{EndReason, EnrollmentOutcome, SessionKind};
use moodwatch_core::{PresentationSink, SessionEvent};
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrollmentProgress {
    pub captured: usize,
    pub required: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub kind: SessionKind,
    pub reason: EndReason,
    pub stats: Option<PipelineStats>,
    pub ended_at: DateTime<Utc>,
}

/// Everything a client needs to render the current view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub frame: Option<FrameReport>,
    /// One caption per face, e.g. `Ana (87.5%) - happy (64.0%)`.
    pub captions: Vec<String>,
    pub enrollment: Option<EnrollmentProgress>,
    pub last_enrollment: Option<EnrollmentOutcome>,
    pub last_session: Option<SessionSummary>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct StatusBoard {
    state: Mutex<BoardSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PresentationSink for StatusBoard {
    fn publish(&self, event: SessionEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.updated_at = Some(Utc::now());
        match event {
            SessionEvent::Frame(report) => {
                state.captions = report.faces.iter().map(|f| f.to_string()).collect();
                tracing::debug!(
                    frame = report.frame_index,
                    faces = ?state.captions,
                    "frame"
                );
                state.frame = Some(report);
            }
            SessionEvent::EnrollmentProgress { captured, required, .. } => {
                tracing::info!(captured, required, "enrollment sample captured");
                state.enrollment = Some(EnrollmentProgress { captured, required });
            }
            SessionEvent::EnrollmentFinished(outcome) => {
                match &outcome {
                    EnrollmentOutcome::Registered(identity) => {
                        tracing::info!(id = %identity.id, name = %identity.display_name, "enrollment finished")
                    }
                    EnrollmentOutcome::Failed { reason, .. } => {
                        tracing::warn!(%reason, "enrollment failed")
                    }
                }
                state.enrollment = None;
                state.last_enrollment = Some(outcome);
            }
            SessionEvent::SessionEnded { kind, reason, stats } => {
                if kind == SessionKind::Capturing {
                    state.enrollment = None;
                }
                state.frame = None;
                state.captions.clear();
                state.last_session = Some(SessionSummary {
                    kind,
                    reason,
                    stats,
                    ended_at: Utc::now(),
                });
            }
        }
    }
}
