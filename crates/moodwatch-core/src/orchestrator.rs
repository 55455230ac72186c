//! Mode state machine: `Idle`, `Detecting` or `Capturing`, with a single
//! session owning the camera at any time.

use crate::cache::{CacheError, EmbeddingCache};
use crate::enrollment::{EnrollmentAccumulator, EnrollmentError, DEFAULT_REQUIRED_SAMPLES};
use crate::models::Models;
use crate::pipeline::{DetectionPipeline, PipelineConfig};
use crate::session::{
    EndReason, EnrollmentJob, FrameSource, PresentationSink, Resources, SessionError,
    SessionExit, SessionHandle, SessionKind, SessionTask,
};
use crate::store::IdentityStore;
use crate::types::Registration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera is busy with a {0:?} session")]
    Busy(SessionKind),
    #[error("no {0:?} session is running")]
    NotRunning(SessionKind),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Detecting,
    Capturing,
}

impl From<SessionKind> for Mode {
    fn from(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Detecting => Mode::Detecting,
            SessionKind::Capturing => Mode::Capturing,
        }
    }
}

/// Orchestrator settings beyond the per-frame pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub pipeline: PipelineConfig,
    pub required_samples: usize,
    pub capture_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            required_samples: DEFAULT_REQUIRED_SAMPLES,
            capture_interval: Duration::from_millis(100),
        }
    }
}

enum Slot<S> {
    Idle { source: Option<S>, models: Models },
    Running(SessionHandle<S>),
    /// A session thread failed to start or panicked and took the camera and
    /// models with it; `device_error` says which.
    Broken,
}

/// Owns the camera and models between sessions and hands them to exactly
/// one session at a time.
pub struct Orchestrator<S> {
    settings: OrchestratorSettings,
    store: Arc<dyn IdentityStore>,
    cache: Arc<EmbeddingCache>,
    sink: Arc<dyn PresentationSink>,
    slot: Slot<S>,
    device_error: Option<String>,
}

impl<S: FrameSource + 'static> Orchestrator<S> {
    pub fn new(
        settings: OrchestratorSettings,
        models: Models,
        store: Arc<dyn IdentityStore>,
        cache: Arc<EmbeddingCache>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            settings,
            store,
            cache,
            sink,
            slot: Slot::Idle {
                source: None,
                models,
            },
            device_error: None,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Hand over a freshly opened camera. Ignored while a session runs.
    pub fn attach_source(&mut self, camera: S) {
        match &mut self.slot {
            Slot::Idle { source, .. } => {
                *source = Some(camera);
                self.device_error = None;
                tracing::info!("capture device attached");
            }
            _ => tracing::warn!("capture device attached while busy; ignoring"),
        }
    }

    /// Record that opening the camera failed.
    pub fn device_failed(&mut self, reason: String) {
        tracing::error!(%reason, "capture device unavailable");
        self.device_error = Some(reason);
    }

    pub fn device_ready(&mut self) -> bool {
        self.reap();
        matches!(self.slot, Slot::Idle { source: Some(_), .. } | Slot::Running(_))
    }

    pub fn device_error(&self) -> Option<&str> {
        self.device_error.as_deref()
    }

    /// Current mode, after collecting any session that ended on its own.
    pub fn mode(&mut self) -> Mode {
        self.reap();
        match &self.slot {
            Slot::Running(handle) => handle.kind().into(),
            _ => Mode::Idle,
        }
    }

    pub fn start_detection(&mut self) -> Result<(), OrchestratorError> {
        let pipeline = DetectionPipeline::new(
            self.settings.pipeline.clone(),
            self.cache.clone(),
            self.store.clone(),
        );
        self.start(SessionTask::Detect(pipeline))
    }

    pub fn start_enrollment(&mut self, registration: Registration) -> Result<(), OrchestratorError> {
        if let Some(field) = registration.missing_field() {
            return Err(EnrollmentError::MissingField(field).into());
        }
        let job = EnrollmentJob {
            registration,
            accumulator: EnrollmentAccumulator::new(self.settings.required_samples),
            store: self.store.clone(),
            cache: self.cache.clone(),
            capture_interval: self.settings.capture_interval,
        };
        self.start(SessionTask::Enroll(job))
    }

    pub fn stop_detection(&mut self) -> Result<(), OrchestratorError> {
        self.stop(SessionKind::Detecting)
    }

    pub fn cancel_enrollment(&mut self) -> Result<(), OrchestratorError> {
        self.stop(SessionKind::Capturing)
    }

    /// Stop whatever is running.
    pub fn shutdown(&mut self) {
        self.reap();
        if let Slot::Running(handle) = &self.slot {
            let kind = handle.kind();
            if let Err(e) = self.stop(kind) {
                tracing::warn!(error = %e, "session did not stop cleanly");
            }
        }
    }

    /// Rebuild the embedding cache from the store.
    pub fn refresh_cache(&self) -> Result<usize, CacheError> {
        Ok(self.cache.rebuild(self.store.as_ref())?.len())
    }

    fn start(&mut self, task: SessionTask) -> Result<(), OrchestratorError> {
        self.reap();
        match std::mem::replace(&mut self.slot, Slot::Broken) {
            Slot::Running(handle) => {
                let kind = handle.kind();
                self.slot = Slot::Running(handle);
                Err(OrchestratorError::Busy(kind))
            }
            Slot::Idle {
                source: Some(source),
                models,
            } => {
                let kind = task.kind();
                let handle = SessionHandle::spawn(task, Resources { source, models }, self.sink.clone());
                match handle {
                    Ok(handle) => {
                        tracing::info!(?kind, "session scheduled");
                        self.slot = Slot::Running(handle);
                        Ok(())
                    }
                    // the closure owning the resources was dropped with the failed spawn
                    Err(e) => {
                        self.lost_resources(&e);
                        Err(e.into())
                    }
                }
            }
            Slot::Idle {
                source: None,
                models,
            } => {
                self.slot = Slot::Idle {
                    source: None,
                    models,
                };
                Err(OrchestratorError::DeviceUnavailable(
                    self.device_error
                        .clone()
                        .unwrap_or_else(|| "camera not initialized yet".to_string()),
                ))
            }
            Slot::Broken => Err(OrchestratorError::DeviceUnavailable(
                self.device_error
                    .clone()
                    .unwrap_or_else(|| "camera and models unavailable; restart the daemon".to_string()),
            )),
        }
    }

    fn stop(&mut self, kind: SessionKind) -> Result<(), OrchestratorError> {
        self.reap();
        match std::mem::replace(&mut self.slot, Slot::Broken) {
            Slot::Running(handle) if handle.kind() == kind => {
                let exit = handle.stop();
                self.restore(exit)
            }
            other => {
                self.slot = other;
                Err(OrchestratorError::NotRunning(kind))
            }
        }
    }

    /// Collect a session thread that exited by itself (completed enrollment,
    /// lost device).
    fn reap(&mut self) {
        if !matches!(&self.slot, Slot::Running(h) if h.is_finished()) {
            return;
        }
        if let Slot::Running(handle) = std::mem::replace(&mut self.slot, Slot::Broken) {
            if let Err(e) = self.restore(handle.join()) {
                tracing::error!(error = %e, "session ended abnormally");
            }
        }
    }

    fn restore(
        &mut self,
        exit: Result<SessionExit<S>, SessionError>,
    ) -> Result<(), OrchestratorError> {
        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => {
                self.lost_resources(&e);
                return Err(e.into());
            }
        };
        let source = match exit.reason {
            EndReason::DeviceLost(reason) => {
                // drop the dead device; it must be reopened
                self.device_error = Some(reason);
                None
            }
            EndReason::Stopped | EndReason::Completed => Some(exit.resources.source),
        };
        self.slot = Slot::Idle {
            source,
            models: exit.resources.models,
        };
        Ok(())
    }

    fn lost_resources(&mut self, cause: &SessionError) {
        tracing::error!(error = %cause, "camera and models lost with the session thread");
        self.slot = Slot::Broken;
        self.device_error = Some(format!("{cause}; camera and models lost, restart the daemon"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::models::{DetectedFace, FaceAnalyzer, ModelError};
    use crate::session::{EnrollmentOutcome, SessionEvent};
    use crate::store::MemoryStore;
    use crate::testing::{face_at, models, FakeCamera, FakeClassifier, FakeFaces, RecordingSink};
    use crate::types::Emotion;

    fn orchestrator(
        faces: FakeFaces,
        required_samples: usize,
    ) -> (Orchestrator<FakeCamera>, Arc<RecordingSink>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let settings = OrchestratorSettings {
            required_samples,
            capture_interval: Duration::ZERO,
            ..OrchestratorSettings::default()
        };
        let orch = Orchestrator::new(
            settings,
            models(faces, FakeClassifier::sequence(vec![(Emotion::Neutral, 0.8)])),
            store.clone(),
            Arc::new(EmbeddingCache::new()),
            sink.clone(),
        );
        (orch, sink, store)
    }

    fn wait_for_idle(orch: &mut Orchestrator<FakeCamera>) {
        for _ in 0..2000 {
            if orch.mode() == Mode::Idle {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("session never finished");
    }

    #[test]
    fn test_start_without_camera_is_device_unavailable() {
        let (mut orch, _, _) = orchestrator(FakeFaces::always(vec![]), 3);
        assert!(matches!(orch.start_detection(), Err(OrchestratorError::DeviceUnavailable(_))));

        orch.device_failed("/dev/video0: no such device".into());
        match orch.start_detection() {
            Err(OrchestratorError::DeviceUnavailable(msg)) => assert!(msg.contains("/dev/video0")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(orch.mode(), Mode::Idle);
    }

    #[test]
    fn test_one_session_at_a_time() {
        let (mut orch, _, _) = orchestrator(FakeFaces::always(vec![]), 3);
        orch.attach_source(FakeCamera::new());
        orch.start_detection().unwrap();
        assert_eq!(orch.mode(), Mode::Detecting);

        let err = orch
            .start_enrollment(Registration::new("Ana", "ana@example.com"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Busy(SessionKind::Detecting)));
        assert!(matches!(orch.cancel_enrollment(), Err(OrchestratorError::NotRunning(_))));

        orch.stop_detection().unwrap();
        assert_eq!(orch.mode(), Mode::Idle);
        assert!(orch.device_ready());

        // camera came back; it can be reused
        orch.start_detection().unwrap();
        orch.shutdown();
        assert_eq!(orch.mode(), Mode::Idle);
    }

    #[test]
    fn test_enrollment_completes_and_returns_to_idle() {
        let (mut orch, sink, store) =
            orchestrator(FakeFaces::always(vec![face_at(vec![0.5, 0.5])]), 2);
        orch.attach_source(FakeCamera::new());
        orch.start_enrollment(Registration::new("Ana", "ana@example.com")).unwrap();
        wait_for_idle(&mut orch);

        assert_eq!(store.list_all().unwrap().len(), 1);
        assert_eq!(orch.cache().current().len(), 1);
        assert!(sink.snapshot().iter().any(|e| matches!(
            e,
            SessionEvent::EnrollmentFinished(EnrollmentOutcome::Registered(_))
        )));

        // the new identity is recognized right away
        orch.start_detection().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        orch.stop_detection().unwrap();
        let recognized = sink.snapshot().iter().any(|e| match e {
            SessionEvent::Frame(r) => r.faces.iter().any(|f| f.identity_label.as_deref() == Some("Ana")),
            _ => false,
        });
        assert!(recognized);
    }

    #[test]
    fn test_invalid_registration_rejected_up_front() {
        let (mut orch, _, _) = orchestrator(FakeFaces::always(vec![]), 3);
        orch.attach_source(FakeCamera::new());
        let err = orch.start_enrollment(Registration::new("Ana", " ")).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Enrollment(EnrollmentError::MissingField("email"))
        ));
        assert_eq!(orch.mode(), Mode::Idle);
    }

    #[test]
    fn test_cancel_enrollment() {
        let (mut orch, _, store) = orchestrator(FakeFaces::always(vec![]), 3);
        orch.attach_source(FakeCamera::new());
        orch.start_enrollment(Registration::new("Ana", "ana@example.com")).unwrap();
        assert_eq!(orch.mode(), Mode::Capturing);
        orch.cancel_enrollment().unwrap();
        assert_eq!(orch.mode(), Mode::Idle);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_device_loss_detaches_camera() {
        let (mut orch, _, _) = orchestrator(FakeFaces::always(vec![]), 3);
        orch.attach_source(FakeCamera::failing_at(3));
        orch.start_detection().unwrap();
        wait_for_idle(&mut orch);
        assert!(!orch.device_ready());
        assert_eq!(orch.device_error(), Some("unplugged"));
        assert!(matches!(orch.start_detection(), Err(OrchestratorError::DeviceUnavailable(_))));
    }

    struct PanickingFaces;

    impl FaceAnalyzer for PanickingFaces {
        fn detect_and_embed(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, ModelError> {
            panic!("model runtime aborted");
        }
    }

    #[test]
    fn test_crashed_session_reports_cause() {
        let mut orch = Orchestrator::new(
            OrchestratorSettings::default(),
            Models::new(
                Box::new(PanickingFaces),
                Box::new(FakeClassifier::sequence(vec![(Emotion::Neutral, 0.8)])),
            ),
            Arc::new(MemoryStore::new()),
            Arc::new(EmbeddingCache::new()),
            Arc::new(RecordingSink::default()),
        );
        orch.attach_source(FakeCamera::new());
        orch.start_detection().unwrap();
        wait_for_idle(&mut orch);

        assert!(!orch.device_ready());
        let cause = orch.device_error().unwrap().to_string();
        assert!(cause.contains("panicked"), "{cause}");
        match orch.start_detection() {
            Err(OrchestratorError::DeviceUnavailable(msg)) => assert_eq!(msg, cause),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
