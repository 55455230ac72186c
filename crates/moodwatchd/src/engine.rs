//! Engine thread: owns the orchestrator (and through it the camera and the
//! models) and serves requests from the D-Bus handlers.

use crate::config::Config;
use moodwatch_core::{
    EmbeddingCache, FrameSource, IdentityStore, Mode, Models, Orchestrator, OrchestratorError,
    PresentationSink, Registration,
};
use moodwatch_core::cache::CacheError;
use moodwatch_hw::{Camera, CameraError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("cache refresh failed: {0}")]
    Cache(#[from] CacheError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Camera status as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatus {
    pub mode: Mode,
    pub camera_ready: bool,
    pub camera_error: Option<String>,
    pub identities_cached: usize,
}

enum EngineRequest {
    StartDetection(oneshot::Sender<Result<(), EngineError>>),
    StopDetection(oneshot::Sender<Result<(), EngineError>>),
    StartEnrollment {
        registration: Registration,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CancelEnrollment(oneshot::Sender<Result<(), EngineError>>),
    RefreshCache(oneshot::Sender<Result<usize, EngineError>>),
    Status(oneshot::Sender<EngineStatus>),
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn start_detection(&self) -> Result<(), EngineError> {
        self.call(EngineRequest::StartDetection).await?
    }

    pub async fn stop_detection(&self) -> Result<(), EngineError> {
        self.call(EngineRequest::StopDetection).await?
    }

    pub async fn start_enrollment(&self, registration: Registration) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::StartEnrollment { registration, reply })
            .await?
    }

    pub async fn cancel_enrollment(&self) -> Result<(), EngineError> {
        self.call(EngineRequest::CancelEnrollment).await?
    }

    pub async fn refresh_cache(&self) -> Result<usize, EngineError> {
        self.call(EngineRequest::RefreshCache).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(EngineRequest::Status).await
    }
}

/// Opens the capture device. Boxed so tests can run the engine without
/// hardware.
pub type OpenSource<S> = Box<dyn FnMut() -> Result<S, String> + Send>;

/// Camera opener for the configured V4L2 device, including warmup.
pub fn camera_opener(config: &Config) -> OpenSource<Camera> {
    let device = config.camera_device.clone();
    let (width, height, warmup) = (config.camera_width, config.camera_height, config.warmup_frames);
    Box::new(move || {
        let open = || -> Result<Camera, CameraError> {
            let mut camera = Camera::open(&device, width, height)?;
            camera.warm_up(warmup)?;
            Ok(camera)
        };
        open().map_err(|e| e.to_string())
    })
}

/// Spawn the engine on a dedicated OS thread. The camera is opened on that
/// thread after startup; a failure is reported through [`EngineStatus`]
/// and retried on the next start request.
pub fn spawn_engine<S: FrameSource + 'static>(
    mut orchestrator: Orchestrator<S>,
    mut open_source: OpenSource<S>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("moodwatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            attach(&mut orchestrator, &mut open_source);

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::StartDetection(reply) => {
                        ensure_source(&mut orchestrator, &mut open_source);
                        let _ = reply.send(orchestrator.start_detection().map_err(Into::into));
                    }
                    EngineRequest::StopDetection(reply) => {
                        let _ = reply.send(orchestrator.stop_detection().map_err(Into::into));
                    }
                    EngineRequest::StartEnrollment { registration, reply } => {
                        ensure_source(&mut orchestrator, &mut open_source);
                        let _ = reply.send(orchestrator.start_enrollment(registration).map_err(Into::into));
                    }
                    EngineRequest::CancelEnrollment(reply) => {
                        let _ = reply.send(orchestrator.cancel_enrollment().map_err(Into::into));
                    }
                    EngineRequest::RefreshCache(reply) => {
                        let _ = reply.send(orchestrator.refresh_cache().map_err(Into::into));
                    }
                    EngineRequest::Status(reply) => {
                        let _ = reply.send(EngineStatus {
                            mode: orchestrator.mode(),
                            camera_ready: orchestrator.device_ready(),
                            camera_error: orchestrator.device_error().map(str::to_string),
                            identities_cached: orchestrator.cache().current().len(),
                        });
                    }
                }
            }

            orchestrator.shutdown();
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn attach<S: FrameSource + 'static>(orchestrator: &mut Orchestrator<S>, open_source: &mut OpenSource<S>) {
    match open_source() {
        Ok(source) => orchestrator.attach_source(source),
        Err(reason) => orchestrator.device_failed(reason),
    }
}

/// Reopen the camera if it was never opened or was lost.
fn ensure_source<S: FrameSource + 'static>(orchestrator: &mut Orchestrator<S>, open_source: &mut OpenSource<S>) {
    if orchestrator.mode() == Mode::Idle && !orchestrator.device_ready() {
        attach(orchestrator, open_source);
    }
}

/// Build the orchestrator from config and shared state.
pub fn build_orchestrator<S: FrameSource + 'static>(
    config: &Config,
    models: Models,
    store: Arc<dyn IdentityStore>,
    cache: Arc<EmbeddingCache>,
    sink: Arc<dyn PresentationSink>,
) -> Orchestrator<S> {
    Orchestrator::new(config.orchestrator_settings(), models, store, cache, sink)
}
