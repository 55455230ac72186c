use crate::engine::{EngineError, EngineHandle};
use crate::presentation::StatusBoard;
use chrono::{DateTime, Duration, Utc};
use moodwatch_core::store::StoreError;
use moodwatch_core::{IdentityStore, OrchestratorError, Registration};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.moodwatch.Daemon1";
pub const OBJECT_PATH: &str = "/org/moodwatch/Daemon1";

/// D-Bus interface for the moodwatch daemon. All payloads are JSON strings.
pub struct MoodwatchService {
    pub engine: EngineHandle,
    pub store: Arc<dyn IdentityStore>,
    pub board: Arc<StatusBoard>,
    pub model_dir: String,
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    match e {
        EngineError::Orchestrator(OrchestratorError::Enrollment(inner)) if inner.is_validation() => {
            Error::InvalidArgs(inner.to_string())
        }
        EngineError::Orchestrator(OrchestratorError::NotRunning(_)) => Error::Failed(e.to_string()),
        other => {
            tracing::warn!(error = %other, "request failed");
            Error::Failed(other.to_string())
        }
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    if e.is_validation() {
        zbus::fdo::Error::InvalidArgs(e.to_string())
    } else {
        tracing::warn!(error = %e, "store request failed");
        zbus::fdo::Error::Failed(e.to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Empty string means "everyone".
fn identity_filter(identity_id: &str) -> Option<String> {
    let id = identity_id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Start of a `days`-long history window ending now; 0 means no limit.
fn history_start(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    if days == 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        now - Duration::days(i64::from(days))
    }
}

impl MoodwatchService {
    /// Run a blocking store call off the async executor.
    async fn with_store<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IdentityStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(store_error)
    }

    async fn require_identity(&self, id: &Option<String>) -> zbus::fdo::Result<()> {
        let Some(id) = id.clone() else {
            return Ok(());
        };
        let found = self.with_store(move |s| s.get_identity(&id)).await?;
        match found {
            Some(_) => Ok(()),
            None => Err(zbus::fdo::Error::InvalidArgs("unknown identity".into())),
        }
    }
}

#[interface(name = "org.moodwatch.Daemon1")]
impl MoodwatchService {
    async fn start_detection(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_detection requested");
        self.engine.start_detection().await.map_err(engine_error)?;
        Ok(r#"{"mode":"detecting"}"#.into())
    }

    async fn stop_detection(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_detection requested");
        self.engine.stop_detection().await.map_err(engine_error)?;
        to_json(&self.board.snapshot().last_session)
    }

    /// Begin capturing samples for a new identity.
    async fn start_enrollment(&self, name: &str, email: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, email, "start_enrollment requested");
        self.engine
            .start_enrollment(Registration::new(name, email))
            .await
            .map_err(engine_error)?;
        Ok(r#"{"mode":"capturing"}"#.into())
    }

    async fn cancel_enrollment(&self) -> zbus::fdo::Result<String> {
        tracing::info!("cancel_enrollment requested");
        self.engine.cancel_enrollment().await.map_err(engine_error)?;
        Ok(r#"{"mode":"idle"}"#.into())
    }

    /// Latest frame captions, enrollment progress and last results.
    async fn current_state(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_error)?;
        let snapshot = self.board.snapshot();
        to_json(&serde_json::json!({
            "mode": status.mode,
            "board": snapshot,
        }))
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.with_store(|s| s.list_all()).await?;
        to_json(&identities)
    }

    /// Detections for one identity (or everyone, for an empty id) over the
    /// last `days` days; 0 days returns the full history.
    async fn history(&self, identity_id: &str, days: u32) -> zbus::fdo::Result<String> {
        let id = identity_filter(identity_id);
        self.require_identity(&id).await?;
        let since = history_start(days, Utc::now());
        let records = self
            .with_store(move |s| s.query_detections(id.as_deref(), since))
            .await?;
        to_json(&records)
    }

    /// Detection count per emotion label.
    async fn stats(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let id = identity_filter(identity_id);
        self.require_identity(&id).await?;
        let counts = self.with_store(move |s| s.emotion_stats(id.as_deref())).await?;
        let total: u64 = counts.values().sum();
        to_json(&serde_json::json!({ "total": total, "counts": counts }))
    }

    /// Reload embeddings from the database. Returns the cached identity count.
    async fn refresh_cache(&self) -> zbus::fdo::Result<String> {
        let count = self.engine.refresh_cache().await.map_err(engine_error)?;
        tracing::info!(count, "cache refreshed");
        to_json(&serde_json::json!({ "identities": count }))
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_error)?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": status.mode,
            "camera_ready": status.camera_ready,
            "camera_error": status.camera_error,
            "identities_cached": status.identities_cached,
            "model_dir": self.model_dir,
            "last_session": self.board.snapshot().last_session,
        }))
    }
}
