use anyhow::{Context, Result};
use moodwatch_core::{EmbeddingCache, IdentityStore};
use moodwatch_models::ModelPaths;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod presentation;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "moodwatchd starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");
    if config.threshold_likely_too_strict() {
        tracing::warn!(
            match_threshold = config.match_threshold,
            suggested = config::ARCFACE_MATCH_THRESHOLD,
            "match_threshold is strict for ArcFace embeddings; most faces will show as Unknown"
        );
    }

    let store: Arc<dyn IdentityStore> = Arc::new(
        store::SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let cache = Arc::new(EmbeddingCache::new());
    match cache.rebuild(store.as_ref()) {
        Ok(snapshot) => tracing::info!(identities = snapshot.len(), "embedding cache loaded"),
        // start with an empty cache; RefreshCache retries
        Err(e) => tracing::warn!(error = %e, "embedding cache load failed"),
    }

    // Models are required; fail fast.
    let models = moodwatch_models::load_models(&ModelPaths::in_dir(&config.model_dir))
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;

    let board = Arc::new(presentation::StatusBoard::new());
    let orchestrator = engine::build_orchestrator(&config, models, store.clone(), cache, board.clone());
    let engine = engine::spawn_engine(orchestrator, engine::camera_opener(&config))?;

    let service = dbus_interface::MoodwatchService {
        engine: engine.clone(),
        store,
        board,
        model_dir: config.model_dir.display().to_string(),
    };

    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = dbus_interface::BUS_NAME, "moodwatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("moodwatchd shutting down");
    // end any running session cleanly; NotRunning errors are expected
    let _ = engine.stop_detection().await;
    let _ = engine.cancel_enrollment().await;

    Ok(())
}
