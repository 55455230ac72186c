use moodwatch_core::smoother::SmoothingScope;
use moodwatch_core::{OrchestratorSettings, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration: built-in defaults, then the TOML file named by
/// `MOODWATCH_CONFIG`, then `MOODWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after opening the camera while exposure settles.
    pub warmup_frames: usize,
    /// Directory holding the ONNX model files.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    /// Maximum embedding distance for a positive match. Depends on the
    /// embedding model; tune it against enrolled faces. The bundled ArcFace
    /// model emits unit-length vectors, where same-person distances sit
    /// around 0.8 to 1.1; start from [`ARCFACE_MATCH_THRESHOLD`].
    pub match_threshold: f32,
    pub required_samples: usize,
    pub smoothing_capacity: usize,
    pub smoothing_scope: SmoothingScope,
    pub classify_every_n: u64,
    pub persist_every_n: u64,
    pub enrollment_interval_ms: u64,
    /// Drop near-black frames before detection.
    pub skip_dark_frames: bool,
}

/// Starting point for `match_threshold` with unit-length ArcFace embeddings.
pub const ARCFACE_MATCH_THRESHOLD: f32 = 1.1;

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let pipeline = PipelineConfig::default();
        let settings = OrchestratorSettings::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("moodwatch.db"),
            match_threshold: pipeline.match_threshold,
            required_samples: settings.required_samples,
            smoothing_capacity: pipeline.smoothing_capacity,
            smoothing_scope: pipeline.smoothing_scope,
            classify_every_n: pipeline.classify_every_n,
            persist_every_n: pipeline.persist_every_n,
            enrollment_interval_ms: settings.capture_interval.as_millis() as u64,
            skip_dark_frames: pipeline.skip_dark_frames,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("MOODWATCH_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlay `MOODWATCH_*` variables. Unparseable values are ignored with
    /// a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(lookup);
        env.set("MOODWATCH_CAMERA_DEVICE", &mut self.camera_device);
        env.set("MOODWATCH_CAMERA_WIDTH", &mut self.camera_width);
        env.set("MOODWATCH_CAMERA_HEIGHT", &mut self.camera_height);
        env.set("MOODWATCH_WARMUP_FRAMES", &mut self.warmup_frames);
        env.set("MOODWATCH_MODEL_DIR", &mut self.model_dir);
        env.set("MOODWATCH_DB_PATH", &mut self.db_path);
        env.set("MOODWATCH_MATCH_THRESHOLD", &mut self.match_threshold);
        env.set("MOODWATCH_REQUIRED_SAMPLES", &mut self.required_samples);
        env.set("MOODWATCH_SMOOTHING_CAPACITY", &mut self.smoothing_capacity);
        env.set("MOODWATCH_CLASSIFY_EVERY_N", &mut self.classify_every_n);
        env.set("MOODWATCH_PERSIST_EVERY_N", &mut self.persist_every_n);
        env.set("MOODWATCH_ENROLLMENT_INTERVAL_MS", &mut self.enrollment_interval_ms);
        env.set("MOODWATCH_SKIP_DARK_FRAMES", &mut self.skip_dark_frames);
        if let Some(scope) = (env.0)("MOODWATCH_SMOOTHING_SCOPE") {
            match scope.to_ascii_lowercase().replace('-', "_").as_str() {
                "global" => self.smoothing_scope = SmoothingScope::Global,
                "per_identity" => self.smoothing_scope = SmoothingScope::PerIdentity,
                other => tracing::warn!(value = other, "ignoring MOODWATCH_SMOOTHING_SCOPE"),
            }
        }
    }

    /// Whether `match_threshold` looks too strict for unit-length
    /// embeddings, where almost every distance exceeds it.
    pub fn threshold_likely_too_strict(&self) -> bool {
        self.match_threshold < ARCFACE_MATCH_THRESHOLD * 0.75
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            pipeline: PipelineConfig {
                match_threshold: self.match_threshold,
                classify_every_n: self.classify_every_n,
                persist_every_n: self.persist_every_n,
                smoothing_capacity: self.smoothing_capacity,
                smoothing_scope: self.smoothing_scope,
                skip_dark_frames: self.skip_dark_frames,
            },
            required_samples: self.required_samples,
            capture_interval: Duration::from_millis(self.enrollment_interval_ms),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("moodwatch")
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn set<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.required_samples, 3);
        assert_eq!(config.smoothing_capacity, 5);
        assert_eq!(config.classify_every_n, 2);
        assert_eq!(config.persist_every_n, 15);
        assert_eq!(config.enrollment_interval_ms, 100);
        assert_eq!(config.smoothing_scope, SmoothingScope::Global);
        assert!(!config.skip_dark_frames);
        assert!(config.db_path.ends_with("moodwatch/moodwatch.db"));
    }

    #[test]
    fn test_toml_overrides_some_keys() {
        let config: Config = toml::from_str(
            r#"
            camera_device = "/dev/video2"
            match_threshold = 1.1
            smoothing_scope = "per_identity"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.match_threshold, 1.1);
        assert_eq!(config.smoothing_scope, SmoothingScope::PerIdentity);
        assert_eq!(config.persist_every_n, 15);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MOODWATCH_PERSIST_EVERY_N", "30"),
            ("MOODWATCH_DB_PATH", "/var/lib/moodwatch/db.sqlite"),
            ("MOODWATCH_REQUIRED_SAMPLES", "many"),
            ("MOODWATCH_SMOOTHING_SCOPE", "Per-Identity"),
            ("MOODWATCH_SKIP_DARK_FRAMES", "true"),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.persist_every_n, 30);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/moodwatch/db.sqlite"));
        assert_eq!(config.required_samples, 3);
        assert_eq!(config.smoothing_scope, SmoothingScope::PerIdentity);
        assert!(config.skip_dark_frames);
    }

    #[test]
    fn test_default_threshold_flagged_for_arcface() {
        assert!(Config::default().threshold_likely_too_strict());
        let tuned = Config {
            match_threshold: ARCFACE_MATCH_THRESHOLD,
            ..Config::default()
        };
        assert!(!tuned.threshold_likely_too_strict());
    }

    #[test]
    fn test_orchestrator_settings() {
        let config = Config {
            enrollment_interval_ms: 250,
            classify_every_n: 3,
            ..Config::default()
        };
        let settings = config.orchestrator_settings();
        assert_eq!(settings.capture_interval, Duration::from_millis(250));
        assert_eq!(settings.pipeline.classify_every_n, 3);
        assert!(!settings.pipeline.skip_dark_frames);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/moodwatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
