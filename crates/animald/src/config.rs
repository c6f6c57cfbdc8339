use animal_core::oracle::{EmbeddingOutput, InputLayout};
use animal_core::postprocess::Separation;
use animal_core::settings::{OracleKind, PipelineSettings};
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Pipeline construction settings (models, variant, numeric policy).
    pub pipeline: PipelineSettings,
    /// Number of worker threads, each owning its own model sessions.
    pub workers: usize,
    /// Requests that may wait for a free worker before senders block.
    pub queue_depth: usize,
    /// How long a caller waits for its result. Zero disables the timeout.
    pub request_timeout_secs: u64,
    /// Directory holding persisted `<id>.json` results.
    pub results_dir: PathBuf,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `ANIMAL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ANIMAL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| animal_core::default_model_dir());

        let oracle = std::env::var("ANIMAL_ORACLE")
            .ok()
            .and_then(|v| match v.parse::<OracleKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring ANIMAL_ORACLE");
                    None
                }
            })
            .unwrap_or(OracleKind::Classifier);

        let mut pipeline = PipelineSettings::in_dir(model_dir, oracle);
        if let Some(p) = env_path("ANIMAL_DETECTOR_MODEL") {
            pipeline.detector_model = p;
        }
        if let Some(p) = env_path("ANIMAL_CLASSIFIER_MODEL") {
            pipeline.classifier_model = p;
        }
        if let Some(p) = env_path("ANIMAL_EMBEDDING_MODEL") {
            pipeline.embedding_model = p;
        }
        if let Some(p) = env_path("ANIMAL_PROTOTYPES") {
            pipeline.prototypes = p;
        }
        pipeline.labels = env_path("ANIMAL_LABELS");
        if let Ok(v) = std::env::var("ANIMAL_EMBEDDING_OUTPUT") {
            pipeline.embedding_output = EmbeddingOutput::parse(&v);
        }
        if let Ok(v) = std::env::var("ANIMAL_INPUT_LAYOUT") {
            match v.parse::<InputLayout>() {
                Ok(layout) => pipeline.layout = layout,
                Err(e) => tracing::warn!(error = %e, "ignoring ANIMAL_INPUT_LAYOUT"),
            }
        }
        pipeline.resize_limit = env_u32("ANIMAL_RESIZE_LIMIT", pipeline.resize_limit);
        pipeline.detector_threshold = env_opt_f32("ANIMAL_DETECTOR_THRESHOLD");
        if let Some(cap) = env_opt_f32("ANIMAL_SIMILARITY_CAP") {
            // Non-positive disables capping.
            pipeline.similarity_cap = (cap > 0.0).then_some(cap);
        }
        if env_bool("ANIMAL_SEPARATION", false) {
            pipeline.separation = Some(Separation::default());
        }

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("animalface");

        let results_dir = env_path("ANIMAL_RESULTS_DIR").unwrap_or_else(|| data_dir.join("results"));

        let bus = match std::env::var("ANIMAL_BUS").as_deref() {
            Ok("system") => Bus::System,
            _ => Bus::Session,
        };

        Self {
            pipeline,
            workers: env_usize("ANIMAL_WORKERS", 2).max(1),
            queue_depth: env_usize("ANIMAL_QUEUE_DEPTH", 16).max(1),
            request_timeout_secs: env_u64("ANIMAL_REQUEST_TIMEOUT_SECS", 30),
            results_dir,
            bus,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_opt_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
