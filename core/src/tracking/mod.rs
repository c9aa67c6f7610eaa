//! MLflow-compatible experiment tracking.
//!
//! A [`Tracker`] wraps a [`TrackingStore`] (a local MLflow file store or a remote tracking server)
//! and hands out [`ActiveRun`] guards. Runs left open when the guard is dropped are marked failed.

mod file_store;
mod rest_store;
mod run;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use rand::{seq::SliceRandom, Rng};

pub use file_store::FileStore;
pub use rest_store::RestStore;
pub use run::ActiveRun;

/// Experiment used when none has been set for the process.
pub const DEFAULT_EXPERIMENT: &str = "Default";

const MAX_PARAM_VALUE_LEN: usize = 6000;
const MAX_KEY_LEN: usize = 250;

static EXPERIMENT: OnceLock<String> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("experiment is already set to '{current}', cannot switch to '{requested}'")]
    ExperimentAlreadySet { current: String, requested: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("param '{key}' is already logged as '{existing}', refusing to overwrite with '{value}'")]
    ParamConflict {
        key: String,
        existing: String,
        value: String,
    },

    #[error("value for param '{key}' is {len} characters, the limit is 6000")]
    ParamTooLong { key: String, len: usize },

    #[error("run '{0}' does not exist")]
    RunNotFound(String),

    #[error("artifact '{0}' is not a readable file")]
    InvalidArtifact(PathBuf),

    #[error("unsupported tracking uri '{0}'")]
    UnsupportedUri(String),

    #[error("tracking server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_yaml::Error),
}

pub type TrackingResult<T> = Result<T, TrackingError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    /// Numeric code used in file-store metadata.
    pub fn code(self) -> u8 {
        match self {
            Self::Running => 1,
            Self::Scheduled => 2,
            Self::Finished => 3,
            Self::Failed => 4,
            Self::Killed => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Running),
            2 => Some(Self::Scheduled),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            5 => Some(Self::Killed),
            _ => None,
        }
    }

    /// Name used by the REST API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Scheduled => "SCHEDULED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunInfo {
    pub run_id: String,
    pub run_name: String,
    pub experiment_id: String,
    pub artifact_uri: String,
    pub start_time: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}

/// Backend of a tracking service.
pub trait TrackingStore: Send + Sync {
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<String>;

    fn create_run(&self, experiment_id: &str, run_name: &str) -> TrackingResult<RunInfo>;

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()>;

    fn log_metric(&self, run_id: &str, metric: &Metric) -> TrackingResult<()>;

    fn log_artifact(&self, run_id: &str, local_path: &Path) -> TrackingResult<()>;

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> TrackingResult<()>;
}

/// Set the experiment every run in this process is recorded under.
///
/// The first call wins. Repeating the same name is accepted, a different name is an error.
pub fn set_experiment(name: &str) -> TrackingResult<()> {
    let current = EXPERIMENT.get_or_init(|| name.to_owned());
    if current == name {
        Ok(())
    } else {
        Err(TrackingError::ExperimentAlreadySet {
            current: current.clone(),
            requested: name.to_owned(),
        })
    }
}

pub fn active_experiment() -> &'static str {
    EXPERIMENT
        .get()
        .map(String::as_str)
        .unwrap_or(DEFAULT_EXPERIMENT)
}

#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn TrackingStore>,
}

impl Tracker {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self { store }
    }

    /// Build a tracker from an MLflow-style tracking uri: `http(s)://host`, `file:path`,
    /// `file:///abs/path`, or a bare path.
    pub fn from_uri(uri: &str) -> TrackingResult<Self> {
        let store: Arc<dyn TrackingStore> = match parse_uri(uri)? {
            StoreLocation::Server(url) => Arc::new(RestStore::new(url)?),
            StoreLocation::Directory(root) => Arc::new(FileStore::new(root)?),
        };
        Ok(Self::new(store))
    }

    /// Start a run in the process-wide experiment.
    pub fn start_run(&self) -> TrackingResult<ActiveRun> {
        self.start_run_in(active_experiment())
    }

    pub fn start_run_in(&self, experiment: &str) -> TrackingResult<ActiveRun> {
        let experiment_id = self.store.get_or_create_experiment(experiment)?;
        let info = self.store.create_run(&experiment_id, &generate_run_name())?;
        tracing::info!(
            run_id = %info.run_id,
            run_name = %info.run_name,
            experiment,
            "started tracked run"
        );
        Ok(ActiveRun::new(Arc::clone(&self.store), info))
    }

    /// Run `f` inside a tracked run in the process-wide experiment.
    ///
    /// The run is marked finished when `f` succeeds and failed when it errors or panics. Errors
    /// from `f` are returned unchanged.
    pub fn with_run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&ActiveRun) -> anyhow::Result<T>,
    {
        self.with_run_in(active_experiment(), f)
    }

    pub fn with_run_in<T, F>(&self, experiment: &str, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&ActiveRun) -> anyhow::Result<T>,
    {
        let run = self.start_run_in(experiment)?;
        match f(&run) {
            Ok(value) => {
                run.finish(RunStatus::Finished)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = run.finish(RunStatus::Failed) {
                    tracing::warn!(error = %end_err, "failed to mark run as failed");
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum StoreLocation {
    Server(String),
    Directory(PathBuf),
}

fn parse_uri(uri: &str) -> TrackingResult<StoreLocation> {
    let uri = uri.trim();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(StoreLocation::Server(uri.trim_end_matches('/').to_owned()));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(StoreLocation::Directory(PathBuf::from(path)));
    }
    if let Some(path) = uri.strip_prefix("file:") {
        return Ok(StoreLocation::Directory(PathBuf::from(path)));
    }
    if uri.is_empty() || uri.contains("://") {
        return Err(TrackingError::UnsupportedUri(uri.to_owned()));
    }
    Ok(StoreLocation::Directory(PathBuf::from(uri)))
}

/// Check a param or metric key against the characters tracking servers accept.
pub(crate) fn validate_key(key: &str) -> TrackingResult<()> {
    let invalid = |reason| {
        Err(TrackingError::InvalidKey {
            key: key.to_owned(),
            reason,
        })
    };

    if key.is_empty() {
        return invalid("key is empty");
    }
    if key.len() > MAX_KEY_LEN {
        return invalid("key is too long");
    }
    if key.starts_with('/') || key.split('/').any(|part| part == ".." || part == ".") {
        return invalid("key must be a relative path without '.' or '..' segments");
    }
    let allowed = |c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '/' | ':');
    if !key.chars().all(allowed) {
        return invalid("only alphanumerics, '_', '-', '.', ' ', '/' and ':' are allowed");
    }
    Ok(())
}

pub(crate) fn validate_param_value(key: &str, value: &str) -> TrackingResult<()> {
    let len = value.chars().count();
    if len > MAX_PARAM_VALUE_LEN {
        return Err(TrackingError::ParamTooLong {
            key: key.to_owned(),
            len,
        });
    }
    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const RUN_NAME_ADJECTIVES: &[&str] = &[
    "able", "bold", "brave", "bright", "calm", "clever", "crisp", "eager", "fair", "gentle",
    "glad", "keen", "lucky", "merry", "nimble", "quiet", "rare", "swift", "tidy", "warm",
];

const RUN_NAME_NOUNS: &[&str] = &[
    "ant", "bass", "crane", "deer", "eel", "finch", "gull", "hare", "ibis", "jay", "koi", "lark",
    "mole", "newt", "owl", "pike", "quail", "robin", "seal", "wren",
];

/// A human-friendly run name such as `brave-owl-417`.
pub fn generate_run_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = RUN_NAME_ADJECTIVES.choose(&mut rng).unwrap_or(&"quick");
    let noun = RUN_NAME_NOUNS.choose(&mut rng).unwrap_or(&"run");
    let number = rng.gen_range(0..1000);
    format!("{adjective}-{noun}-{number}")
}
