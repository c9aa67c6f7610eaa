use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{
    now_millis, validate_key, validate_param_value, Metric, RunInfo, RunStatus, TrackingError,
    TrackingResult, TrackingStore, DEFAULT_EXPERIMENT,
};

const META_FILE: &str = "meta.yaml";
const DEFAULT_EXPERIMENT_ID: &str = "0";
const SOURCE_TYPE_LOCAL: u8 = 4;

/// A tracking store laid out like MLflow's `mlruns` directory, readable by the MLflow UI.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    artifact_location: String,
    creation_time: i64,
    experiment_id: String,
    last_update_time: i64,
    lifecycle_stage: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    artifact_uri: String,
    end_time: Option<i64>,
    entry_point_name: String,
    experiment_id: String,
    lifecycle_stage: String,
    run_id: String,
    run_name: String,
    run_uuid: String,
    source_name: String,
    source_type: u8,
    source_version: String,
    start_time: i64,
    status: u8,
    tags: Vec<String>,
    user_id: String,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> TrackingResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            root: fs::canonicalize(&root)?,
        };
        if !store.experiment_dir(DEFAULT_EXPERIMENT_ID).exists() {
            store.write_experiment(DEFAULT_EXPERIMENT_ID, DEFAULT_EXPERIMENT)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a run's params, metrics, tags and artifacts.
    pub fn run_dir(&self, run_id: &str) -> TrackingResult<PathBuf> {
        for experiment_id in self.experiment_ids()? {
            let candidate = self.experiment_dir(&experiment_id).join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(TrackingError::RunNotFound(run_id.to_owned()))
    }

    pub fn run_status(&self, run_id: &str) -> TrackingResult<Option<RunStatus>> {
        let meta = self.read_run_meta(run_id)?;
        Ok(RunStatus::from_code(meta.status))
    }

    pub fn read_param(&self, run_id: &str, key: &str) -> TrackingResult<Option<String>> {
        let path = self.run_dir(run_id)?.join("params").join(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Every value recorded for `key`, in logging order.
    pub fn metric_history(&self, run_id: &str, key: &str) -> TrackingResult<Vec<Metric>> {
        let path = self.run_dir(run_id)?.join("metrics").join(key);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(path)?;
        let history = contents
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let timestamp = parts.next()?.parse().ok()?;
                let value = parts.next()?.parse().ok()?;
                let step = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                Some(Metric {
                    key: key.to_owned(),
                    value,
                    timestamp,
                    step,
                })
            })
            .collect();
        Ok(history)
    }

    fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    fn experiment_ids(&self) -> TrackingResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(META_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_experiment(&self, experiment_id: &str, name: &str) -> TrackingResult<()> {
        let dir = self.experiment_dir(experiment_id);
        fs::create_dir_all(&dir)?;
        let now = now_millis();
        let meta = ExperimentMeta {
            artifact_location: file_uri(&dir),
            creation_time: now,
            experiment_id: experiment_id.to_owned(),
            last_update_time: now,
            lifecycle_stage: "active".to_owned(),
            name: name.to_owned(),
        };
        fs::write(dir.join(META_FILE), serde_yaml::to_string(&meta)?)?;
        Ok(())
    }

    fn read_run_meta(&self, run_id: &str) -> TrackingResult<RunMeta> {
        let path = self.run_dir(run_id)?.join(META_FILE);
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_run_meta(&self, run_dir: &Path, meta: &RunMeta) -> TrackingResult<()> {
        fs::write(run_dir.join(META_FILE), serde_yaml::to_string(meta)?)?;
        Ok(())
    }

    fn write_tag(&self, run_dir: &Path, key: &str, value: &str) -> TrackingResult<()> {
        let path = run_dir.join("tags").join(key);
        fs::write(path, value)?;
        Ok(())
    }
}

impl TrackingStore for FileStore {
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<String> {
        let ids = self.experiment_ids()?;
        for id in &ids {
            let meta_path = self.experiment_dir(id).join(META_FILE);
            let meta: ExperimentMeta = serde_yaml::from_str(&fs::read_to_string(meta_path)?)?;
            if meta.name == name && meta.lifecycle_stage == "active" {
                return Ok(meta.experiment_id);
            }
        }

        let next_id = ids
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1)
            .to_string();
        self.write_experiment(&next_id, name)?;
        tracing::info!(experiment = name, experiment_id = %next_id, "created experiment");
        Ok(next_id)
    }

    fn create_run(&self, experiment_id: &str, run_name: &str) -> TrackingResult<RunInfo> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = self.experiment_dir(experiment_id).join(&run_id);
        for sub in ["artifacts", "metrics", "params", "tags"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }

        let user = env::var("USER").unwrap_or_else(|_| "unknown".to_owned());
        let source = env::args().next().unwrap_or_default();
        let info = RunInfo {
            run_id: run_id.clone(),
            run_name: run_name.to_owned(),
            experiment_id: experiment_id.to_owned(),
            artifact_uri: file_uri(&run_dir.join("artifacts")),
            start_time: now_millis(),
        };
        let meta = RunMeta {
            artifact_uri: info.artifact_uri.clone(),
            end_time: None,
            entry_point_name: String::new(),
            experiment_id: experiment_id.to_owned(),
            lifecycle_stage: "active".to_owned(),
            run_id: run_id.clone(),
            run_name: run_name.to_owned(),
            run_uuid: run_id,
            source_name: String::new(),
            source_type: SOURCE_TYPE_LOCAL,
            source_version: String::new(),
            start_time: info.start_time,
            status: RunStatus::Running.code(),
            tags: Vec::new(),
            user_id: user.clone(),
        };
        self.write_run_meta(&run_dir, &meta)?;
        self.write_tag(&run_dir, "mlflow.runName", run_name)?;
        self.write_tag(&run_dir, "mlflow.user", &user)?;
        self.write_tag(&run_dir, "mlflow.source.name", &source)?;
        self.write_tag(&run_dir, "mlflow.source.type", "LOCAL")?;

        Ok(info)
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_key(key)?;
        validate_param_value(key, value)?;

        let path = self.run_dir(run_id)?.join("params").join(key);
        if path.exists() {
            let existing = fs::read_to_string(&path)?;
            if existing == value {
                return Ok(());
            }
            return Err(TrackingError::ParamConflict {
                key: key.to_owned(),
                existing,
                value: value.to_owned(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, value)?;
        Ok(())
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> TrackingResult<()> {
        validate_key(&metric.key)?;

        let path = self.run_dir(run_id)?.join("metrics").join(&metric.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{} {} {}", metric.timestamp, metric.value, metric.step)?;
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, local_path: &Path) -> TrackingResult<()> {
        let file_name = match local_path.file_name() {
            Some(name) if local_path.is_file() => name,
            _ => return Err(TrackingError::InvalidArtifact(local_path.to_path_buf())),
        };
        let target = self.run_dir(run_id)?.join("artifacts").join(file_name);
        fs::copy(local_path, target)?;
        Ok(())
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> TrackingResult<()> {
        let run_dir = self.run_dir(run_id)?;
        let mut meta = self.read_run_meta(run_id)?;
        meta.status = status.code();
        if status != RunStatus::Running {
            meta.end_time = Some(end_time);
        }
        self.write_run_meta(&run_dir, &meta)
    }
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}
