use std::{collections::HashMap, fs, path::Path, sync::Mutex, time::Duration};

use reqwest::{blocking::Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use super::{
    now_millis, validate_key, validate_param_value, Metric, RunInfo, RunStatus, TrackingError,
    TrackingResult, TrackingStore,
};

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACTS_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";

/// A tracking store backed by an MLflow tracking server.
pub struct RestStore {
    base_url: String,
    client: Client,
    artifact_roots: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentPayload,
}

#[derive(Debug, Deserialize)]
struct ExperimentPayload {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunPayload,
}

#[derive(Debug, Deserialize)]
struct RunPayload {
    info: RunInfoPayload,
}

#[derive(Debug, Deserialize)]
struct RunInfoPayload {
    run_id: String,
    #[serde(default)]
    run_name: String,
    experiment_id: String,
    #[serde(default)]
    artifact_uri: String,
    #[serde(default, deserialize_with = "int_or_string")]
    start_time: i64,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    run_name: &'a str,
    start_time: i64,
    tags: Vec<Tag<'a>>,
}

#[derive(Debug, Serialize)]
struct Tag<'a> {
    key: &'a str,
    value: &'a str,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>) -> TrackingResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
            artifact_roots: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, path)
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> TrackingResult<R> {
        let response = self.client.post(self.endpoint(path)).json(body).send()?;
        decode(response.status(), &response.text()?)
    }

    fn artifact_url(&self, run_id: &str, file_name: &str) -> TrackingResult<String> {
        let roots = self
            .artifact_roots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let artifact_uri = roots
            .get(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_owned()))?;
        let relative = artifact_uri
            .strip_prefix(PROXIED_ARTIFACT_SCHEME)
            .ok_or_else(|| TrackingError::UnsupportedUri(artifact_uri.clone()))?
            .trim_start_matches('/');
        Ok(format!(
            "{}/{}/{}/{}",
            self.base_url, ARTIFACTS_PREFIX, relative, file_name
        ))
    }
}

impl TrackingStore for RestStore {
    fn get_or_create_experiment(&self, name: &str) -> TrackingResult<String> {
        let response = self
            .client
            .get(self.endpoint("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()?;
        let status = response.status();
        let body = response.text()?;

        match decode::<GetExperimentResponse>(status, &body) {
            Ok(found) => Ok(found.experiment.experiment_id),
            Err(TrackingError::Server { .. }) if is_missing_resource(status, &body) => {
                let created: CreateExperimentResponse =
                    self.post("experiments/create", &json!({ "name": name }))?;
                tracing::info!(experiment = name, experiment_id = %created.experiment_id, "created experiment");
                Ok(created.experiment_id)
            }
            Err(err) => Err(err),
        }
    }

    fn create_run(&self, experiment_id: &str, run_name: &str) -> TrackingResult<RunInfo> {
        let request = CreateRunRequest {
            experiment_id,
            run_name,
            start_time: now_millis(),
            tags: vec![
                Tag {
                    key: "mlflow.runName",
                    value: run_name,
                },
                Tag {
                    key: "mlflow.source.type",
                    value: "LOCAL",
                },
            ],
        };
        let created: CreateRunResponse = self.post("runs/create", &request)?;
        let info = run_info_from(created.run.info, run_name);

        self.artifact_roots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(info.run_id.clone(), info.artifact_uri.clone());
        Ok(info)
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> TrackingResult<()> {
        validate_key(key)?;
        validate_param_value(key, value)?;
        let _: serde_json::Value = self.post(
            "runs/log-parameter",
            &json!({ "run_id": run_id, "key": key, "value": value }),
        )?;
        Ok(())
    }

    fn log_metric(&self, run_id: &str, metric: &Metric) -> TrackingResult<()> {
        validate_key(&metric.key)?;
        let _: serde_json::Value = self.post("runs/log-metric", &metric_payload(run_id, metric))?;
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, local_path: &Path) -> TrackingResult<()> {
        let file_name = match local_path.file_name() {
            Some(name) if local_path.is_file() => name.to_string_lossy().into_owned(),
            _ => return Err(TrackingError::InvalidArtifact(local_path.to_path_buf())),
        };
        let url = self.artifact_url(run_id, &file_name)?;
        let response = self.client.put(url).body(fs::read(local_path)?).send()?;
        let _: serde_json::Value = decode(response.status(), &response.text()?)?;
        Ok(())
    }

    fn update_run(&self, run_id: &str, status: RunStatus, end_time: i64) -> TrackingResult<()> {
        let _: serde_json::Value = self.post(
            "runs/update",
            &json!({ "run_id": run_id, "status": status.as_str(), "end_time": end_time }),
        )?;
        Ok(())
    }
}

fn run_info_from(payload: RunInfoPayload, requested_name: &str) -> RunInfo {
    RunInfo {
        run_name: if payload.run_name.is_empty() {
            requested_name.to_owned()
        } else {
            payload.run_name
        },
        run_id: payload.run_id,
        experiment_id: payload.experiment_id,
        artifact_uri: payload.artifact_uri,
        start_time: payload.start_time,
    }
}

fn metric_payload(run_id: &str, metric: &Metric) -> serde_json::Value {
    json!({
        "run_id": run_id,
        "key": metric.key,
        "value": double_value(metric.value),
        "timestamp": metric.timestamp,
        "step": metric.step,
    })
}

/// JSON has no NaN or infinity; the server's protobuf parser takes them as strings.
fn double_value(value: f64) -> serde_json::Value {
    if value.is_nan() {
        json!("NaN")
    } else if value.is_infinite() {
        json!(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        json!(value)
    }
}

fn decode<R: DeserializeOwned>(status: StatusCode, body: &str) -> TrackingResult<R> {
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorResponse>(body)
            .map(|err| format!("{}: {}", err.error_code, err.message))
            .unwrap_or_else(|_| body.to_owned());
        return Err(TrackingError::Server {
            status: status.as_u16(),
            message,
        });
    }

    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|err| TrackingError::Server {
        status: status.as_u16(),
        message: format!("unexpected response body: {err}"),
    })
}

fn is_missing_resource(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    serde_json::from_str::<ErrorResponse>(body)
        .map(|err| err.error_code == RESOURCE_DOES_NOT_EXIST)
        .unwrap_or(false)
}

/// Servers encode int64 fields as JSON strings.
fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Str(value) => value.parse().map_err(serde::de::Error::custom),
    }
}
