use std::{fmt::Display, path::Path, sync::Arc};

use super::{now_millis, Metric, RunInfo, RunStatus, TrackingResult, TrackingStore};

/// An open run. Dropping it without calling [`ActiveRun::finish`] marks the run failed.
pub struct ActiveRun {
    store: Arc<dyn TrackingStore>,
    info: RunInfo,
    ended: bool,
}

impl ActiveRun {
    pub(super) fn new(store: Arc<dyn TrackingStore>, info: RunInfo) -> Self {
        Self {
            store,
            info,
            ended: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn log_param(&self, key: &str, value: impl Display) -> TrackingResult<()> {
        self.store
            .log_param(&self.info.run_id, key, &value.to_string())
    }

    pub fn log_params<'a, I>(&self, params: I) -> TrackingResult<()>
    where
        I: IntoIterator<Item = (&'a str, String)>,
    {
        for (key, value) in params {
            self.log_param(key, value)?;
        }
        Ok(())
    }

    /// Log a scalar. Metrics without a step are recorded at step 0.
    pub fn log_metric(&self, key: &str, value: f64, step: Option<i64>) -> TrackingResult<()> {
        let metric = Metric {
            key: key.to_owned(),
            value,
            timestamp: now_millis(),
            step: step.unwrap_or(0),
        };
        self.store.log_metric(&self.info.run_id, &metric)
    }

    pub fn log_artifact(&self, local_path: &Path) -> TrackingResult<()> {
        self.store.log_artifact(&self.info.run_id, local_path)?;
        tracing::info!(path = %local_path.display(), run_id = %self.info.run_id, "logged artifact");
        Ok(())
    }

    /// Record the final status. If the store rejects the update the run is still open and
    /// dropping it marks it failed.
    pub fn finish(mut self, status: RunStatus) -> TrackingResult<()> {
        let end_time = now_millis();
        self.store.update_run(&self.info.run_id, status, end_time)?;
        self.ended = true;
        tracing::info!(
            run_id = %self.info.run_id,
            %status,
            duration_ms = end_time - self.info.start_time,
            "ended tracked run"
        );
        Ok(())
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(err) = self
            .store
            .update_run(&self.info.run_id, RunStatus::Failed, now_millis())
        {
            tracing::warn!(run_id = %self.info.run_id, error = %err, "failed to close abandoned run");
        } else {
            tracing::warn!(run_id = %self.info.run_id, "run dropped while open, marked failed");
        }
    }
}
