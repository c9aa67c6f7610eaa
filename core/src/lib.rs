pub mod config;
pub mod experiment;
pub mod logging;
pub mod metrics;
pub mod rng;
pub mod tracking;

pub use config::{env_override, load_or_init};
pub use experiment::{ExperimentMode, RunArgs};
pub use metrics::{EvaluationMetrics, MetricAccumulator, StepMetrics};
pub use rng::{permutation, seeded_rng};
pub use tracking::{set_experiment, ActiveRun, RunStatus, Tracker, TrackingError};
