mod data;
mod device;
mod model;
mod summary;
mod training;

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use convtrack_core::{env_override, logging, set_experiment, RunArgs, Tracker};

use crate::{
    device::{select_device, TrainingBackend},
    training::TrainingConfig,
};

/// Every run of this binary is recorded under this experiment.
const EXPERIMENT_NAME: &str = "model-train";
const TRACKING_URI_VAR: &str = "MLFLOW_TRACKING_URI";

fn main() -> Result<()> {
    logging::init();
    set_experiment(EXPERIMENT_NAME)?;

    let args = RunArgs::parse_from_env()?;
    if args.help_requested() {
        print_usage();
        return Ok(());
    }

    let config_path = match args.config_path() {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = TrainingConfig::load(&config_path)?;
    if let Some(uri) = env_override(TRACKING_URI_VAR) {
        config.tracking_uri = uri;
    }

    println!(
        "running MNIST CNN in {} mode ({} epochs)",
        args.mode().label(),
        config.epochs_for(args.mode())
    );

    let (kind, device) = select_device();
    let tracker = Tracker::from_uri(&config.tracking_uri)
        .with_context(|| format!("failed to open tracking store {}", config.tracking_uri))?;
    tracing::info!(tracking_uri = %config.tracking_uri, device = %kind, "starting training");

    training::run::<TrainingBackend>(&config, args.mode(), device, &tracker)
}

fn print_usage() {
    println!(
        "Usage: cargo run -p convtrack-experiment-mnist-cnn -- [--mode full|test] [--config PATH]"
    );
    println!("Set {TRACKING_URI_VAR} to log to a tracking server instead of ./mlruns.");
}

fn default_config_path() -> Result<PathBuf> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("experiments/mnist_cnn");
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create experiment directory {}", dir.display()))?;
    Ok(dir.join("config.json"))
}
