use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use burn::{
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use convtrack_core::{
    load_or_init, ActiveRun, EvaluationMetrics, ExperimentMode, MetricAccumulator, StepMetrics,
    Tracker,
};
use serde::{Deserialize, Serialize};

use crate::{
    data::{self, BatchLoader, DigitItem},
    model::{CnnModel, CnnModelConfig},
    summary,
};

const LOSS_FUNCTION: &str = "CrossEntropyLoss";
const METRIC_FUNCTION: &str = "Accuracy";
const OPTIMIZER: &str = "Adam";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Parameter initialisation and batch shuffling.
    pub seed: u64,
    pub split_seed: u64,
    pub test_fraction: f64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub train_batch_size: usize,
    pub test_batch_size: usize,
    /// Batches between interim training metrics.
    pub log_interval: usize,
    pub tracking_uri: String,
    pub summary_file: PathBuf,
    /// Images used in test mode.
    pub smoke_samples: usize,
    pub smoke_epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            split_seed: 42,
            test_fraction: 1.0 / 7.0,
            epochs: 10,
            learning_rate: 1e-3,
            train_batch_size: 64,
            test_batch_size: 1000,
            log_interval: 100,
            tracking_uri: "file:./mlruns".to_owned(),
            summary_file: PathBuf::from("model_summary.txt"),
            smoke_samples: 1400,
            smoke_epochs: 1,
        }
    }
}

impl TrainingConfig {
    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_or_init(path, Self::default)?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.train_batch_size > 0, "train_batch_size must be at least 1");
        ensure!(self.test_batch_size > 0, "test_batch_size must be at least 1");
        ensure!(self.log_interval > 0, "log_interval must be at least 1");
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be a positive number, got {}",
            self.learning_rate
        );
        Ok(())
    }

    pub fn epochs_for(&self, mode: ExperimentMode) -> usize {
        mode.select(self.epochs, self.smoke_epochs)
    }

    /// Hyperparameters recorded on every run.
    pub fn hyperparameters(&self, epochs: usize) -> Vec<(&'static str, String)> {
        vec![
            ("epochs", epochs.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("train: batch_size", self.train_batch_size.to_string()),
            ("test: batch_size", self.test_batch_size.to_string()),
            ("loss_function", LOSS_FUNCTION.to_owned()),
            ("metric_function", METRIC_FUNCTION.to_owned()),
            ("optimizer", OPTIMIZER.to_owned()),
        ]
    }
}

/// Shuffled training batches and ordered test batches.
pub struct Loaders {
    pub train: BatchLoader,
    pub test: BatchLoader,
}

/// Fetch and prepare data, build the model, then train and evaluate inside one tracked run.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    mode: ExperimentMode,
    device: B::Device,
    tracker: &Tracker,
) -> Result<()> {
    let mut items = data::fetch_mnist();
    if mode == ExperimentMode::Test {
        items.truncate(config.smoke_samples);
    }
    let loaders = build_loaders(items, config)?;

    B::seed(config.seed);
    let model: CnnModel<B> = CnnModelConfig::new().init(&device);
    let epochs = config.epochs_for(mode);

    tracker.with_run(|run| fit(config, epochs, model, &loaders, &device, run))
}

pub fn build_loaders(items: Vec<DigitItem>, config: &TrainingConfig) -> Result<Loaders> {
    let partitions = data::prepare(items, config.test_fraction, config.split_seed)
        .context("failed to prepare dataset")?;

    Ok(Loaders {
        train: BatchLoader::shuffled(partitions.train, config.train_batch_size, config.seed),
        test: BatchLoader::new(partitions.test, config.test_batch_size),
    })
}

/// Log the run header, then alternate training and evaluation for `epochs`, with one more
/// evaluation at the end.
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    epochs: usize,
    mut model: CnnModel<B>,
    loaders: &Loaders,
    device: &B::Device,
    run: &ActiveRun,
) -> Result<()> {
    let mut optimizer = AdamConfig::new().init::<B, CnnModel<B>>();
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(device);
    let eval_loss_fn = CrossEntropyLossConfig::new().init::<B::InnerBackend>(device);

    run.log_params(config.hyperparameters(epochs))?;

    summary::write(&model, &config.summary_file)?;
    run.log_artifact(&config.summary_file)?;

    for epoch in 1..=epochs {
        model = train_epoch(
            model,
            device,
            &loss_fn,
            &loaders.train,
            &mut optimizer,
            config.learning_rate,
            epoch,
            config.log_interval,
            run,
        )?;
        test_epoch(&model.valid(), device, &eval_loss_fn, &loaders.test, run)?;
    }

    test_epoch(&model.valid(), device, &eval_loss_fn, &loaders.test, run)?;
    Ok(())
}

/// One pass over the training partition. Interim loss and running accuracy are logged every
/// `log_interval` batches, which must be non-zero; only the updated model is returned.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, O>(
    mut model: CnnModel<B>,
    device: &B::Device,
    loss_fn: &CrossEntropyLoss<B>,
    loader: &BatchLoader,
    optimizer: &mut O,
    learning_rate: f64,
    epoch: usize,
    log_interval: usize,
    run: &ActiveRun,
) -> Result<CnnModel<B>>
where
    B: AutodiffBackend,
    O: Optimizer<CnnModel<B>, B>,
{
    let num_items = loader.num_items();
    let num_batches = loader.num_batches();
    let mut progress = MetricAccumulator::new();

    for (batch_idx, batch) in loader.iter::<B>(device).enumerate() {
        let batch_len = batch.len();
        let output = model.forward(batch.images);
        let loss = loss_fn.forward(output.clone(), batch.labels.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(learning_rate, model, grads);

        let loss_value = loss.into_scalar().elem::<f64>();
        progress.record(loss_value, correct_predictions(output, batch.labels), batch_len);

        if batch_idx % log_interval == 0 {
            let point = StepMetrics {
                step: (epoch - 1) * num_batches + batch_idx,
                loss: loss_value,
                accuracy: progress.running_accuracy(num_items),
            };
            log_step(run, &point)?;

            println!(
                "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                epoch,
                batch_idx * loader.batch_size(),
                num_items,
                100.0 * batch_idx as f64 / num_batches as f64,
                loss_value
            );
        }
    }

    Ok(model)
}

/// Mean loss and accuracy over every batch of `loader`. Reads the model only.
pub fn evaluate_dataset<B: Backend>(
    model: &CnnModel<B>,
    device: &B::Device,
    loss_fn: &CrossEntropyLoss<B>,
    loader: &BatchLoader,
) -> EvaluationMetrics {
    let mut totals = MetricAccumulator::new();

    for batch in loader.iter::<B>(device) {
        let batch_len = batch.len();
        let output = model.forward(batch.images);
        let loss = loss_fn.forward(output.clone(), batch.labels.clone());

        totals.record(
            loss.into_scalar().elem::<f64>(),
            correct_predictions(output, batch.labels),
            batch_len,
        );
    }

    totals.finish()
}

/// Evaluate, then log `test_loss`/`test_accuracy` and print a summary line.
pub fn test_epoch<B: Backend>(
    model: &CnnModel<B>,
    device: &B::Device,
    loss_fn: &CrossEntropyLoss<B>,
    loader: &BatchLoader,
    run: &ActiveRun,
) -> Result<EvaluationMetrics> {
    let metrics = evaluate_dataset(model, device, loss_fn, loader);

    run.log_metric("test_loss", metrics.loss, None)?;
    run.log_metric("test_accuracy", metrics.accuracy, None)?;

    println!(
        "\nTest set: Average loss: {:.4}, Accuracy: {}/{} ({:.0}%)\n",
        metrics.loss,
        metrics.correct,
        metrics.total,
        metrics.percent()
    );

    Ok(metrics)
}

fn log_step(run: &ActiveRun, point: &StepMetrics) -> Result<()> {
    let step = point.step as i64;
    run.log_metric("loss", point.loss, Some(step))?;
    run.log_metric("accuracy", point.accuracy, Some(step))?;
    Ok(())
}

fn correct_predictions<B: Backend>(output: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> usize {
    output
        .argmax(1)
        .squeeze::<1>(1)
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}
