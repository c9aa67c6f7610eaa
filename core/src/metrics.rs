use serde::{Deserialize, Serialize};

/// An interim training point, logged every few batches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// Result of one pass over a held-out partition. `accuracy` is a fraction in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

impl EvaluationMetrics {
    pub fn percent(&self) -> f64 {
        self.accuracy * 100.0
    }
}

/// Sums per-example loss and correct predictions across batches.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch given its mean loss.
    pub fn record(&mut self, mean_loss: f64, correct: usize, batch_len: usize) {
        self.loss_sum += mean_loss * batch_len as f64;
        self.correct += correct;
        self.seen += batch_len;
    }

    /// Correct predictions so far relative to `total`, which may exceed what has been seen.
    pub fn running_accuracy(&self, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        self.correct as f64 / total as f64
    }

    pub fn finish(&self) -> EvaluationMetrics {
        if self.seen == 0 {
            return EvaluationMetrics {
                loss: 0.0,
                accuracy: 0.0,
                correct: 0,
                total: 0,
            };
        }

        EvaluationMetrics {
            loss: self.loss_sum / self.seen as f64,
            accuracy: self.correct as f64 / self.seen as f64,
            correct: self.correct,
            total: self.seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_batch_means_by_batch_size() {
        let mut acc = MetricAccumulator::new();
        acc.record(1.0, 3, 4);
        acc.record(4.0, 1, 1);

        let metrics = acc.finish();
        assert!((metrics.loss - 8.0 / 5.0).abs() < 1e-12);
        assert_eq!(metrics.correct, 4);
        assert_eq!(metrics.total, 5);
        assert!((metrics.accuracy - 0.8).abs() < 1e-12);
        assert!((metrics.percent() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn running_accuracy_uses_partition_size() {
        let mut acc = MetricAccumulator::new();
        acc.record(0.5, 10, 16);
        assert!((acc.running_accuracy(100) - 0.1).abs() < 1e-12);
        assert_eq!(acc.running_accuracy(0), 0.0);
    }

    #[test]
    fn empty_accumulator_reports_zeroes() {
        let metrics = MetricAccumulator::new().finish();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.loss, 0.0);
    }
}
