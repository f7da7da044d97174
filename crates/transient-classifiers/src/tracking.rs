//! Evaluation metrics of the neural training loop and the sinks receiving them.
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// Metrics from one evaluation pass of the neural training loop.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub step: usize,
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

/// Receives the metrics of every evaluation. Sinks must not influence training.
pub trait MetricSink: Send {
    fn record(&mut self, metrics: &EvalMetrics);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn record(&mut self, _metrics: &EvalMetrics) {}
}

/// Forwards every evaluation to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn record(&mut self, metrics: &EvalMetrics) {
        log::info!(
            "[eval] step {}: train loss {:.4}, train acc {:.4}, val loss {:.4}, val acc {:.4}",
            metrics.step,
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );
    }
}

/// Keeps every record in a shared [`EvalHistory`], so the caller can inspect
/// it after the sink has been handed to a training loop.
#[derive(Debug, Clone, Default)]
pub struct HistorySink {
    history: Arc<Mutex<EvalHistory>>,
}

impl HistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> EvalHistory {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricSink for HistorySink {
    fn record(&mut self, metrics: &EvalMetrics) {
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push(metrics);
    }
}

/// Build a sink from its identifier. `None` yields a [`NoopSink`].
pub fn sink_from_identifier(identifier: Option<&str>) -> Result<Box<dyn MetricSink>> {
    match identifier {
        None | Some("none") | Some("noop") => Ok(Box::new(NoopSink)),
        Some("log") => Ok(Box::new(LogSink)),
        Some("history") => Ok(Box::new(HistorySink::new())),
        Some(other) => Err(ClassifierError::Configuration(format!(
            "Unknown metric sink: {}",
            other
        ))),
    }
}

/// Evaluation records in a struct-of-arrays layout.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct EvalHistory {
    pub steps: Vec<usize>,
    pub train_losses: Vec<f32>,
    pub train_accuracies: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub val_accuracies: Vec<f32>,
}

impl EvalHistory {
    pub fn push(&mut self, metrics: &EvalMetrics) {
        self.steps.push(metrics.step);
        self.train_losses.push(metrics.train_loss);
        self.train_accuracies.push(metrics.train_accuracy);
        self.val_losses.push(metrics.val_loss);
        self.val_accuracies.push(metrics.val_accuracy);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step and value of the lowest validation loss.
    pub fn best_validation(&self) -> Option<(usize, f32)> {
        self.val_losses
            .iter()
            .enumerate()
            .filter(|(_, loss)| loss.is_finite())
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, loss)| (self.steps[i], *loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(step: usize, val_loss: f32) -> EvalMetrics {
        EvalMetrics {
            step,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss,
            val_accuracy: 0.5,
        }
    }

    #[test]
    fn test_history_sink_shares_records() {
        let sink = HistorySink::new();
        let mut boxed: Box<dyn MetricSink> = Box::new(sink.clone());
        boxed.record(&metrics(0, 2.0));
        boxed.record(&metrics(10, 1.5));
        boxed.record(&metrics(20, 1.7));

        let history = sink.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.best_validation(), Some((10, 1.5)));
    }

    #[test]
    fn test_sink_from_identifier() {
        assert!(sink_from_identifier(None).is_ok());
        assert!(sink_from_identifier(Some("log")).is_ok());
        let err = sink_from_identifier(Some("wandb")).err().unwrap();
        assert!(err.to_string().contains("wandb"));
    }
}
