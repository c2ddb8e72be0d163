//! Per-class AUROC on the validation stream, tracked across epochs.
//!
//! A class whose score cannot be computed (for example, no positive example
//! in the evaluated batches) is recorded as NaN and left out of the mean.
//! Only [`TrainingError::Metric`] is absorbed this way; any other failure
//! aborts the epoch.

use crate::checkpoint::CheckpointSink;
use crate::dataset::BatchSequence;
use crate::error::{TrainingError, TrainingResult};
use crate::hooks::{EpochContext, EpochHook};
use crate::model::Model;
use crate::state::TrainingState;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Area under the ROC curve for one class.
///
/// Computed from the rank-sum statistic with tied scores sharing their
/// average rank.
pub fn class_auroc(class: &str, scores: &[f32], labels: &[f32]) -> TrainingResult<f64> {
    let undefined = |reason: &str| TrainingError::Metric { class: class.to_string(), reason: reason.to_string() };
    if scores.len() != labels.len() {
        return Err(undefined("score and label counts differ"));
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(undefined("non-finite prediction"));
    }

    let positives = labels.iter().filter(|l| **l > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(undefined("validation labels contain only one class"));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; a tie group shares the mean of its ranks.
        let rank = (start + end + 1) as f64 / 2.0;
        positive_rank_sum += rank * order[start..end].iter().filter(|i| labels[**i] > 0.5).count() as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Unweighted mean of the defined scores; NaN when none is defined.
#[must_use]
pub fn mean_auroc(scores: &[f64]) -> f64 {
    let defined: Vec<f64> = scores.iter().copied().filter(|s| !s.is_nan()).collect();
    if defined.is_empty() {
        return f64::NAN;
    }
    defined.iter().sum::<f64>() / defined.len() as f64
}

/// Epoch hook that scores the validation stream and keeps the best weights.
pub struct AurocEvaluator {
    validation: Arc<dyn BatchSequence>,
    steps: usize,
    class_names: Vec<String>,
    sink: Arc<dyn CheckpointSink>,
    best_weights_path: PathBuf,
    state_path: PathBuf,
    log_path: PathBuf,
    history: BTreeMap<String, Vec<f64>>,
}

impl AurocEvaluator {
    #[must_use]
    pub fn new(
        validation: Arc<dyn BatchSequence>,
        steps: usize,
        class_names: Vec<String>,
        sink: Arc<dyn CheckpointSink>,
        best_weights_path: PathBuf,
        state_path: PathBuf,
        log_path: PathBuf,
    ) -> Self {
        let history = class_names.iter().map(|c| (c.clone(), Vec::new())).collect();
        Self { validation, steps, class_names, sink, best_weights_path, state_path, log_path, history }
    }

    /// Per-class scores of every epoch so far, NaN where undefined.
    #[must_use]
    pub fn history(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.history
    }

    /// Score `model` on the first `steps` validation batches.
    pub fn score(&self, model: &dyn Model) -> TrainingResult<Vec<f64>> {
        let steps = self.steps.min(self.validation.len());
        let mut predictions: Vec<Vec<f32>> = Vec::new();
        let mut labels: Vec<Vec<f32>> = Vec::new();
        for index in 0..steps {
            let batch = self.validation.batch(index)?;
            predictions.extend(model.predict(&batch.images)?);
            labels.extend(batch.labels);
        }

        let mut scores = Vec::with_capacity(self.class_names.len());
        for (idx, class) in self.class_names.iter().enumerate() {
            let column = |rows: &[Vec<f32>]| rows.iter().map(|r| r.get(idx).copied().unwrap_or(f32::NAN)).collect::<Vec<_>>();
            match class_auroc(class, &column(&predictions), &column(&labels)) {
                Ok(score) => scores.push(score),
                Err(TrainingError::Metric { class, reason }) => {
                    tracing::warn!(class = %class, "AUROC undefined: {reason}");
                    scores.push(f64::NAN);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(scores)
    }

    /// Record one epoch's scores; saves best weights when the mean strictly
    /// improves on `state.best_mean_auroc`. Returns whether it did.
    pub fn record_epoch(
        &mut self,
        epoch: usize,
        scores: &[f64],
        model: &dyn Model,
        state: &mut TrainingState,
    ) -> TrainingResult<bool> {
        for (class, score) in self.class_names.iter().zip(scores) {
            tracing::info!(epoch = epoch + 1, "{class}: {score:.4}");
            self.history.entry(class.clone()).or_default().push(*score);
        }

        let mean = mean_auroc(scores);
        tracing::info!(epoch = epoch + 1, "mean AUROC: {mean:.4}");
        let improved = mean > state.best_mean_auroc;
        if !improved {
            return Ok(false);
        }

        tracing::info!(
            "mean AUROC improved from {:.4} to {mean:.4}, saving {}",
            state.best_mean_auroc,
            self.best_weights_path.display()
        );
        state.best_mean_auroc = mean;
        self.sink.save(model, &self.best_weights_path)?;
        state.save(&self.state_path)?;

        let per_class = self
            .class_names
            .iter()
            .zip(scores)
            .map(|(class, score)| format!("{class}={score:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut log = std::fs::OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        writeln!(
            log,
            "{} (run {} epoch {}) mean_auroc={mean:.6} lr={} {per_class}",
            chrono::Utc::now().to_rfc3339(),
            state.run,
            epoch + 1,
            state.lr
        )?;
        Ok(true)
    }
}

impl EpochHook for AurocEvaluator {
    fn name(&self) -> &'static str {
        "auroc"
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
        ctx.state.lr = ctx.model.learning_rate();
        let graph = Arc::clone(ctx.model.graph());
        let scores = self.score(graph.as_ref())?;
        // Undefined means are logged too, so the series stays indexed by epoch.
        ctx.logs.insert("mean_auroc".to_string(), mean_auroc(&scores));
        if !self.record_epoch(ctx.epoch, &scores, graph.as_ref(), ctx.state)? {
            // Keep the persisted lr current for a resume after a crash.
            ctx.state.save(&self.state_path)?;
        }
        Ok(())
    }
}
