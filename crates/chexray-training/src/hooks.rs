//! Per-epoch hooks.
//!
//! The fit loop calls every hook's [`EpochHook::on_epoch_end`] in list order
//! after the validation pass of each epoch. Hooks see the epoch's logs, the
//! compiled model and the run's [`TrainingState`].

use crate::checkpoint::{CheckpointSink, CheckpointStrategy};
use crate::error::TrainingResult;
use crate::model::BaseModel;
use crate::optimizer::TrainableModel;
use crate::state::TrainingState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

pub struct EpochContext<'a> {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub epochs: usize,
    /// Metrics of this epoch (`loss`, `val_loss`, `lr`, ...). Hooks may add entries.
    pub logs: &'a mut BTreeMap<String, f64>,
    pub model: &'a mut TrainableModel,
    pub state: &'a mut TrainingState,
}

pub trait EpochHook: Send {
    fn name(&self) -> &'static str;

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()>;
}

/// Writes the latest weights through the run's checkpoint strategy.
#[derive(Debug)]
pub struct CheckpointHook {
    strategy: CheckpointStrategy,
}

impl CheckpointHook {
    #[must_use]
    pub fn new(strategy: CheckpointStrategy) -> Self {
        Self { strategy }
    }
}

impl EpochHook for CheckpointHook {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
        self.strategy.save(ctx.model.graph().as_ref(), self.strategy.path())
    }
}

#[derive(Serialize)]
struct EpochRecord<'a> {
    timestamp: String,
    run: u32,
    epoch: usize,
    logs: &'a BTreeMap<String, f64>,
}

/// Logs each epoch and appends it to `logs/run<N>/epochs.jsonl`.
#[derive(Debug)]
pub struct ProgressLogHook {
    path: PathBuf,
    verbosity: u64,
}

impl ProgressLogHook {
    #[must_use]
    pub fn new(path: PathBuf, verbosity: u64) -> Self {
        Self { path, verbosity }
    }
}

impl EpochHook for ProgressLogHook {
    fn name(&self) -> &'static str {
        "progress_log"
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
        if self.verbosity > 0 {
            let metrics = ctx
                .logs
                .iter()
                .map(|(k, v)| format!("{k}={v:.6}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(run = ctx.state.run, "epoch {}/{}: {metrics}", ctx.epoch + 1, ctx.epochs);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = EpochRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            run: ctx.state.run,
            epoch: ctx.epoch + 1,
            logs: &*ctx.logs,
        };
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }
}

/// Scales the learning rate down when `val_loss` stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    monitor: &'static str,
    factor: f64,
    patience: usize,
    min_delta: f64,
    min_lr: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    #[must_use]
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            monitor: "val_loss",
            factor,
            patience,
            min_delta: 1e-4,
            min_lr,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Feed one observation; returns the new rate when it changed.
    pub fn observe(&mut self, current: f64, lr: f64) -> Option<f64> {
        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        if lr <= self.min_lr {
            return None;
        }
        Some((lr * self.factor).max(self.min_lr))
    }
}

impl EpochHook for ReduceLrOnPlateau {
    fn name(&self) -> &'static str {
        "reduce_lr_on_plateau"
    }

    fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
        let Some(current) = ctx.logs.get(self.monitor).copied() else {
            tracing::warn!("'{}' missing from epoch logs, learning rate unchanged", self.monitor);
            return Ok(());
        };
        let lr = ctx.model.learning_rate();
        if let Some(reduced) = self.observe(current, lr) {
            tracing::info!(epoch = ctx.epoch + 1, "{} plateaued, reducing learning rate {lr} -> {reduced}", self.monitor);
            ctx.model.set_learning_rate(reduced);
        }
        Ok(())
    }
}

/// Exports the base sub-model (architecture + weights, no head).
#[derive(Debug)]
pub struct BaseModelExportHook {
    base: Option<BaseModel>,
    path: PathBuf,
}

impl BaseModelExportHook {
    #[must_use]
    pub fn new(base: Option<BaseModel>, path: PathBuf) -> Self {
        if base.is_none() {
            tracing::warn!("model exposes no base sub-model; {} will not be written", path.display());
        }
        Self { base, path }
    }
}

impl EpochHook for BaseModelExportHook {
    fn name(&self) -> &'static str {
        "base_model_export"
    }

    fn on_epoch_end(&mut self, _ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
        if let Some(base) = &self.base {
            base.save(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut plateau = ReduceLrOnPlateau::new(0.1, 2, 0.0);
        assert_eq!(plateau.observe(1.0, 0.01), None);
        assert_eq!(plateau.observe(1.0, 0.01), None);
        let reduced = plateau.observe(1.0, 0.01).unwrap();
        assert!((reduced - 0.001).abs() < 1e-12);
        // Counter restarts after a reduction.
        assert_eq!(plateau.observe(1.0, reduced), None);
    }

    #[test]
    fn test_plateau_resets_on_improvement() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 1, 0.0);
        assert_eq!(plateau.observe(1.0, 0.1), None);
        assert_eq!(plateau.observe(0.5, 0.1), None);
        assert_eq!(plateau.observe(0.49999, 0.1), Some(0.05));
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut plateau = ReduceLrOnPlateau::new(0.1, 1, 0.005);
        plateau.observe(1.0, 0.01);
        assert_eq!(plateau.observe(1.0, 0.01), Some(0.005));
        assert_eq!(plateau.observe(1.0, 0.005), None);
    }
}
