//! The training loop.
//!
//! Batches are produced by a pool of blocking workers that pull from the
//! training sequence by index and push into a bounded channel; the loop
//! consumes them in arrival order. After each epoch's validation pass the
//! epoch hooks run in list order.

use crate::dataset::{Batch, BatchSequence, ClassWeights};
use crate::error::{TrainingError, TrainingResult};
use crate::history::History;
use crate::hooks::{EpochContext, EpochHook};
use crate::optimizer::TrainableModel;
use crate::state::TrainingState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FitOptions {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub workers: usize,
    pub max_queue_size: usize,
    pub verbose: u64,
}

pub async fn fit(
    model: &mut TrainableModel,
    train: Arc<dyn BatchSequence>,
    validation: Arc<dyn BatchSequence>,
    class_weights: &ClassWeights,
    options: &FitOptions,
    hooks: &mut [&mut dyn EpochHook],
    state: &mut TrainingState,
) -> TrainingResult<History> {
    if train.is_empty() {
        return Err(TrainingError::Trainer("training stream has no batches".to_string()));
    }
    if validation.is_empty() {
        return Err(TrainingError::Trainer("validation stream has no batches".to_string()));
    }

    let class_weights = Arc::new(class_weights.clone());
    let mut history = History::default();
    for epoch in 0..options.epochs {
        let lr = model.learning_rate();
        let loss = train_epoch(model, &train, &class_weights, options).await?;
        let val_loss = validate(model, validation.as_ref(), &class_weights, options.validation_steps)?;

        let mut logs = BTreeMap::from([
            ("loss".to_string(), loss),
            ("val_loss".to_string(), val_loss),
            ("lr".to_string(), lr),
        ]);
        {
            let mut ctx = EpochContext {
                epoch,
                epochs: options.epochs,
                logs: &mut logs,
                model: &mut *model,
                state: &mut *state,
            };
            for hook in hooks.iter_mut() {
                tracing::debug!(hook = hook.name(), epoch = epoch + 1, "running epoch hook");
                hook.on_epoch_end(&mut ctx)?;
            }
        }
        history.record(&logs);
    }
    Ok(history)
}

async fn train_epoch(
    model: &mut TrainableModel,
    train: &Arc<dyn BatchSequence>,
    class_weights: &Arc<ClassWeights>,
    options: &FitOptions,
) -> TrainingResult<f64> {
    let steps = options.steps_per_epoch;
    let workers = options.workers.clamp(1, steps.max(1));
    let (tx, mut rx) = mpsc::channel::<TrainingResult<Batch>>(options.max_queue_size.max(1));

    for worker in 0..workers {
        let tx = tx.clone();
        let train = Arc::clone(train);
        tokio::task::spawn_blocking(move || {
            // Steps past the end of the sequence wrap around to its start.
            for step in (worker..steps).step_by(workers) {
                let batch = train.batch(step % train.len());
                let failed = batch.is_err();
                if tx.blocking_send(batch).is_err() || failed {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut seen = 0usize;
    let mut weighted_loss = 0.0;
    while let Some(batch) = rx.recv().await {
        let batch = batch?;
        let loss = model.train_on_batch(&batch, class_weights)?;
        weighted_loss += loss * batch.len() as f64;
        seen += batch.len();
    }
    if seen == 0 {
        return Err(TrainingError::Trainer("no training batch was produced".to_string()));
    }
    Ok(weighted_loss / seen as f64)
}

fn validate(
    model: &TrainableModel,
    validation: &dyn BatchSequence,
    class_weights: &ClassWeights,
    steps: usize,
) -> TrainingResult<f64> {
    let mut seen = 0usize;
    let mut weighted_loss = 0.0;
    for index in 0..steps.min(validation.len()) {
        let batch = validation.batch(index)?;
        weighted_loss += model.test_on_batch(&batch, class_weights)? * batch.len() as f64;
        seen += batch.len();
    }
    Ok(weighted_loss / seen.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetProvider, SyntheticDataset};
    use crate::model::{BuildRequest, ClassMode, ColorMode, MlpModelProvider, ModelProvider, WeightSource};

    struct CountingHook {
        name: &'static str,
        calls: Vec<(usize, &'static str)>,
    }

    impl EpochHook for CountingHook {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_epoch_end(&mut self, ctx: &mut EpochContext<'_>) -> TrainingResult<()> {
            assert!(ctx.logs.contains_key("val_loss"));
            self.calls.push((ctx.epoch, self.name));
            ctx.logs.insert(format!("seen_by_{}", self.name), 1.0);
            Ok(())
        }
    }

    fn setup() -> (TrainableModel, SyntheticDataset) {
        let names = vec!["a".to_string(), "b".to_string()];
        let handle = MlpModelProvider
            .build(&BuildRequest {
                architecture: "mlp:4",
                class_names: &names,
                base_weights: &WeightSource::None,
                trained_weights: None,
                image_dimension: 2,
                color_mode: ColorMode::Grayscale,
                class_mode: ClassMode::MultiLabel,
            })
            .unwrap();
        let data = SyntheticDataset::generate(&names, 4, 24, 8, 4, 42).unwrap();
        (TrainableModel::compile(Arc::clone(handle.graph()), 0.01).unwrap(), data)
    }

    fn options(epochs: usize, steps: usize) -> FitOptions {
        FitOptions { epochs, steps_per_epoch: steps, validation_steps: 2, workers: 3, max_queue_size: 2, verbose: 0 }
    }

    #[tokio::test]
    async fn test_fit_runs_hooks_in_order_every_epoch() {
        let (mut model, data) = setup();
        let mut first = CountingHook { name: "first", calls: Vec::new() };
        let mut second = CountingHook { name: "second", calls: Vec::new() };
        let mut state = TrainingState::default();

        let history = {
            let mut hooks: Vec<&mut dyn EpochHook> = vec![&mut first, &mut second];
            fit(
                &mut model,
                data.train_stream().unwrap(),
                data.validation_stream().unwrap(),
                &data.class_weights().unwrap(),
                &options(2, 6),
                &mut hooks,
                &mut state,
            )
            .await
            .unwrap()
        };

        assert_eq!(history.epochs(), 2);
        assert_eq!(history.get("lr").unwrap().len(), 2);
        assert_eq!(history.get("seen_by_second").unwrap().len(), 2);
        assert_eq!(first.calls, vec![(0, "first"), (1, "first")]);
        assert_eq!(second.calls, vec![(0, "second"), (1, "second")]);
    }

    #[tokio::test]
    async fn test_training_reduces_loss() {
        let (mut model, data) = setup();
        let mut state = TrainingState::default();
        let history = fit(
            &mut model,
            data.train_stream().unwrap(),
            data.validation_stream().unwrap(),
            &data.class_weights().unwrap(),
            &options(15, 6),
            &mut [],
            &mut state,
        )
        .await
        .unwrap();

        let loss = history.get("loss").unwrap();
        assert!(loss[loss.len() - 1] < loss[0], "loss did not drop: {loss:?}");
    }

    #[tokio::test]
    async fn test_fixed_steps_wrap_around_the_sequence() {
        let (mut model, data) = setup();
        let mut state = TrainingState::default();
        // 6 batches available, 10 requested.
        let history = fit(
            &mut model,
            data.train_stream().unwrap(),
            data.validation_stream().unwrap(),
            &data.class_weights().unwrap(),
            &options(1, 10),
            &mut [],
            &mut state,
        )
        .await
        .unwrap();
        assert_eq!(history.epochs(), 1);
    }
}
