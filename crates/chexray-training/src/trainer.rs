//! The training orchestrator.
//!
//! One call to [`Trainer::train`] walks
//! `Idle → Locked → DatasetsPrepared → ModelPrepared → Training → Finalized`.
//! Any fault after the lock is taken moves the trainer to `Failed`. The lock
//! is released on every exit path, including when the `train` future is
//! dropped before completion.

use crate::accelerator::{self, Adapted};
use crate::auroc::AurocEvaluator;
use crate::checkpoint::CheckpointStrategy;
use crate::config::{RunConfig, StepCount};
use crate::dataset::{open_dataset, BatchSequence, ClassWeights, DatasetProvider};
use crate::error::{TrainingError, TrainingResult};
use crate::fit::{fit, FitOptions};
use crate::history::{History, HistoryArtifact};
use crate::hooks::{BaseModelExportHook, CheckpointHook, EpochHook, ProgressLogHook, ReduceLrOnPlateau};
use crate::layout::TrainingLayout;
use crate::lock::TrainingLock;
use crate::model::{BaseModel, BuildRequest, MlpModelProvider, ModelProvider};
use crate::optimizer::TrainableModel;
use crate::persist::write_atomic;
use crate::state::TrainingState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Locked,
    DatasetsPrepared,
    ModelPrepared,
    Training,
    Finalized,
    Failed(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run: u32,
    pub epochs: usize,
    pub best_mean_auroc: f64,
    pub lr: f64,
    pub devices: usize,
    pub output_dir: PathBuf,
    pub history_path: PathBuf,
}

/// Everything one run carries from phase to phase.
struct RunContext {
    layout: TrainingLayout,
    state: TrainingState,
}

struct PreparedData {
    class_names: Vec<String>,
    train: Arc<dyn BatchSequence>,
    validation: Arc<dyn BatchSequence>,
    class_weights: ClassWeights,
    train_steps: usize,
    validation_steps: usize,
}

struct PreparedModel {
    model: TrainableModel,
    base: Option<BaseModel>,
    strategy: CheckpointStrategy,
    evaluator: AurocEvaluator,
}

pub struct Trainer {
    config: RunConfig,
    dataset: Option<Arc<dyn DatasetProvider>>,
    models: Arc<dyn ModelProvider>,
    devices: Option<usize>,
    status: TrainerStatus,
}

impl Trainer {
    /// A trainer using the dataset named by the configuration and the
    /// built-in model provider.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self { config, dataset: None, models: Arc::new(MlpModelProvider), devices: None, status: TrainerStatus::Idle }
    }

    #[must_use]
    pub fn with_dataset_provider(mut self, dataset: Arc<dyn DatasetProvider>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    #[must_use]
    pub fn with_model_provider(mut self, models: Arc<dyn ModelProvider>) -> Self {
        self.models = models;
        self
    }

    /// Fix the accelerator count instead of reading it from the environment.
    #[must_use]
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = Some(devices);
        self
    }

    #[must_use]
    pub fn status(&self) -> &TrainerStatus {
        &self.status
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn train(&mut self) -> TrainingResult<TrainingReport> {
        let layout = TrainingLayout::new(
            self.config.train().output_dir.clone(),
            self.config.model().output_weights_name.clone(),
        );
        layout.ensure_root()?;
        let mut lock = TrainingLock::acquire(&layout.lock_path()).inspect_err(|err| tracing::error!("{err}"))?;
        self.status = TrainerStatus::Locked;

        let mut run = RunContext { layout, state: TrainingState::default() };
        let outcome = self.run_phases(&mut run).await;
        let released = lock.release();

        match outcome.and_then(|report| released.map(|()| report)) {
            Ok(report) => {
                self.status = TrainerStatus::Finalized;
                tracing::info!(run = report.run, best_mean_auroc = report.best_mean_auroc, "training finished");
                Ok(report)
            }
            Err(err) => {
                tracing::error!("training failed in {} ({}): {err}", phase_name(&self.status), run.layout.root().display());
                self.status = TrainerStatus::Failed(err.to_string());
                Err(err)
            }
        }
    }

    async fn run_phases(&mut self, run: &mut RunContext) -> TrainingResult<TrainingReport> {
        let data = self.prepare_datasets(run)?;
        self.status = TrainerStatus::DatasetsPrepared;

        let prepared = self.prepare_model(run, &data)?;
        self.status = TrainerStatus::ModelPrepared;

        let devices = prepared.model.graph().devices();
        self.status = TrainerStatus::Training;
        let (history, auroc) = self.run_training(run, &data, prepared).await?;

        let history_path = run.layout.history_path();
        tracing::info!("writing {}", history_path.display());
        HistoryArtifact { run: run.state.run, history: history.series(), auroc: &auroc }.save(&history_path)?;
        run.state.save(&run.layout.state_path())?;

        Ok(TrainingReport {
            run: run.state.run,
            epochs: history.epochs(),
            best_mean_auroc: run.state.best_mean_auroc,
            lr: run.state.lr,
            devices,
            output_dir: run.layout.root().to_path_buf(),
            history_path,
        })
    }

    fn prepare_datasets(&self, run: &mut RunContext) -> TrainingResult<PreparedData> {
        let train = self.config.train();
        let state_path = run.layout.state_path();
        run.state = TrainingState::for_new_run(&state_path, self.config.model().resume, train.initial_learning_rate)?;
        tracing::info!(run = run.state.run, "run #{} starts at learning rate {}", run.state.run, run.state.lr);
        run.state.save(&state_path)?;

        let source = self.config.source();
        let archive = run.layout.config_archive_path(&source.archive_name());
        write_atomic(&archive, source.text.as_bytes())?;
        tracing::info!("archived configuration to {}", archive.display());

        let provider = match &self.dataset {
            Some(provider) => Arc::clone(provider),
            None => open_dataset(&self.config)?,
        };
        let class_names = self.config.dataset().class_names.clone();
        if provider.class_names() != class_names.as_slice() {
            return Err(TrainingError::Dataset(format!(
                "dataset classes {:?} do not match configured classes {class_names:?}",
                provider.class_names()
            )));
        }

        let train_stream = provider.train_stream()?;
        let validation = provider.validation_stream()?;
        let train_steps = resolve_steps("train_steps", train.train_steps, train_stream.len());
        let validation_steps = resolve_steps("validation_steps", train.validation_steps, validation.len());

        tracing::info!("computing class weights from training data");
        let class_weights = provider.class_weights()?;

        Ok(PreparedData { class_names, train: train_stream, validation, class_weights, train_steps, validation_steps })
    }

    fn prepare_model(&self, run: &RunContext, data: &PreparedData) -> TrainingResult<PreparedModel> {
        let settings = self.config.model();
        let image = self.config.image();

        let trained = run.layout.trained_weights_path(settings.use_best_weights);
        let trained_weights = (settings.resume && trained.is_file()).then_some(trained);
        tracing::info!("base model weights: {}", settings.base_weights);
        match &trained_weights {
            Some(path) => tracing::info!("trained model weights: {}", path.display()),
            None => tracing::info!("trained model weights: none, starting over"),
        }

        let request = BuildRequest {
            architecture: &settings.model_name,
            class_names: &data.class_names,
            base_weights: &settings.base_weights,
            trained_weights: trained_weights.as_deref(),
            image_dimension: image.img_dim,
            color_mode: image.color_mode,
            class_mode: self.config.dataset().class_mode,
        };
        let handle = self.models.build(&request)?;
        if settings.show_model_summary {
            tracing::info!("model summary:\n{}", handle.graph().summary()?);
        }

        let output_path = run.layout.weights_path();
        tracing::info!("output weights path: {}", output_path.display());
        let devices = self.devices.unwrap_or_else(accelerator::detect_count);
        let Adapted { model, strategy } = accelerator::adapt_to(handle, &output_path, devices);

        tracing::info!("compiling model with Adam at learning rate {}", run.state.lr);
        let trainable = TrainableModel::compile(Arc::clone(model.graph()), run.state.lr)?;
        let evaluator = AurocEvaluator::new(
            Arc::clone(&data.validation),
            data.validation_steps,
            data.class_names.clone(),
            Arc::new(strategy.clone()),
            run.layout.best_weights_path(),
            run.layout.state_path(),
            run.layout.best_auroc_log_path(),
        );

        Ok(PreparedModel { model: trainable, base: model.base().cloned(), strategy, evaluator })
    }

    async fn run_training(
        &self,
        run: &mut RunContext,
        data: &PreparedData,
        prepared: PreparedModel,
    ) -> TrainingResult<(History, BTreeMap<String, Vec<f64>>)> {
        let PreparedModel { mut model, base, strategy, mut evaluator } = prepared;
        let train = self.config.train();

        let mut checkpoint = CheckpointHook::new(strategy);
        let mut progress = ProgressLogHook::new(run.layout.epoch_log_path(run.state.run), train.progress_verbosity);
        let mut plateau = ReduceLrOnPlateau::new(train.reduce_lr_factor, train.patience_reduce_lr, train.min_lr);
        let mut export = BaseModelExportHook::new(base, run.layout.base_model_path());

        let options = FitOptions {
            epochs: train.epochs,
            steps_per_epoch: data.train_steps,
            validation_steps: data.validation_steps,
            workers: train.workers,
            max_queue_size: train.max_queue_size,
            verbose: train.progress_verbosity,
        };

        let history = {
            let mut hooks: Vec<&mut dyn EpochHook> =
                vec![&mut checkpoint, &mut progress, &mut plateau, &mut evaluator, &mut export];
            log_fit_parameters(&options, &data.class_weights, &hooks)?;
            fit(
                &mut model,
                Arc::clone(&data.train),
                Arc::clone(&data.validation),
                &data.class_weights,
                &options,
                &mut hooks,
                &mut run.state,
            )
            .await?
        };

        Ok((history, evaluator.history().clone()))
    }
}

fn resolve_steps(key: &str, configured: StepCount, inferred: usize) -> usize {
    if let StepCount::Fixed(n) = configured {
        tracing::info!("overriding {key}: {n} (dataset has {inferred} batches)");
    }
    configured.or_infer(inferred)
}

fn log_fit_parameters(options: &FitOptions, class_weights: &ClassWeights, hooks: &[&mut dyn EpochHook]) -> TrainingResult<()> {
    tracing::info!("training starts with parameters:");
    if let serde_json::Value::Object(fields) = serde_json::to_value(options)? {
        for (key, value) in fields {
            tracing::info!("  {key}: {value}");
        }
    }
    tracing::info!("  class_weight: {}", serde_json::to_string(&class_weights.as_map())?);
    let names: Vec<&str> = hooks.iter().map(|hook| hook.name()).collect();
    tracing::info!("  hooks: {}", names.join(", "));
    Ok(())
}

fn phase_name(status: &TrainerStatus) -> &'static str {
    match status {
        TrainerStatus::Idle | TrainerStatus::Locked => "dataset preparation",
        TrainerStatus::DatasetsPrepared => "model preparation",
        TrainerStatus::ModelPrepared | TrainerStatus::Training => "training",
        TrainerStatus::Finalized | TrainerStatus::Failed(_) => "finalization",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trainer_is_idle() {
        let config = RunConfig::from_toml_str(
            r#"
            [dataset]
            class_names = ["a", "b"]
            source = "synthetic"
            [model]
            output_weights_name = "weights.json"
            [train]
            output_dir = "out"
            "#,
        )
        .unwrap();
        let trainer = Trainer::new(config);
        assert_eq!(trainer.status(), &TrainerStatus::Idle);
    }

    #[test]
    fn test_fixed_steps_override_inferred() {
        assert_eq!(resolve_steps("train_steps", StepCount::Auto, 7), 7);
        assert_eq!(resolve_steps("train_steps", StepCount::Fixed(3), 7), 3);
    }
}
