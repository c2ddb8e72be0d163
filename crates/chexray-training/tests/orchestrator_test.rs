//! End-to-end runs of the training orchestrator.
//!
//! These tests cover:
//! - A fresh run reaching `Finalized` with its artifacts on disk
//! - Failure during model construction still releasing the lock
//! - Resuming from persisted state
//! - Refusing to start over a locked output directory
//! - Replicated (multi-device) runs
//! - Dropping a run mid-epoch releasing the lock

mod common;

use chexray_training::layout::{BASE_MODEL_FILE, HISTORY_FILE, LOCK_FILE, STATE_FILE};
use chexray_training::{
    Batch, BatchSequence, BuildRequest, ClassWeights, DatasetProvider, ModelHandle, ModelProvider, RunConfig,
    SyntheticDataset, Trainer, TrainerStatus, TrainingError, TrainingResult, TrainingState,
};
use common::{files_with_prefix, synthetic_config, synthetic_config_text};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct FailingModelProvider;

impl ModelProvider for FailingModelProvider {
    fn build(&self, request: &BuildRequest<'_>) -> TrainingResult<ModelHandle> {
        Err(TrainingError::ModelBuild(format!("cannot build '{}'", request.architecture)))
    }
}

/// Training batches that take longer to produce than the caller is willing to wait.
#[derive(Debug)]
struct SlowSequence(Arc<dyn BatchSequence>);

impl BatchSequence for SlowSequence {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn batch(&self, index: usize) -> TrainingResult<Batch> {
        std::thread::sleep(Duration::from_millis(500));
        self.0.batch(index)
    }
}

struct SlowDataset(SyntheticDataset);

impl DatasetProvider for SlowDataset {
    fn class_names(&self) -> &[String] {
        self.0.class_names()
    }

    fn train_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>> {
        Ok(Arc::new(SlowSequence(self.0.train_stream()?)))
    }

    fn validation_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>> {
        self.0.validation_stream()
    }

    fn class_weights(&self) -> TrainingResult<ClassWeights> {
        self.0.class_weights()
    }
}

#[tokio::test]
async fn test_fresh_run_finalizes_and_leaves_artifacts() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    let mut trainer = Trainer::new(synthetic_config(&out, 2)).with_devices(1);

    let report = trainer.train().await.unwrap();

    assert_eq!(trainer.status(), &TrainerStatus::Finalized);
    assert_eq!(report.run, 0);
    assert_eq!(report.epochs, 2);
    assert_eq!(report.devices, 1);

    assert_eq!(files_with_prefix(&out, "history"), vec![HISTORY_FILE.to_string()]);
    assert_eq!(files_with_prefix(&out, "trained_base_model"), vec![BASE_MODEL_FILE.to_string()]);
    assert!(!out.join(LOCK_FILE).exists());
    assert!(out.join("weights.json").is_file());
    assert!(out.join("best_weights.json").is_file());
    assert!(out.join("best_auroc.log").is_file());

    let history: serde_json::Value = serde_json::from_slice(&std::fs::read(out.join(HISTORY_FILE)).unwrap()).unwrap();
    assert_eq!(history["history"]["loss"].as_array().unwrap().len(), 2);
    assert_eq!(history["history"]["val_loss"].as_array().unwrap().len(), 2);
    assert_eq!(history["auroc"]["Effusion"].as_array().unwrap().len(), 2);

    let state = TrainingState::load(&out.join(STATE_FILE)).unwrap().unwrap();
    assert_eq!(state.run, 0);
    assert!(state.best_mean_auroc > 0.0);
    assert!((state.best_mean_auroc - report.best_mean_auroc).abs() < f64::EPSILON);

    let epochs = std::fs::read_to_string(out.join("logs").join("run0").join("epochs.jsonl")).unwrap();
    assert_eq!(epochs.lines().count(), 2);
}

#[tokio::test]
async fn test_model_build_fault_fails_and_releases_lock() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    let mut trainer = Trainer::new(synthetic_config(&out, 2)).with_model_provider(Arc::new(FailingModelProvider));

    let err = trainer.train().await.unwrap_err();

    assert!(matches!(err, TrainingError::ModelBuild(_)));
    assert!(matches!(trainer.status(), TrainerStatus::Failed(msg) if msg.contains("cannot build")));
    assert!(!out.join(LOCK_FILE).exists());
    assert!(!out.join(HISTORY_FILE).exists());
    // Phase 2 ran before the fault.
    assert!(out.join(STATE_FILE).is_file());
}

#[tokio::test]
async fn test_resumed_run_advances_run_index() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");

    let mut first = Trainer::new(synthetic_config(&out, 1)).with_devices(1);
    let first_report = first.train().await.unwrap();

    let mut second = Trainer::new(synthetic_config(&out, 1)).with_devices(1);
    let second_report = second.train().await.unwrap();

    assert_eq!(first_report.run, 0);
    assert_eq!(second_report.run, 1);
    assert!(second_report.best_mean_auroc >= first_report.best_mean_auroc);
    assert_eq!(TrainingState::load(&out.join(STATE_FILE)).unwrap().unwrap().run, 1);
    assert!(out.join("logs").join("run1").join("epochs.jsonl").is_file());
}

#[tokio::test]
async fn test_locked_directory_is_refused_without_side_effects() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join(LOCK_FILE), "pid=1\n").unwrap();

    let mut trainer = Trainer::new(synthetic_config(&out, 1));
    let err = trainer.train().await.unwrap_err();

    assert!(matches!(err, TrainingError::LockConflict { .. }));
    assert_eq!(trainer.status(), &TrainerStatus::Idle);
    // The other process still owns its marker; nothing else was written.
    assert!(out.join(LOCK_FILE).exists());
    assert!(!out.join(STATE_FILE).exists());
}

#[tokio::test]
async fn test_replicated_run_saves_canonical_weights() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    let mut trainer = Trainer::new(synthetic_config(&out, 1)).with_devices(4);

    let report = trainer.train().await.unwrap();

    assert_eq!(report.devices, 4);
    assert_eq!(trainer.status(), &TrainerStatus::Finalized);
    assert!(out.join("weights.json").is_file());
    assert!(out.join(BASE_MODEL_FILE).is_file());
    assert!(!out.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_configuration_is_archived_verbatim() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    let config_path = temp.path().join("experiment.toml");
    let text = synthetic_config_text(&out, 1);
    std::fs::write(&config_path, &text).unwrap();

    let config = RunConfig::from_file(&config_path).unwrap();
    Trainer::new(config).with_devices(1).train().await.unwrap();

    assert_eq!(std::fs::read_to_string(out.join("experiment.toml")).unwrap(), text);
}

#[tokio::test]
async fn test_dropping_run_mid_epoch_releases_lock() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");
    let names: Vec<String> = ["Atelectasis", "Cardiomegaly", "Effusion"].iter().map(ToString::to_string).collect();
    let data = SyntheticDataset::generate(&names, 4, 24, 12, 8, 7).unwrap();
    let mut trainer = Trainer::new(synthetic_config(&out, 3))
        .with_devices(1)
        .with_dataset_provider(Arc::new(SlowDataset(data)));

    let outcome = tokio::time::timeout(Duration::from_millis(300), trainer.train()).await;

    assert!(outcome.is_err(), "run finished before the timeout");
    assert_eq!(trainer.status(), &TrainerStatus::Training);
    // Phase 2 ran, so the lock had been taken.
    assert!(out.join(STATE_FILE).is_file());
    assert!(!out.join(LOCK_FILE).exists());
}
