use crate::error::{TrainingError, TrainingResult};
use crate::persist::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Learning rate a fresh run starts from when no state file exists.
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;

/// Resumable training progress, persisted as `training_stats.json`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Zero-based index of the current run within this output directory.
    pub run: u32,
    pub best_mean_auroc: f64,
    /// Learning rate the next epoch (or next run) starts from.
    pub lr: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self { run: 0, best_mean_auroc: 0.0, lr: DEFAULT_LEARNING_RATE }
    }
}

impl TrainingState {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> TrainingResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        write_json_atomic(path, self)
    }

    /// State for the run about to start.
    ///
    /// A resumed run continues from the persisted state: its learning rate
    /// replaces the configured one and the run index advances by one. A
    /// fresh run starts at run 0 with the configured learning rate.
    pub fn for_new_run(path: &Path, resume: bool, initial_learning_rate: f64) -> TrainingResult<Self> {
        if resume {
            match Self::load(path)? {
                Some(previous) => {
                    let run = previous.run.checked_add(1).ok_or_else(|| {
                        TrainingError::Trainer(format!("{} holds the last possible run index", path.display()))
                    })?;
                    let state = Self { run, ..previous };
                    tracing::info!(
                        run = state.run,
                        lr = state.lr,
                        best_mean_auroc = state.best_mean_auroc,
                        "resuming from {}",
                        path.display()
                    );
                    return Ok(state);
                }
                None => {
                    tracing::warn!("{} not found, starting a fresh run", path.display());
                }
            }
        }
        Ok(Self { lr: initial_learning_rate, ..Self::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_stats.json");
        let state = TrainingState { run: 2, best_mean_auroc: 0.81, lr: 0.0005 };
        state.save(&path).unwrap();
        assert_eq!(TrainingState::load(&path).unwrap(), Some(state));
    }

    #[test]
    fn test_missing_state_file_is_none() {
        let temp = TempDir::new().unwrap();
        assert_eq!(TrainingState::load(&temp.path().join("nope.json")).unwrap(), None);
    }

    #[test]
    fn test_resume_advances_run_and_keeps_learning_rate() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_stats.json");
        TrainingState { run: 2, best_mean_auroc: 0.81, lr: 0.0005 }.save(&path).unwrap();

        let state = TrainingState::for_new_run(&path, true, 0.01).unwrap();
        assert_eq!(state, TrainingState { run: 3, best_mean_auroc: 0.81, lr: 0.0005 });
    }

    #[test]
    fn test_resume_without_state_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_stats.json");
        let state = TrainingState::for_new_run(&path, true, 0.01).unwrap();
        assert_eq!(state, TrainingState { run: 0, best_mean_auroc: 0.0, lr: 0.01 });
    }

    #[test]
    fn test_fresh_run_ignores_existing_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_stats.json");
        TrainingState { run: 4, best_mean_auroc: 0.9, lr: 0.0001 }.save(&path).unwrap();

        let state = TrainingState::for_new_run(&path, false, 0.001).unwrap();
        assert_eq!(state.run, 0);
        assert!((state.lr - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resume_refuses_exhausted_run_index() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_stats.json");
        TrainingState { run: u32::MAX, best_mean_auroc: 0.5, lr: 0.001 }.save(&path).unwrap();

        let err = TrainingState::for_new_run(&path, true, 0.01).unwrap_err();
        assert!(matches!(err, TrainingError::Trainer(_)));
    }
}
