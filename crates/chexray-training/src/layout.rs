use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".training.lock";
pub const STATE_FILE: &str = "training_stats.json";
pub const HISTORY_FILE: &str = "history.json";
pub const BEST_AUROC_LOG: &str = "best_auroc.log";
pub const BASE_MODEL_FILE: &str = "trained_base_model.json";

/// Filesystem layout for one training output directory.
///
/// ```text
/// <output_dir>/
///   .training.lock
///   training_stats.json
///   history.json
///   <weights>            latest epoch
///   best_<weights>       best mean AUROC
///   best_auroc.log
///   trained_base_model.json
///   <config file name>
///   logs/run<N>/epochs.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
    weights_name: String,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf, weights_name: impl Into<String>) -> Self {
        Self { root, weights_name: weights_name.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    #[must_use]
    pub fn weights_path(&self) -> PathBuf {
        self.root.join(&self.weights_name)
    }

    #[must_use]
    pub fn best_weights_path(&self) -> PathBuf {
        self.root.join(format!("best_{}", self.weights_name))
    }

    /// Weights a resumed run loads: the best or the latest set.
    #[must_use]
    pub fn trained_weights_path(&self, use_best: bool) -> PathBuf {
        if use_best { self.best_weights_path() } else { self.weights_path() }
    }

    #[must_use]
    pub fn best_auroc_log_path(&self) -> PathBuf {
        self.root.join(BEST_AUROC_LOG)
    }

    #[must_use]
    pub fn base_model_path(&self) -> PathBuf {
        self.root.join(BASE_MODEL_FILE)
    }

    #[must_use]
    pub fn config_archive_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    #[must_use]
    pub fn run_log_dir(&self, run: u32) -> PathBuf {
        self.root.join("logs").join(format!("run{run}"))
    }

    #[must_use]
    pub fn epoch_log_path(&self, run: u32) -> PathBuf {
        self.run_log_dir(run).join("epochs.jsonl")
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
