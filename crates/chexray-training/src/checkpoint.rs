use crate::error::{TrainingError, TrainingResult};
use crate::model::Model;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persists model weights on request.
pub trait CheckpointSink: Send + Sync {
    fn save(&self, model: &dyn Model, path: &Path) -> TrainingResult<()>;
}

/// How weights reach disk for this run. Chosen once, before training.
#[derive(Debug, Clone)]
pub enum CheckpointStrategy {
    SingleDevice { path: PathBuf },
    /// Saves the canonical single-device graph, never the replicated view.
    Replicated { path: PathBuf, canonical: Arc<dyn Model> },
}

impl CheckpointStrategy {
    /// Path of the per-epoch weights.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::SingleDevice { path } | Self::Replicated { path, .. } => path,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleDevice { .. } => "single_device",
            Self::Replicated { .. } => "replicated",
        }
    }
}

impl CheckpointSink for CheckpointStrategy {
    fn save(&self, model: &dyn Model, path: &Path) -> TrainingResult<()> {
        let target: &dyn Model = match self {
            Self::SingleDevice { .. } => model,
            Self::Replicated { canonical, .. } => canonical.as_ref(),
        };
        target
            .save_weights(path)
            .map_err(|e| TrainingError::Checkpoint(format!("cannot write {}: {e}", path.display())))?;
        tracing::debug!(strategy = self.kind(), "saved weights to {}", path.display());
        Ok(())
    }
}
