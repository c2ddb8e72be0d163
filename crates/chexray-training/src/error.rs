use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "another training process holds the lock at {} (remove the file if no run is active)",
        path.display()
    )]
    LockConflict { path: PathBuf },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model build error: {0}")]
    ModelBuild(String),

    /// Per-class metric failure. The AUROC evaluator absorbs these.
    #[error("metric for class '{class}' is undefined: {reason}")]
    Metric { class: String, reason: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
