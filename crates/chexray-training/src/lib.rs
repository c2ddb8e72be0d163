//! Chexray Training
//!
//! Resumable training orchestration for multi-label chest X-ray classifiers:
//! - Layered run configuration (`RunConfig`)
//! - Output-directory locking and persisted training state
//! - Dataset and model collaborator contracts with reference implementations
//! - Accelerator replication, checkpointing and per-epoch AUROC tracking
//! - The orchestrator state machine (`Trainer`)

pub mod accelerator;
pub mod auroc;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fit;
pub mod history;
pub mod hooks;
pub mod layout;
pub mod lock;
pub mod model;
pub mod optimizer;
pub mod persist;
pub mod state;
pub mod trainer;

pub use accelerator::{adapt, adapt_to, detect_count, detect_count_from, Adapted, ReplicatedModel};
pub use auroc::{class_auroc, mean_auroc, AurocEvaluator};
pub use checkpoint::{CheckpointSink, CheckpointStrategy};
pub use config::{RunConfig, StepCount};
pub use dataset::{
    open_dataset, Batch, BatchSequence, ClassWeight, ClassWeights, CsvDataset, DatasetProvider, Example,
    SyntheticDataset,
};
pub use error::{TrainingError, TrainingResult};
pub use fit::{fit, FitOptions};
pub use history::{History, HistoryArtifact};
pub use hooks::{BaseModelExportHook, CheckpointHook, EpochContext, EpochHook, ProgressLogHook, ReduceLrOnPlateau};
pub use layout::TrainingLayout;
pub use lock::TrainingLock;
pub use model::{
    BaseModel, BuildRequest, ClassMode, ColorMode, MlpModelProvider, Model, ModelHandle, ModelProvider,
    SharedWeights, WeightSource,
};
pub use optimizer::{adam_params, TrainableModel};
pub use state::TrainingState;
pub use trainer::{Trainer, TrainerStatus, TrainingReport};
