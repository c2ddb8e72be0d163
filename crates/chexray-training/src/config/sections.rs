use super::Layers;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{ClassMode, ColorMode, WeightSource};
use std::path::PathBuf;
use toml::Value;

/// Step count per epoch: inferred from the dataset or fixed by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCount {
    Auto,
    Fixed(usize),
}

impl StepCount {
    fn resolve(layers: &Layers, key: &str) -> TrainingResult<Self> {
        match layers.get("train", key) {
            None => Ok(Self::Auto),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            Some(Value::Integer(n)) if *n > 0 => Ok(Self::Fixed(*n as usize)),
            Some(other) => Err(TrainingError::config(format!(
                "[train] {key} must be \"auto\" or a positive integer, got {other}"
            ))),
        }
    }

    /// Resolve against the number of batches the dataset actually has.
    #[must_use]
    pub fn or_infer(self, inferred: usize) -> usize {
        match self {
            Self::Auto => inferred,
            Self::Fixed(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasetKind {
    Csv { train_csv: PathBuf, dev_csv: PathBuf, features_column: String },
    Synthetic { train_size: usize, dev_size: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSettings {
    pub class_names: Vec<String>,
    pub class_mode: ClassMode,
    pub kind: DatasetKind,
    pub positive_weights_multiply: f64,
}

impl DatasetSettings {
    pub(crate) fn resolve(layers: &Layers) -> TrainingResult<Self> {
        let class_names: Vec<String> = layers.require("dataset", "class_names")?;
        if class_names.is_empty() {
            return Err(TrainingError::config("[dataset] class_names must not be empty"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in &class_names {
            if !seen.insert(name.as_str()) {
                return Err(TrainingError::config(format!("[dataset] duplicate class name '{name}'")));
            }
        }

        let class_mode = match layers.require::<String>("dataset", "class_mode")?.as_str() {
            "multilabel" => ClassMode::MultiLabel,
            "multiclass" => ClassMode::MultiClass,
            other => {
                return Err(TrainingError::config(format!(
                    "[dataset] class_mode must be \"multilabel\" or \"multiclass\", got \"{other}\""
                )))
            }
        };

        let kind = match layers.require::<String>("dataset", "source")?.as_str() {
            "csv" => DatasetKind::Csv {
                train_csv: layers.require("dataset", "train_csv")?,
                dev_csv: layers.require("dataset", "dev_csv")?,
                features_column: layers.require("dataset", "features_column")?,
            },
            "synthetic" => DatasetKind::Synthetic {
                train_size: layers.require("dataset", "synthetic_train_size")?,
                dev_size: layers.require("dataset", "synthetic_dev_size")?,
            },
            other => {
                return Err(TrainingError::config(format!(
                    "[dataset] source must be \"csv\" or \"synthetic\", got \"{other}\""
                )))
            }
        };

        let positive_weights_multiply: f64 = layers.require("dataset", "positive_weights_multiply")?;
        if !positive_weights_multiply.is_finite() || positive_weights_multiply <= 0.0 {
            return Err(TrainingError::config("[dataset] positive_weights_multiply must be > 0"));
        }

        Ok(Self { class_names, class_mode, kind, positive_weights_multiply })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_name: String,
    pub base_weights: WeightSource,
    /// Resume from the persisted state and trained weights of a previous run.
    pub resume: bool,
    pub use_best_weights: bool,
    pub output_weights_name: String,
    pub show_model_summary: bool,
}

impl ModelSettings {
    pub(crate) fn resolve(layers: &Layers) -> TrainingResult<Self> {
        let base_weights = if layers.require("model", "use_base_model_weights")? {
            if layers.require("model", "use_ext_base_model_weights")? {
                WeightSource::File(layers.require("model", "base_model_weights_file")?)
            } else {
                WeightSource::Pretrained("imagenet".to_string())
            }
        } else {
            WeightSource::None
        };

        let output_weights_name: String = layers.require("model", "output_weights_name")?;
        if output_weights_name.trim().is_empty() || output_weights_name.contains(['/', '\\']) {
            return Err(TrainingError::config(
                "[model] output_weights_name must be a plain, non-empty file name",
            ));
        }

        Ok(Self {
            model_name: layers.require("model", "model_name")?,
            base_weights,
            resume: layers.require("model", "use_trained_model_weights")?,
            use_best_weights: layers.require("model", "use_best_weights")?,
            output_weights_name,
            show_model_summary: layers.require("model", "show_model_summary")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSettings {
    pub img_dim: usize,
    pub color_mode: ColorMode,
}

impl ImageSettings {
    pub(crate) fn resolve(layers: &Layers) -> TrainingResult<Self> {
        let img_dim: usize = layers.require("image", "img_dim")?;
        if img_dim == 0 {
            return Err(TrainingError::config("[image] img_dim must be >= 1"));
        }
        let color_mode = match layers.require::<String>("image", "color_mode")?.as_str() {
            "rgb" => ColorMode::Rgb,
            "grayscale" => ColorMode::Grayscale,
            other => {
                return Err(TrainingError::config(format!(
                    "[image] color_mode must be \"rgb\" or \"grayscale\", got \"{other}\""
                )))
            }
        };
        Ok(Self { img_dim, color_mode })
    }

    /// Length of one flattened input example.
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.img_dim * self.img_dim * self.color_mode.channels()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSettings {
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub initial_learning_rate: f64,
    pub train_steps: StepCount,
    pub validation_steps: StepCount,
    pub patience_reduce_lr: usize,
    pub reduce_lr_factor: f64,
    pub min_lr: f64,
    pub workers: usize,
    pub max_queue_size: usize,
    pub seed: u64,
    pub progress_verbosity: u64,
}

impl TrainSettings {
    pub(crate) fn resolve(layers: &Layers) -> TrainingResult<Self> {
        let settings = Self {
            output_dir: layers.require("train", "output_dir")?,
            epochs: layers.require("train", "epochs")?,
            batch_size: layers.require("train", "batch_size")?,
            initial_learning_rate: layers.require("train", "initial_learning_rate")?,
            train_steps: StepCount::resolve(layers, "train_steps")?,
            validation_steps: StepCount::resolve(layers, "validation_steps")?,
            patience_reduce_lr: layers.require("train", "patience_reduce_lr")?,
            reduce_lr_factor: layers.require("train", "reduce_lr_factor")?,
            min_lr: layers.require("train", "min_lr")?,
            workers: layers.require("train", "workers")?,
            max_queue_size: layers.require("train", "max_queue_size")?,
            seed: layers.require("train", "seed")?,
            progress_verbosity: layers.require("train", "progress_verbosity")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> TrainingResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(TrainingError::config("[train] output_dir must not be empty"));
        }
        if self.epochs == 0 {
            return Err(TrainingError::config("[train] epochs must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::config("[train] batch_size must be >= 1"));
        }
        if !self.initial_learning_rate.is_finite() || self.initial_learning_rate <= 0.0 {
            return Err(TrainingError::config("[train] initial_learning_rate must be > 0"));
        }
        if !(self.reduce_lr_factor > 0.0 && self.reduce_lr_factor < 1.0) {
            return Err(TrainingError::config("[train] reduce_lr_factor must be in (0, 1)"));
        }
        if !self.min_lr.is_finite() || self.min_lr < 0.0 {
            return Err(TrainingError::config("[train] min_lr must be >= 0"));
        }
        if self.workers == 0 || self.max_queue_size == 0 {
            return Err(TrainingError::config("[train] workers and max_queue_size must be >= 1"));
        }
        Ok(())
    }
}
