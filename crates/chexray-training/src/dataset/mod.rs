//! Training and validation example streams.
//!
//! A stream is a [`BatchSequence`]: an indexable, restartable sequence of
//! batches. The fit loop's producer workers pull batches by index, so a
//! sequence can be replayed every epoch and read from several threads.

mod csv_dataset;
mod synthetic;

pub use csv_dataset::CsvDataset;
pub use synthetic::SyntheticDataset;

use crate::config::{DatasetKind, RunConfig};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One labelled example: a flattened image tensor and a multi-hot label vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub image: Vec<f32>,
    pub labels: Vec<f32>,
}

/// A batch of `(image_tensor, multi_label_vector)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub images: Vec<Vec<f32>>,
    pub labels: Vec<Vec<f32>>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Split into at most `parts` contiguous shards of near-equal size.
    #[must_use]
    pub fn shard(&self, parts: usize) -> Vec<Self> {
        let parts = parts.max(1).min(self.len().max(1));
        let base = self.len() / parts;
        let extra = self.len() % parts;

        let mut shards = Vec::with_capacity(parts);
        let mut start = 0;
        for i in 0..parts {
            let size = base + usize::from(i < extra);
            let end = start + size;
            if size > 0 {
                shards.push(Self {
                    images: self.images[start..end].to_vec(),
                    labels: self.labels[start..end].to_vec(),
                });
            }
            start = end;
        }
        shards
    }
}

pub trait BatchSequence: Send + Sync + fmt::Debug {
    /// Number of batches in one pass over the data.
    fn len(&self) -> usize;

    fn batch(&self, index: usize) -> TrainingResult<Batch>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Examples held in memory, served in fixed-size batches.
#[derive(Debug, Clone)]
pub struct InMemorySequence {
    examples: Arc<Vec<Example>>,
    batch_size: usize,
}

impl InMemorySequence {
    #[must_use]
    pub fn new(examples: Arc<Vec<Example>>, batch_size: usize) -> Self {
        Self { examples, batch_size: batch_size.max(1) }
    }

    #[must_use]
    pub fn examples(&self) -> &[Example] {
        &self.examples
    }
}

impl BatchSequence for InMemorySequence {
    fn len(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    fn batch(&self, index: usize) -> TrainingResult<Batch> {
        let start = index * self.batch_size;
        if start >= self.examples.len() {
            return Err(TrainingError::Dataset(format!(
                "batch index {index} out of range ({} batches)",
                self.len()
            )));
        }
        let end = (start + self.batch_size).min(self.examples.len());
        let slice = &self.examples[start..end];
        Ok(Batch {
            images: slice.iter().map(|e| e.image.clone()).collect(),
            labels: slice.iter().map(|e| e.labels.clone()).collect(),
        })
    }
}

/// Source of training/validation streams and class weights.
///
/// Streams must be restartable: the fit loop reads every stream once per epoch.
pub trait DatasetProvider: Send + Sync {
    fn class_names(&self) -> &[String];

    fn train_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>>;

    fn validation_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>>;

    fn class_weights(&self) -> TrainingResult<ClassWeights>;
}

/// Loss weights for the negative and positive label of one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeight {
    pub negative: f64,
    pub positive: f64,
}

impl Default for ClassWeight {
    fn default() -> Self {
        Self { negative: 1.0, positive: 1.0 }
    }
}

/// Per-class loss weights, indexed in class order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights {
    names: Vec<String>,
    weights: Vec<ClassWeight>,
}

impl ClassWeights {
    #[must_use]
    pub fn uniform(class_names: &[String]) -> Self {
        Self {
            names: class_names.to_vec(),
            weights: vec![ClassWeight::default(); class_names.len()],
        }
    }

    /// Balance each class by its positive frequency in `labels`.
    ///
    /// With `p` positives out of `n` examples and multiplier `m`, the
    /// denominator is `d = (n - p) * m + p`; negatives weigh `p / d` and
    /// positives `(d - p) / d`.
    pub fn from_labels(class_names: &[String], labels: &[Vec<f32>], multiply: f64) -> TrainingResult<Self> {
        if labels.is_empty() {
            return Err(TrainingError::Dataset("cannot compute class weights from an empty training set".to_string()));
        }

        let total = labels.len() as f64;
        let mut weights = Vec::with_capacity(class_names.len());
        for (idx, name) in class_names.iter().enumerate() {
            let mut positives = 0.0;
            for (row, label) in labels.iter().enumerate() {
                let value = label.get(idx).ok_or_else(|| {
                    TrainingError::Dataset(format!("label row {row} has no column for class '{name}'"))
                })?;
                if *value > 0.5 {
                    positives += 1.0;
                }
            }
            let denominator = (total - positives) * multiply + positives;
            weights.push(ClassWeight {
                negative: positives / denominator,
                positive: (denominator - positives) / denominator,
            });
        }

        Ok(Self { names: class_names.to_vec(), weights })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weight for class `index`; classes beyond the table weigh 1.
    #[must_use]
    pub fn get(&self, index: usize) -> ClassWeight {
        self.weights.get(index).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn as_map(&self) -> BTreeMap<String, ClassWeight> {
        self.names.iter().cloned().zip(self.weights.iter().copied()).collect()
    }
}

/// Build the dataset provider named by the `[dataset]` section.
pub fn open_dataset(config: &RunConfig) -> TrainingResult<Arc<dyn DatasetProvider>> {
    let settings = config.dataset();
    let input_len = config.image().input_len();
    let batch_size = config.train().batch_size;
    match &settings.kind {
        DatasetKind::Csv { .. } => Ok(Arc::new(CsvDataset::open(settings, input_len, batch_size)?)),
        DatasetKind::Synthetic { train_size, dev_size } => Ok(Arc::new(
            SyntheticDataset::generate(
                &settings.class_names,
                input_len,
                *train_size,
                *dev_size,
                batch_size,
                config.train().seed,
            )?
            .with_positive_weights_multiply(settings.positive_weights_multiply),
        )),
    }
}

pub fn validate_examples(examples: &[Example], input_len: usize, num_classes: usize) -> TrainingResult<()> {
    if examples.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    for (idx, ex) in examples.iter().enumerate() {
        if ex.image.len() != input_len {
            return Err(TrainingError::Dataset(format!(
                "example[{idx}] has {} input values, expected {input_len}",
                ex.image.len()
            )));
        }
        if ex.labels.len() != num_classes {
            return Err(TrainingError::Dataset(format!(
                "example[{idx}] has {} labels, expected {num_classes}",
                ex.labels.len()
            )));
        }
    }
    Ok(())
}
