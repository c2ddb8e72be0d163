use super::{validate_examples, BatchSequence, ClassWeights, DatasetProvider, Example, InMemorySequence};
use crate::config::{DatasetKind, DatasetSettings};
use crate::error::{TrainingError, TrainingResult};
use std::path::Path;
use std::sync::Arc;

/// Dataset backed by two CSV files (training and dev split).
///
/// Each row carries the flattened image as whitespace-separated numbers in
/// the features column plus one label column per class. Blank label cells and
/// negative (uncertain) labels count as 0.
#[derive(Debug, Clone)]
pub struct CsvDataset {
    class_names: Vec<String>,
    train: Arc<Vec<Example>>,
    dev: Arc<Vec<Example>>,
    batch_size: usize,
    positive_weights_multiply: f64,
}

impl CsvDataset {
    pub fn open(settings: &DatasetSettings, input_len: usize, batch_size: usize) -> TrainingResult<Self> {
        let DatasetKind::Csv { train_csv, dev_csv, features_column } = &settings.kind else {
            return Err(TrainingError::Dataset("dataset source is not csv".to_string()));
        };

        let train = read_examples(train_csv, features_column, &settings.class_names)?;
        validate_examples(&train, input_len, settings.class_names.len())
            .map_err(|e| TrainingError::Dataset(format!("{}: {e}", train_csv.display())))?;
        let dev = read_examples(dev_csv, features_column, &settings.class_names)?;
        validate_examples(&dev, input_len, settings.class_names.len())
            .map_err(|e| TrainingError::Dataset(format!("{}: {e}", dev_csv.display())))?;

        tracing::info!(
            train = train.len(),
            dev = dev.len(),
            "loaded csv dataset"
        );

        Ok(Self {
            class_names: settings.class_names.clone(),
            train: Arc::new(train),
            dev: Arc::new(dev),
            batch_size,
            positive_weights_multiply: settings.positive_weights_multiply,
        })
    }
}

impl DatasetProvider for CsvDataset {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn train_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>> {
        Ok(Arc::new(InMemorySequence::new(Arc::clone(&self.train), self.batch_size)))
    }

    fn validation_stream(&self) -> TrainingResult<Arc<dyn BatchSequence>> {
        Ok(Arc::new(InMemorySequence::new(Arc::clone(&self.dev), self.batch_size)))
    }

    fn class_weights(&self) -> TrainingResult<ClassWeights> {
        let labels: Vec<Vec<f32>> = self.train.iter().map(|e| e.labels.clone()).collect();
        ClassWeights::from_labels(&self.class_names, &labels, self.positive_weights_multiply)
    }
}

pub fn read_examples(path: &Path, features_column: &str, class_names: &[String]) -> TrainingResult<Vec<Example>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| TrainingError::Dataset(format!("cannot open {}: {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| TrainingError::Dataset(format!("{}: unreadable header: {e}", path.display())))?
        .clone();
    let column = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            TrainingError::Dataset(format!("{}: missing column '{name}'", path.display()))
        })
    };
    let features_idx = column(features_column)?;
    let label_idx = class_names.iter().map(|c| column(c.as_str())).collect::<TrainingResult<Vec<_>>>()?;

    let mut examples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| TrainingError::Dataset(format!("{}: row {}: {e}", path.display(), row + 1)))?;

        let image = record
            .get(features_idx)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TrainingError::Dataset(format!("{}: row {}: bad feature value: {e}", path.display(), row + 1))
            })?;

        let mut labels = Vec::with_capacity(label_idx.len());
        for (&idx, class) in label_idx.iter().zip(class_names) {
            let cell = record.get(idx).unwrap_or_default();
            let value = if cell.is_empty() {
                0.0
            } else {
                cell.parse::<f32>().map_err(|e| {
                    TrainingError::Dataset(format!(
                        "{}: row {}: bad label for '{class}': {e}",
                        path.display(),
                        row + 1
                    ))
                })?
            };
            labels.push(value.clamp(0.0, 1.0));
        }

        examples.push(Example { image, labels });
    }

    Ok(examples)
}
