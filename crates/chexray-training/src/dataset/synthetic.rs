use super::{BatchSequence, ClassWeights, DatasetProvider, Example, InMemorySequence};
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Seeded, label-correlated data for smoke runs and tests.
///
/// Input position `j` carries signal for class `j % num_classes`: it is
/// raised by 1.0 when that class is positive, on top of uniform noise.
/// Every split contains at least one positive and one negative per class
/// when it has room for them.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    class_names: Vec<String>,
    train: Arc<Vec<Example>>,
    dev: Arc<Vec<Example>>,
    batch_size: usize,
    positive_weights_multiply: f64,
}

impl SyntheticDataset {
    pub fn generate(
        class_names: &[String],
        input_len: usize,
        train_size: usize,
        dev_size: usize,
        batch_size: usize,
        seed: u64,
    ) -> TrainingResult<Self> {
        if class_names.is_empty() || input_len == 0 {
            return Err(TrainingError::Dataset(
                "synthetic data needs at least one class and one input value".to_string(),
            ));
        }
        if train_size == 0 || dev_size == 0 {
            return Err(TrainingError::Dataset("synthetic split sizes must be >= 1".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let train = split(&mut rng, class_names.len(), input_len, train_size);
        let dev = split(&mut rng, class_names.len(), input_len, dev_size);

        Ok(Self {
            class_names: class_names.to_vec(),
            train: Arc::new(train),
            dev: Arc::new(dev),
            batch_size,
            positive_weights_multiply: 1.0,
        })
    }

    #[must_use]
    pub fn with_positive_weights_multiply(mut self, multiply: f64) -> Self {
        self.positive_weights_multiply = multiply;
        self
    }
}

fn split(rng: &mut StdRng, num_classes: usize, input_len: usize, size: usize) -> Vec<Example> {
    (0..size)
        .map(|i| {
            let labels: Vec<f32> = (0..num_classes)
                .map(|c| {
                    // Pin one positive and one negative per class where possible.
                    if i == c {
                        1.0
                    } else if i == c + num_classes {
                        0.0
                    } else if rng.gen_bool(0.35) {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect();
            let image = (0..input_len)
                .map(|j| labels[j % num_classes] + rng.gen_range(-0.5_f32..0.5))
                .collect();
            Example { image, labels }
        })
        .collect()
}

impl DatasetProvider for SyntheticDataset {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    #[test]
    fn test_generation_is_deterministic_per_seed() {
        let a = SyntheticDataset::generate(&names(), 4, 10, 6, 4, 7).unwrap();
        let b = SyntheticDataset::generate(&names(), 4, 10, 6, 4, 7).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.dev, b.dev);
    }

    #[test]
    fn test_every_class_has_both_labels_in_validation() {
        let ds = SyntheticDataset::generate(&names(), 4, 12, 6, 4, 1).unwrap();
        for c in 0..3 {
            assert!(ds.dev.iter().any(|e| e.labels[c] > 0.5));
            assert!(ds.dev.iter().any(|e| e.labels[c] < 0.5));
        }
    }

    #[test]
    fn test_streams_are_batched() {
        let ds = SyntheticDataset::generate(&names(), 4, 10, 6, 4, 3).unwrap();
        assert_eq!(ds.train_stream().unwrap().len(), 3);
        assert_eq!(ds.validation_stream().unwrap().len(), 2);
        assert_eq!(ds.class_weights().unwrap().len(), 3);
    }
}
