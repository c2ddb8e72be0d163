//! The compiled (graph + optimizer) model the fit loop drives.

use crate::dataset::{Batch, ClassWeights};
use crate::error::TrainingResult;
use crate::model::{scalar, Model};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::fmt;
use std::sync::Arc;

/// Adam settings. Weight decay stays off so AdamW reduces to plain Adam.
#[must_use]
pub fn adam_params(learning_rate: f64) -> ParamsAdamW {
    ParamsAdamW { lr: learning_rate, beta1: 0.9, beta2: 0.999, eps: 1e-7, weight_decay: 0.0 }
}

/// A graph compiled with its optimizer.
pub struct TrainableModel {
    graph: Arc<dyn Model>,
    optimizer: AdamW,
}

impl fmt::Debug for TrainableModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainableModel")
            .field("graph", &self.graph)
            .field("learning_rate", &self.learning_rate())
            .finish_non_exhaustive()
    }
}

impl TrainableModel {
    /// Bind an Adam optimizer to every trainable variable of `graph`.
    pub fn compile(graph: Arc<dyn Model>, learning_rate: f64) -> TrainingResult<Self> {
        let optimizer = AdamW::new(graph.trainable_vars()?, adam_params(learning_rate))?;
        Ok(Self { graph, optimizer })
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<dyn Model> {
        &self.graph
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    /// One optimizer step; returns the batch loss before the update.
    pub fn train_on_batch(&mut self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<f64> {
        let loss = self.graph.loss(batch, class_weights)?;
        self.optimizer.backward_step(&loss)?;
        scalar(&loss)
    }

    pub fn test_on_batch(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<f64> {
        self.graph.evaluate(batch, class_weights)
    }
}
