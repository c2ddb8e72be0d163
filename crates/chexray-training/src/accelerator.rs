//! Accelerator detection and data-parallel replication.

use crate::checkpoint::CheckpointStrategy;
use crate::dataset::{Batch, ClassWeights};
use crate::error::{TrainingError, TrainingResult};
use crate::model::{BaseModel, Model, ModelHandle, SharedWeights};
use candle_core::Tensor;
use std::path::Path;
use std::sync::Arc;

/// Environment variable listing visible accelerator ids, comma separated.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

#[must_use]
pub fn detect_count() -> usize {
    detect_count_from(std::env::var(VISIBLE_DEVICES_ENV).ok().as_deref())
}

/// Count the non-empty ids in `declared`. Never less than one.
#[must_use]
pub fn detect_count_from(declared: Option<&str>) -> usize {
    declared
        .map(|list| list.split(',').filter(|id| !id.trim().is_empty()).count())
        .unwrap_or(1)
        .max(1)
}

/// A model handle ready for training plus the checkpoint strategy that goes with it.
#[derive(Debug)]
pub struct Adapted {
    pub model: ModelHandle,
    pub strategy: CheckpointStrategy,
}

/// Adapt to the accelerators declared in the environment.
#[must_use]
pub fn adapt(handle: ModelHandle, output_path: &Path) -> Adapted {
    adapt_to(handle, output_path, detect_count())
}

#[must_use]
pub fn adapt_to(handle: ModelHandle, output_path: &Path, devices: usize) -> Adapted {
    tracing::info!(devices, "detected {devices} accelerator(s)");
    if devices <= 1 {
        return Adapted {
            model: handle,
            strategy: CheckpointStrategy::SingleDevice { path: output_path.to_path_buf() },
        };
    }

    let canonical = Arc::clone(handle.graph());
    let replicated: Arc<dyn Model> = Arc::new(ReplicatedModel::new(Arc::clone(&canonical), devices));
    Adapted {
        model: handle.with_graph(replicated),
        strategy: CheckpointStrategy::Replicated { path: output_path.to_path_buf(), canonical },
    }
}

/// Data-parallel view over a single-device graph.
///
/// Each batch is split into one shard per device and the shard forward
/// passes run concurrently against the same variables. Shard losses are
/// combined weighted by shard size, so backpropagating the combined loss
/// yields the single-device gradient.
#[derive(Debug)]
pub struct ReplicatedModel {
    inner: Arc<dyn Model>,
    devices: usize,
}

impl ReplicatedModel {
    #[must_use]
    pub fn new(inner: Arc<dyn Model>, devices: usize) -> Self {
        Self { inner, devices: devices.max(1) }
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Model> {
        &self.inner
    }

    fn on_replicas<T, F>(&self, shards: &[Batch], run: F) -> TrainingResult<Vec<T>>
    where
        T: Send,
        F: Fn(&dyn Model, &Batch) -> TrainingResult<T> + Sync,
    {
        let inner = self.inner.as_ref();
        let run = &run;
        std::thread::scope(|scope| {
            let workers: Vec<_> = shards
                .iter()
                .map(|shard| scope.spawn(move || run(inner, shard)))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .map_err(|_| TrainingError::Trainer("replica worker panicked".to_string()))
                        .and_then(|result| result)
                })
                .collect()
        })
    }
}

impl Model for ReplicatedModel {
    fn architecture(&self) -> &str {
        self.inner.architecture()
    }

    fn class_names(&self) -> &[String] {
        self.inner.class_names()
    }

    fn parameters(&self) -> Vec<SharedWeights> {
        self.inner.parameters()
    }

    fn base(&self) -> Option<BaseModel> {
        self.inner.base()
    }

    fn devices(&self) -> usize {
        self.devices
    }

    fn predict(&self, images: &[Vec<f32>]) -> TrainingResult<Vec<Vec<f32>>> {
        let batch = Batch { images: images.to_vec(), labels: vec![Vec::new(); images.len()] };
        let parts = self.on_replicas(&batch.shard(self.devices), |model, shard| model.predict(&shard.images))?;
        Ok(parts.into_iter().flatten().collect())
    }

    fn loss(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<Tensor> {
        let shards = batch.shard(self.devices);
        let losses = self.on_replicas(&shards, |model, shard| model.loss(shard, class_weights))?;

        let total = batch.len().max(1) as f64;
        let mut combined: Option<Tensor> = None;
        for (shard, loss) in shards.iter().zip(losses) {
            let weighted = loss.affine(shard.len() as f64 / total, 0.0)?;
            combined = Some(match combined {
                Some(acc) => acc.add(&weighted)?,
                None => weighted,
            });
        }
        combined.ok_or_else(|| TrainingError::Trainer("cannot compute a loss on an empty batch".to_string()))
    }

    fn evaluate(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<f64> {
        let shards = batch.shard(self.devices);
        let losses = self.on_replicas(&shards, |model, shard| model.evaluate(shard, class_weights))?;
        let total = batch.len().max(1) as f64;
        Ok(shards.iter().zip(losses).map(|(shard, loss)| loss * shard.len() as f64 / total).sum())
    }
}
