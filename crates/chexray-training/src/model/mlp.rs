use super::{BaseModel, BuildRequest, ClassMode, Model, ModelArtifact, ModelHandle, ModelProvider, SharedWeights, WeightSource};
use crate::dataset::{Batch, ClassWeights};
use crate::error::{TrainingError, TrainingResult};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};
use std::sync::Arc;

const DEFAULT_HIDDEN: usize = 16;
const EPS: f64 = 1e-7;

/// Builds `mlp` / `mlp:<hidden>` graphs: a dense ReLU base layer followed
/// by a dense classification head.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlpModelProvider;

fn parse_architecture(name: &str) -> TrainingResult<usize> {
    match name.split_once(':') {
        None if name == "mlp" => Ok(DEFAULT_HIDDEN),
        Some(("mlp", hidden)) => hidden
            .parse::<usize>()
            .ok()
            .filter(|h| *h > 0)
            .ok_or_else(|| TrainingError::ModelBuild(format!("invalid hidden size in '{name}'"))),
        _ => Err(TrainingError::ModelBuild(format!(
            "unknown architecture '{name}' (supported: mlp, mlp:<hidden>)"
        ))),
    }
}

impl ModelProvider for MlpModelProvider {
    fn build(&self, request: &BuildRequest<'_>) -> TrainingResult<ModelHandle> {
        let hidden = parse_architecture(request.architecture)?;
        let classes = request.class_names.len();
        if classes == 0 {
            return Err(TrainingError::ModelBuild("no classes to predict".to_string()));
        }

        let model = MlpModel::new(request, hidden)
            .map_err(|e| TrainingError::ModelBuild(format!("cannot allocate {}: {e}", request.architecture)))?;

        match request.base_weights {
            WeightSource::None => {}
            WeightSource::Pretrained(name) => {
                tracing::warn!(
                    weights = %name,
                    "no pretrained '{name}' set is bundled for {}; base starts from random initialization",
                    request.architecture
                );
            }
            WeightSource::File(path) => {
                let artifact = ModelArtifact::load(path).map_err(|e| {
                    TrainingError::ModelBuild(format!("cannot read base weights {}: {e}", path.display()))
                })?;
                if artifact.architecture != model.architecture {
                    return Err(TrainingError::ModelBuild(format!(
                        "base weights {} were exported from '{}', not '{}'",
                        path.display(),
                        artifact.architecture,
                        model.architecture
                    )));
                }
                model
                    .base
                    .assign_from(&artifact.weights)
                    .map_err(|e| TrainingError::ModelBuild(format!("{}: {e}", path.display())))?;
            }
        }

        if let Some(path) = request.trained_weights {
            model
                .load_weights(path)
                .map_err(|e| TrainingError::ModelBuild(format!("cannot load trained weights: {e}")))?;
        }

        Ok(ModelHandle::new(Arc::new(model)))
    }
}

/// Dense ReLU feature layer plus a classification head, on the CPU.
///
/// The layers hold views of the variables in `base` and `head`, so an
/// optimizer step on those variables is visible to the next forward pass.
#[derive(Debug)]
pub struct MlpModel {
    architecture: String,
    class_names: Vec<String>,
    class_mode: ClassMode,
    input_len: usize,
    device: Device,
    base: SharedWeights,
    head: SharedWeights,
    base_layer: Linear,
    head_layer: Linear,
}

impl MlpModel {
    fn new(request: &BuildRequest<'_>, hidden: usize) -> TrainingResult<Self> {
        let device = Device::Cpu;
        let input_len = request.input_len();
        let classes = request.class_names.len();

        let base = VarMap::new();
        let head = VarMap::new();
        let base_layer = linear(input_len, hidden, VarBuilder::from_varmap(&base, DType::F32, &device).pp("base"))?;
        let head_layer = linear(hidden, classes, VarBuilder::from_varmap(&head, DType::F32, &device).pp("head"))?;

        Ok(Self {
            architecture: request.architecture.to_string(),
            class_names: request.class_names.to_vec(),
            class_mode: request.class_mode,
            input_len,
            device,
            base: SharedWeights::new(base),
            head: SharedWeights::new(head),
            base_layer,
            head_layer,
        })
    }

    fn inputs(&self, images: &[Vec<f32>]) -> TrainingResult<Tensor> {
        let mut flat = Vec::with_capacity(images.len() * self.input_len);
        for image in images {
            if image.len() != self.input_len {
                return Err(TrainingError::Trainer(format!(
                    "input has {} values, model expects {}",
                    image.len(),
                    self.input_len
                )));
            }
            flat.extend_from_slice(image);
        }
        Ok(Tensor::from_vec(flat, (images.len(), self.input_len), &self.device)?)
    }

    /// Multi-hot targets; missing trailing labels count as negative.
    fn targets(&self, labels: &[Vec<f32>]) -> TrainingResult<Tensor> {
        let classes = self.class_names.len();
        let flat: Vec<f32> = labels
            .iter()
            .flat_map(|row| (0..classes).map(move |k| row.get(k).copied().unwrap_or(0.0)))
            .collect();
        Ok(Tensor::from_vec(flat, (labels.len(), classes), &self.device)?)
    }

    fn logits(&self, x: &Tensor) -> TrainingResult<Tensor> {
        let hidden = self.base_layer.forward(x)?.relu()?;
        Ok(self.head_layer.forward(&hidden)?)
    }

    fn weight_vectors(&self, class_weights: &ClassWeights) -> TrainingResult<(Tensor, Tensor)> {
        let classes = self.class_names.len();
        let positive: Vec<f32> = (0..classes).map(|k| class_weights.get(k).positive as f32).collect();
        let negative: Vec<f32> = (0..classes).map(|k| class_weights.get(k).negative as f32).collect();
        Ok((
            Tensor::from_vec(positive, classes, &self.device)?,
            Tensor::from_vec(negative, classes, &self.device)?,
        ))
    }
}

impl Model for MlpModel {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn parameters(&self) -> Vec<SharedWeights> {
        vec![self.base.clone(), self.head.clone()]
    }

    fn base(&self) -> Option<BaseModel> {
        Some(BaseModel { architecture: self.architecture.clone(), weights: self.base.clone() })
    }

    fn predict(&self, images: &[Vec<f32>]) -> TrainingResult<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let logits = self.logits(&self.inputs(images)?)?;
        let probs = match self.class_mode {
            ClassMode::MultiLabel => ops::sigmoid(&logits)?,
            ClassMode::MultiClass => ops::softmax(&logits, D::Minus1)?,
        };
        Ok(probs.to_vec2::<f32>()?)
    }

    fn loss(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<Tensor> {
        if batch.is_empty() {
            return Err(TrainingError::Trainer("cannot compute a loss on an empty batch".to_string()));
        }
        let logits = self.logits(&self.inputs(&batch.images)?)?;
        let labels = self.targets(&batch.labels)?;
        let (positive, negative) = self.weight_vectors(class_weights)?;

        let loss = match self.class_mode {
            ClassMode::MultiLabel => {
                let probs = ops::sigmoid(&logits)?.clamp(EPS, 1.0 - EPS)?;
                let present = labels.mul(&probs.log()?)?.broadcast_mul(&positive)?;
                let absent = labels
                    .affine(-1.0, 1.0)?
                    .mul(&probs.affine(-1.0, 1.0)?.log()?)?
                    .broadcast_mul(&negative)?;
                present.add(&absent)?.mean_all()?.neg()?
            }
            ClassMode::MultiClass => {
                let log_probs = ops::log_softmax(&logits, D::Minus1)?;
                labels.broadcast_mul(&positive)?.mul(&log_probs)?.sum(1)?.mean_all()?.neg()?
            }
        };
        Ok(loss)
    }
}
