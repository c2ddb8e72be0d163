//! Model graph contracts.
//!
//! Weights live in [`SharedWeights`], a named group of candle `Var`s.
//! Cloning a `SharedWeights` aliases the storage, it never copies it: the
//! base sub-model handed out by a [`ModelHandle`] and the replicated graph
//! built for multiple accelerators read and write the same tensors as the
//! original single-device graph.

mod mlp;

pub use mlp::{MlpModel, MlpModelProvider};

use crate::dataset::{Batch, ClassWeights};
use crate::error::{TrainingError, TrainingResult};
use crate::persist::write_json_atomic;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassMode {
    /// Independent sigmoid per class.
    MultiLabel,
    /// Softmax over classes.
    MultiClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    Rgb,
    Grayscale,
}

impl ColorMode {
    #[must_use]
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Grayscale => 1,
        }
    }
}

/// Where initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WeightSource {
    /// Random initialization.
    None,
    /// A named pretrained set, e.g. "imagenet".
    Pretrained(String),
    /// A base-model artifact on disk.
    File(PathBuf),
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Pretrained(name) => write!(f, "pretrained:{name}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Host copy of one tensor, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn from_tensor(tensor: &Tensor) -> TrainingResult<Self> {
        Ok(Self { shape: tensor.dims().to_vec(), data: tensor.flatten_all()?.to_vec1::<f32>()? })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Named tensors. Names are unique across all groups of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub tensors: BTreeMap<String, TensorData>,
}

impl WeightSet {
    pub fn get(&self, name: &str) -> TrainingResult<&TensorData> {
        self.tensors
            .get(name)
            .ok_or_else(|| TrainingError::Trainer(format!("missing tensor '{name}'")))
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(TensorData::len).sum()
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// A group of trainable variables backed by one [`VarMap`].
#[derive(Clone)]
pub struct SharedWeights(VarMap);

impl fmt::Debug for SharedWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWeights").field("vars", &self.names()).finish()
    }
}

impl SharedWeights {
    #[must_use]
    pub fn new(map: VarMap) -> Self {
        Self(map)
    }

    #[must_use]
    pub fn var_map(&self) -> &VarMap {
        &self.0
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.data().lock().map(|vars| vars.keys().cloned().collect()).unwrap_or_default();
        names.sort();
        names
    }

    /// Variables sorted by name.
    pub fn vars(&self) -> TrainingResult<Vec<(String, Var)>> {
        let vars = self
            .0
            .data()
            .lock()
            .map_err(|_| TrainingError::Trainer("weight storage lock poisoned".to_string()))?;
        let mut named: Vec<(String, Var)> = vars.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn get(&self, name: &str) -> TrainingResult<Var> {
        self.vars()?
            .into_iter()
            .find_map(|(n, var)| (n == name).then_some(var))
            .ok_or_else(|| TrainingError::Trainer(format!("missing tensor '{name}'")))
    }

    /// True when both handles point at the same storage, not merely equal values.
    #[must_use]
    pub fn same_storage(&self, other: &Self) -> bool {
        std::ptr::eq(self.0.data(), other.0.data())
    }

    /// Host copy of every variable.
    pub fn snapshot(&self) -> TrainingResult<WeightSet> {
        let mut set = WeightSet::default();
        for (name, var) in self.vars()? {
            set.tensors.insert(name, TensorData::from_tensor(var.as_tensor())?);
        }
        Ok(set)
    }

    /// Overwrite every variable of this group that `source` provides.
    ///
    /// Shapes must match; variables absent from `source` keep their values.
    pub fn assign_from(&self, source: &WeightSet) -> TrainingResult<usize> {
        let mut assigned = 0;
        for (name, var) in self.vars()? {
            let Some(incoming) = source.tensors.get(&name) else {
                continue;
            };
            if incoming.shape != var.dims() {
                return Err(TrainingError::Trainer(format!(
                    "tensor '{name}' has shape {:?}, checkpoint has {:?}",
                    var.dims(),
                    incoming.shape
                )));
            }
            let value = Tensor::from_vec(incoming.data.clone(), incoming.shape.as_slice(), var.device())?;
            var.set(&value)?;
            assigned += 1;
        }
        Ok(assigned)
    }
}

/// Architecture plus weights of a (sub-)model, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub architecture: String,
    pub weights: WeightSet,
}

impl ModelArtifact {
    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// The canonical base sub-model: the feature extractor without the
/// classification head.
#[derive(Debug, Clone)]
pub struct BaseModel {
    pub architecture: String,
    pub weights: SharedWeights,
}

impl BaseModel {
    /// Write architecture and weights.
    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        let artifact = ModelArtifact {
            architecture: self.architecture.clone(),
            weights: self.weights.snapshot()?,
        };
        artifact.save(path)
    }
}

/// A trainable graph.
pub trait Model: Send + Sync + fmt::Debug {
    fn architecture(&self) -> &str;

    fn class_names(&self) -> &[String];

    /// Every weight group, base first.
    fn parameters(&self) -> Vec<SharedWeights>;

    fn base(&self) -> Option<BaseModel>;

    /// Per-class probabilities for each input.
    fn predict(&self, images: &[Vec<f32>]) -> TrainingResult<Vec<Vec<f32>>>;

    /// Mean class-weighted loss over the batch, as a scalar tensor that
    /// backpropagates into every parameter.
    fn loss(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<Tensor>;

    /// Mean loss over the batch.
    fn evaluate(&self, batch: &Batch, class_weights: &ClassWeights) -> TrainingResult<f64> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        scalar(&self.loss(batch, class_weights)?)
    }

    /// Number of devices the graph executes on.
    fn devices(&self) -> usize {
        1
    }

    /// Every trainable variable, in parameter-group order.
    fn trainable_vars(&self) -> TrainingResult<Vec<Var>> {
        let mut vars = Vec::new();
        for group in self.parameters() {
            vars.extend(group.vars()?.into_iter().map(|(_, var)| var));
        }
        Ok(vars)
    }

    /// All weights merged into one set.
    fn snapshot(&self) -> TrainingResult<WeightSet> {
        let mut merged = WeightSet::default();
        for group in self.parameters() {
            merged.tensors.extend(group.snapshot()?.tensors);
        }
        Ok(merged)
    }

    fn save_weights(&self, path: &Path) -> TrainingResult<()> {
        self.snapshot()?.save(path)
    }

    fn load_weights(&self, path: &Path) -> TrainingResult<()> {
        let set = WeightSet::load(path)?;
        let mut assigned = 0;
        for group in self.parameters() {
            assigned += group.assign_from(&set)?;
        }
        if assigned != set.tensors.len() {
            return Err(TrainingError::Trainer(format!(
                "{} holds {} tensors, {} matched the model",
                path.display(),
                set.tensors.len(),
                assigned
            )));
        }
        Ok(())
    }

    fn summary(&self) -> TrainingResult<String> {
        let mut out = format!("{} ({} device(s))\n", self.architecture(), self.devices());
        let mut total = 0;
        for group in self.parameters() {
            for (name, var) in group.vars()? {
                out.push_str(&format!("  {name:<16} {:?}\n", var.dims()));
                total += var.elem_count();
            }
        }
        out.push_str(&format!("  total parameters: {total}"));
        Ok(out)
    }
}

/// Read a scalar loss tensor back to the host.
pub fn scalar(loss: &Tensor) -> TrainingResult<f64> {
    Ok(f64::from(loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?))
}

/// Exclusive owner of a trainable graph and the reference to its base sub-model.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    graph: Arc<dyn Model>,
    base: Option<BaseModel>,
}

impl ModelHandle {
    #[must_use]
    pub fn new(graph: Arc<dyn Model>) -> Self {
        let base = graph.base();
        Self { graph, base }
    }

    /// Swap the graph while keeping the base reference of the original.
    #[must_use]
    pub fn with_graph(&self, graph: Arc<dyn Model>) -> Self {
        Self { graph, base: self.base.clone() }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<dyn Model> {
        &self.graph
    }

    #[must_use]
    pub fn base(&self) -> Option<&BaseModel> {
        self.base.as_ref()
    }
}

/// What a [`ModelProvider`] needs to build a graph.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub architecture: &'a str,
    pub class_names: &'a [String],
    pub base_weights: &'a WeightSource,
    pub trained_weights: Option<&'a Path>,
    pub image_dimension: usize,
    pub color_mode: ColorMode,
    pub class_mode: ClassMode,
}

impl BuildRequest<'_> {
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.image_dimension * self.image_dimension * self.color_mode.channels()
    }
}

pub trait ModelProvider: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>) -> TrainingResult<ModelHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::TempDir;

    fn weights(name: &str, values: &[f32]) -> SharedWeights {
        let map = VarMap::new();
        let var = Var::new(values, &Device::Cpu).unwrap();
        map.data().lock().unwrap().insert(name.to_string(), var);
        SharedWeights::new(map)
    }

    fn set(name: &str, values: Vec<f32>) -> WeightSet {
        let mut set = WeightSet::default();
        set.tensors.insert(name.to_string(), TensorData { shape: vec![values.len()], data: values });
        set
    }

    #[test]
    fn test_shared_weights_clone_aliases_storage() {
        let a = weights("w", &[1.0, 2.0]);
        let b = a.clone();
        b.assign_from(&set("w", vec![5.0, 2.0])).unwrap();

        assert!(a.same_storage(&b));
        assert_eq!(a.snapshot().unwrap().get("w").unwrap().data, vec![5.0, 2.0]);

        let copy = weights("w", &[5.0, 2.0]);
        assert!(!a.same_storage(&copy));
        assert_eq!(copy.snapshot().unwrap(), a.snapshot().unwrap());
    }

    #[test]
    fn test_assign_from_rejects_shape_mismatch() {
        let weights = weights("w", &[1.0, 2.0]);
        assert!(weights.assign_from(&set("w", vec![1.0])).is_err());
        assert_eq!(weights.assign_from(&set("w", vec![3.0, 4.0])).unwrap(), 1);
        assert_eq!(weights.assign_from(&set("other", vec![3.0])).unwrap(), 0);
        assert_eq!(weights.get("w").unwrap().as_tensor().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_model_artifact_survives_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("base.json");
        let artifact = ModelArtifact { architecture: "mlp".to_string(), weights: set("w", vec![0.5]) };
        artifact.save(&path).unwrap();
        assert_eq!(ModelArtifact::load(&path).unwrap(), artifact);
    }
}
