//! Run configuration.
//!
//! A `RunConfig` is a read-only view over four TOML sections (`dataset`,
//! `model`, `image`, `train`). Every lookup resolves with the same precedence:
//!
//! 1. command-line overrides (`--set train.epochs=2`)
//! 2. the configuration file
//! 3. built-in defaults
//!
//! A key missing from all three is absent, which either disables the feature
//! or, for required keys, fails with [`TrainingError::Config`]. The typed
//! sections are resolved and validated once in the constructor, so a
//! `RunConfig` that exists is a valid one.

mod sections;

pub use sections::{
    DatasetKind, DatasetSettings, ImageSettings, ModelSettings, StepCount, TrainSettings,
};

use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

/// Section names accepted in configuration files and overrides.
pub const SECTIONS: [&str; 4] = ["dataset", "model", "image", "train"];

const DEFAULTS: &str = r#"
[dataset]
class_mode = "multilabel"
source = "csv"
features_column = "features"
positive_weights_multiply = 1.0
synthetic_train_size = 64
synthetic_dev_size = 32

[model]
model_name = "mlp"
use_base_model_weights = true
use_ext_base_model_weights = false
use_trained_model_weights = true
use_best_weights = false
show_model_summary = false

[image]
img_dim = 224
color_mode = "rgb"

[train]
epochs = 20
batch_size = 32
initial_learning_rate = 0.001
train_steps = "auto"
validation_steps = "auto"
patience_reduce_lr = 1
reduce_lr_factor = 0.1
min_lr = 0.0
workers = 32
max_queue_size = 32
seed = 42
progress_verbosity = 1
"#;

fn defaults() -> Table {
    // Compile-time constant, so expect is safe
    toml::from_str(DEFAULTS).expect("built-in defaults are valid TOML")
}

/// Where the configuration text came from. Archived verbatim into the
/// output directory of every run.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub text: String,
}

impl ConfigSource {
    /// File name used for the archived copy.
    #[must_use]
    pub fn archive_name(&self) -> String {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map_or_else(|| "run_config.toml".to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// The three precedence layers, highest first.
#[derive(Debug, Clone)]
pub(crate) struct Layers {
    overrides: Table,
    file: Table,
    defaults: Table,
}

impl Layers {
    fn get(&self, section: &str, key: &str) -> Option<&Value> {
        [&self.overrides, &self.file, &self.defaults]
            .into_iter()
            .find_map(|layer| layer.get(section)?.as_table()?.get(key))
    }

    pub(crate) fn value<T: FromValue>(&self, section: &str, key: &str) -> TrainingResult<Option<T>> {
        self.get(section, key)
            .map(|v| {
                T::from_value(v).ok_or_else(|| {
                    TrainingError::config(format!(
                        "[{section}] {key} must be {}, got {v}",
                        T::EXPECTED
                    ))
                })
            })
            .transpose()
    }

    pub(crate) fn require<T: FromValue>(&self, section: &str, key: &str) -> TrainingResult<T> {
        self.value(section, key)?.ok_or_else(|| {
            TrainingError::config(format!("missing required setting [{section}] {key}"))
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    source: ConfigSource,
    layers: Layers,
    dataset: DatasetSettings,
    model: ModelSettings,
    image: ImageSettings,
    train: TrainSettings,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        Self::from_file_with_overrides(path, &[])
    }

    /// Load a configuration file and apply `section.key=value` overrides on top.
    pub fn from_file_with_overrides(path: &Path, overrides: &[String]) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let source = ConfigSource { path: Some(path.to_path_buf()), text };
        Self::build(source, parse_overrides(overrides)?)
    }

    pub fn from_toml_str(text: &str) -> TrainingResult<Self> {
        let source = ConfigSource { path: None, text: text.to_string() };
        Self::build(source, Table::new())
    }

    fn build(source: ConfigSource, overrides: Table) -> TrainingResult<Self> {
        let file: Table = toml::from_str(&source.text)
            .map_err(|e| TrainingError::config(format!("invalid TOML: {e}")))?;
        for section in file.keys() {
            if !SECTIONS.contains(&section.as_str()) {
                tracing::warn!(section = %section, "ignoring unknown configuration section");
            }
        }

        let layers = Layers { overrides, file, defaults: defaults() };
        Ok(Self {
            dataset: DatasetSettings::resolve(&layers)?,
            model: ModelSettings::resolve(&layers)?,
            image: ImageSettings::resolve(&layers)?,
            train: TrainSettings::resolve(&layers)?,
            source,
            layers,
        })
    }

    /// Raw lookup applying override > file > default.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.layers.get(section, key)
    }

    /// Typed lookup. `Ok(None)` means the key is absent everywhere.
    pub fn value<T: FromValue>(&self, section: &str, key: &str) -> TrainingResult<Option<T>> {
        self.layers.value(section, key)
    }

    /// Typed lookup of a key that has no default.
    pub fn require<T: FromValue>(&self, section: &str, key: &str) -> TrainingResult<T> {
        self.layers.require(section, key)
    }

    pub fn bool(&self, section: &str, key: &str) -> TrainingResult<Option<bool>> {
        self.value(section, key)
    }

    pub fn string(&self, section: &str, key: &str) -> TrainingResult<Option<String>> {
        self.value(section, key)
    }

    pub fn number(&self, section: &str, key: &str) -> TrainingResult<Option<f64>> {
        self.value(section, key)
    }

    #[must_use]
    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    #[must_use]
    pub fn dataset(&self) -> &DatasetSettings {
        &self.dataset
    }

    #[must_use]
    pub fn model(&self) -> &ModelSettings {
        &self.model
    }

    #[must_use]
    pub fn image(&self) -> &ImageSettings {
        &self.image
    }

    #[must_use]
    pub fn train(&self) -> &TrainSettings {
        &self.train
    }
}

/// Conversion from a TOML value into a typed setting.
pub trait FromValue: Sized {
    const EXPECTED: &'static str;
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    const EXPECTED: &'static str = "a boolean";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "a string";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "a number";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_float().or_else(|| value.as_integer().map(|i| i as f64))
    }
}

impl FromValue for u64 {
    const EXPECTED: &'static str = "a non-negative integer";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_integer().and_then(|i| u64::try_from(i).ok())
    }
}

impl FromValue for usize {
    const EXPECTED: &'static str = "a non-negative integer";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_integer().and_then(|i| usize::try_from(i).ok())
    }
}

impl FromValue for PathBuf {
    const EXPECTED: &'static str = "a path string";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(PathBuf::from)
    }
}

impl FromValue for Vec<String> {
    const EXPECTED: &'static str = "a list of strings";
    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// Parse `section.key=value` pairs into an override table.
///
/// The value is read as a TOML literal when possible (`2`, `true`, `["a"]`)
/// and as a bare string otherwise, so paths need no quoting.
pub fn parse_overrides(pairs: &[String]) -> TrainingResult<Table> {
    let mut table = Table::new();
    for pair in pairs {
        let (path, raw) = pair
            .split_once('=')
            .ok_or_else(|| TrainingError::config(format!("override '{pair}' is not section.key=value")))?;
        let (section, key) = path
            .trim()
            .split_once('.')
            .ok_or_else(|| TrainingError::config(format!("override '{pair}' is missing a section")))?;
        if !SECTIONS.contains(&section) {
            return Err(TrainingError::config(format!(
                "override '{pair}' names unknown section '{section}' (expected one of {})",
                SECTIONS.join(", ")
            )));
        }

        let raw = raw.trim();
        let value = toml::from_str::<Table>(&format!("v = {raw}"))
            .ok()
            .and_then(|mut t| t.remove("v"))
            .unwrap_or_else(|| Value::String(raw.to_string()));

        table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()))
            .as_table_mut()
            .map(|t| t.insert(key.to_string(), value));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassMode, ColorMode, WeightSource};

    const MINIMAL: &str = r#"
[dataset]
class_names = ["Atelectasis", "Cardiomegaly", "Effusion"]
train_csv = "train.csv"
dev_csv = "dev.csv"

[model]
output_weights_name = "weights.json"

[train]
output_dir = "out"
"#;

    #[test]
    fn test_minimal_config_resolves_defaults() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.dataset().class_names.len(), 3);
        assert_eq!(config.dataset().class_mode, ClassMode::MultiLabel);
        assert_eq!(config.image().img_dim, 224);
        assert_eq!(config.image().color_mode, ColorMode::Rgb);
        assert_eq!(config.train().epochs, 20);
        assert_eq!(config.train().train_steps, StepCount::Auto);
        assert!(config.model().resume);
        assert_eq!(config.model().base_weights, WeightSource::Pretrained("imagenet".to_string()));
    }

    #[test]
    fn test_missing_required_key_fails_fast() {
        let text = MINIMAL.replace("output_weights_name = \"weights.json\"", "");
        let err = RunConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
        assert!(err.to_string().contains("output_weights_name"));
    }

    #[test]
    fn test_required_accessor_reports_missing_key() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        let err = config.require::<String>("model", "base_model_weights_file").unwrap_err();
        assert!(err.to_string().contains("[model] base_model_weights_file"));
        assert_eq!(config.string("model", "base_model_weights_file").unwrap(), None);
    }

    #[test]
    fn test_file_value_beats_default() {
        let text = format!("{MINIMAL}\nepochs = 3\n");
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.value::<u64>("train", "epochs").unwrap(), Some(3));
        assert_eq!(config.train().epochs, 3);
    }

    #[test]
    fn test_override_beats_file_value() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, format!("{MINIMAL}\nepochs = 3\n")).unwrap();

        let config = RunConfig::from_file_with_overrides(
            &path,
            &["train.epochs=7".to_string(), "train.output_dir=/tmp/x".to_string()],
        )
        .unwrap();
        assert_eq!(config.train().epochs, 7);
        assert_eq!(config.train().output_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.source().archive_name(), "run.toml");
    }

    #[test]
    fn test_repeated_reads_are_stable() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        let first = config.number("train", "initial_learning_rate").unwrap();
        for _ in 0..3 {
            assert_eq!(config.number("train", "initial_learning_rate").unwrap(), first);
        }
        assert_eq!(config.bool("model", "show_model_summary").unwrap(), Some(false));
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let text = format!("{MINIMAL}\nepochs = \"many\"\n");
        let err = RunConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("[train] epochs must be a non-negative integer"));
    }

    #[test]
    fn test_override_rejects_unknown_section() {
        let err = parse_overrides(&["optimizer.lr=1".to_string()]).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
    }

    #[test]
    fn test_external_base_weights_require_file() {
        let text = MINIMAL.replace(
            "output_weights_name = \"weights.json\"",
            "output_weights_name = \"weights.json\"\nuse_ext_base_model_weights = true",
        );
        let err = RunConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("base_model_weights_file"));
    }
}
