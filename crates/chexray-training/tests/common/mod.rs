//! Shared helpers for chexray-training integration tests.

use chexray_training::RunConfig;
use std::path::Path;

/// A small 3-class synthetic run that finishes in well under a second.
pub fn synthetic_config_text(output_dir: &Path, epochs: usize) -> String {
    format!(
        r#"
[dataset]
class_names = ["Atelectasis", "Cardiomegaly", "Effusion"]
source = "synthetic"
synthetic_train_size = 24
synthetic_dev_size = 12

[model]
model_name = "mlp:6"
output_weights_name = "weights.json"

[image]
img_dim = 2
color_mode = "grayscale"

[train]
output_dir = '{}'
epochs = {epochs}
batch_size = 8
initial_learning_rate = 0.01
workers = 2
max_queue_size = 4
"#,
        output_dir.display()
    )
}

pub fn synthetic_config(output_dir: &Path, epochs: usize) -> RunConfig {
    RunConfig::from_toml_str(&synthetic_config_text(output_dir, epochs)).unwrap()
}

/// File names directly under `dir` starting with `prefix`.
pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect()
}
