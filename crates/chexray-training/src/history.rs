use crate::error::TrainingResult;
use crate::persist::write_json_atomic;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Per-epoch metric series returned by the fit loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    series: BTreeMap<String, Vec<f64>>,
    #[serde(skip)]
    recorded: usize,
}

impl History {
    /// Append one epoch of logs.
    ///
    /// Every series stays indexed by epoch: a metric absent from `logs` gets
    /// NaN for this epoch, and one first seen late is back-filled with NaN.
    pub fn record(&mut self, logs: &BTreeMap<String, f64>) {
        for (name, value) in logs {
            self.series
                .entry(name.clone())
                .or_insert_with(|| vec![f64::NAN; self.recorded])
                .push(*value);
        }
        self.recorded += 1;
        for series in self.series.values_mut() {
            if series.len() < self.recorded {
                series.push(f64::NAN);
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// Number of recorded epochs.
    #[must_use]
    pub fn epochs(&self) -> usize {
        self.recorded
    }

    #[must_use]
    pub fn series(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.series
    }
}

/// `history.json`: the fit history plus the per-class AUROC table.
///
/// Undefined AUROC scores serialize as `null`.
#[derive(Debug, Serialize)]
pub struct HistoryArtifact<'a> {
    pub run: u32,
    pub history: &'a BTreeMap<String, Vec<f64>>,
    pub auroc: &'a BTreeMap<String, Vec<f64>>,
}

impl HistoryArtifact<'_> {
    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        write_json_atomic(path, self)
    }
}
