// THEORY:
// A `TrainingSet` is the (features, labels) matrix a model is fitted on, plus a
// per-row origin so later runs can extend history instead of replacing it. The
// snapshot written next to every model is exactly the set that produced it.
//
// Base data for bootstrap and retraining is resolved in a fixed order: the last
// training snapshot, then the batch feature store, then a seeded placeholder set
// whose only job is to let the model manager always produce *a* model. Rows that
// came from feedback are dropped from the base because the retrainer recomputes
// them from the feedback store on every run.

use std::path::Path;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core_modules::feature_store::FeatureStore;
use crate::core_modules::label::Label;
use crate::core_modules::utils::atomic_file;
use crate::error::{Error, Result};

/// Where a training row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowOrigin {
    /// Carried over from an earlier snapshot without provenance.
    Base,
    Placeholder,
    /// A batch dataset file, by dataset-relative identifier.
    Dataset { file: String },
    /// A feedback sample, by file name.
    Feedback { file: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<Label>,
    #[serde(default)]
    pub origins: Vec<RowOrigin>,
}

impl TrainingSet {
    pub fn new(feature_names: Vec<String>) -> Self {
        Self {
            feature_names,
            ..Self::default()
        }
    }

    pub fn push(&mut self, features: Vec<f64>, label: Label, origin: RowOrigin) {
        self.features.push(features);
        self.labels.push(label);
        self.origins.push(origin);
    }

    /// Appends `other`; both sets must share the same feature layout.
    pub fn extend(&mut self, other: TrainingSet) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if self.feature_names != other.feature_names {
            return Err(Error::TrainingData(format!(
                "cannot combine feature layouts {:?} and {:?}",
                self.feature_names, other.feature_names
            )));
        }
        let mut other = other.with_origins();
        self.fill_origins();
        self.features.append(&mut other.features);
        self.labels.append(&mut other.labels);
        self.origins.append(&mut other.origins);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    /// Sample counts indexed by `Label::index`.
    pub fn class_counts(&self) -> [usize; 2] {
        let mut counts = [0usize; 2];
        for label in &self.labels {
            counts[label.index()] += 1;
        }
        counts
    }

    /// Checks the set can be fitted.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::TrainingData("training set is empty".into()));
        }
        if self.features.len() != self.labels.len() {
            return Err(Error::TrainingData(format!(
                "{} feature rows but {} labels",
                self.features.len(),
                self.labels.len()
            )));
        }
        let width = self.feature_count();
        if width == 0 {
            return Err(Error::TrainingData("training set has no features".into()));
        }
        if let Some((row, values)) = self.features.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(Error::TrainingData(format!(
                "row {row} has {} features, expected {width}",
                values.len()
            )));
        }
        if self.features.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::TrainingData("training set contains non-finite values".into()));
        }
        let represented = self.class_counts().iter().filter(|&&n| n > 0).count();
        if represented < 2 {
            return Err(Error::TrainingData(format!(
                "need samples of both classes, got {represented} class(es)"
            )));
        }
        Ok(())
    }

    /// Seeded random rows with alternating labels, so both classes are present.
    pub fn placeholder(feature_names: Vec<String>, samples: usize, seed: u64) -> Self {
        let width = feature_names.len();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self::new(feature_names);
        for i in 0..samples.max(2) {
            let row = (0..width).map(|_| rng.random::<f64>()).collect();
            let label = if i % 2 == 0 { Label::Real } else { Label::Synthetic };
            set.push(row, label, RowOrigin::Placeholder);
        }
        set
    }

    /// Keeps only rows whose origin satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&RowOrigin) -> bool) {
        self.fill_origins();
        let mut kept = TrainingSet::new(std::mem::take(&mut self.feature_names));
        let rows = std::mem::take(&mut self.features);
        let labels = std::mem::take(&mut self.labels);
        let origins = std::mem::take(&mut self.origins);
        for ((row, label), origin) in rows.into_iter().zip(labels).zip(origins) {
            if keep(&origin) {
                kept.push(row, label, origin);
            }
        }
        *self = kept;
    }

    /// Removes placeholder rows, but only when the remainder can still be fitted.
    pub fn drop_placeholder_if_viable(&mut self) {
        let mut candidate = self.clone();
        candidate.retain(|origin| *origin != RowOrigin::Placeholder);
        if candidate.len() < self.len() && candidate.validate().is_ok() {
            info!(
                "Dropping {} placeholder rows now that real samples cover both classes",
                self.len() - candidate.len()
            );
            *self = candidate;
        }
    }

    /// Seeded shuffle split into (train, holdout).
    pub fn holdout_split(&self, fraction: f64, seed: u64) -> (TrainingSet, TrainingSet) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let holdout_len = ((self.len() as f64) * fraction.clamp(0.0, 1.0)).floor() as usize;
        let (holdout_idx, train_idx) = indices.split_at(holdout_len);
        (self.subset(train_idx), self.subset(holdout_idx))
    }

    fn subset(&self, indices: &[usize]) -> TrainingSet {
        let mut set = TrainingSet::new(self.feature_names.clone());
        for &i in indices {
            let origin = self.origins.get(i).cloned().unwrap_or(RowOrigin::Base);
            set.push(self.features[i].clone(), self.labels[i], origin);
        }
        set
    }

    fn fill_origins(&mut self) {
        if self.origins.len() < self.labels.len() {
            self.origins.resize(self.labels.len(), RowOrigin::Base);
        }
    }

    fn with_origins(mut self) -> Self {
        self.fill_origins();
        self
    }
}

/// The exact data a persisted model was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    /// Pairs the snapshot with the model artifact written in the same run.
    pub trained_at: DateTime<Utc>,
    #[serde(flatten)]
    pub set: TrainingSet,
}

impl TrainingSnapshot {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        atomic_file::read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_file::write_json_atomic(path, self)
    }
}

/// Which source `load_base` settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSource {
    Snapshot,
    FeatureStore,
    Placeholder,
}

/// Resolves base training data: snapshot, then feature store, then placeholder.
pub fn load_base(
    snapshot_path: &Path,
    feature_store_dir: &Path,
    feature_names: &[String],
    placeholder_samples: usize,
    seed: u64,
) -> (TrainingSet, BaseSource) {
    match TrainingSnapshot::load(snapshot_path) {
        Ok(Some(snapshot)) if snapshot.set.feature_names == feature_names && !snapshot.set.is_empty() => {
            info!(
                "Loaded base training data from {} ({} samples)",
                snapshot_path.display(),
                snapshot.set.len()
            );
            let mut set = snapshot.set.with_origins();
            set.retain(|origin| !matches!(origin, RowOrigin::Feedback { .. }));
            return (set, BaseSource::Snapshot);
        }
        Ok(Some(snapshot)) => warn!(
            "Ignoring training snapshot {} with feature layout {:?}",
            snapshot_path.display(),
            snapshot.set.feature_names
        ),
        Ok(None) => {}
        Err(err) => warn!("Could not load training snapshot, starting fresh: {err}"),
    }

    match FeatureStore::load_training_set(feature_store_dir, feature_names) {
        Ok(Some(set)) if !set.is_empty() => {
            info!(
                "Loaded base training data from feature store {} ({} samples)",
                feature_store_dir.display(),
                set.len()
            );
            return (set, BaseSource::FeatureStore);
        }
        Ok(_) => {}
        Err(err) => warn!("Could not load feature store as base data: {err}"),
    }

    info!("Generating placeholder training data ({placeholder_samples} samples)");
    (
        TrainingSet::placeholder(feature_names.to_vec(), placeholder_samples, seed),
        BaseSource::Placeholder,
    )
}
