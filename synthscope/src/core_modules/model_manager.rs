// THEORY:
// The `ModelManager` owns the single active model of a process. It replaces the
// ambient global model with an explicit, injectable object whose state machine is
// `Unloaded -> Loading -> Loaded`.
//
// Key architectural principles:
// 1.  **Lazy bootstrap**: the first `predict` (or `reload`) loads the persisted
//     artifact; if none exists, a bootstrap training run over the best available
//     base data produces one. The manager can therefore always answer.
// 2.  **Publish, never mutate**: a model is fully constructed before its `Arc` is
//     published. Readers clone the `Arc` and predict without holding any lock, so
//     a concurrent `reload` can never expose a missing or half-built model.
// 3.  **Two-step promotion**: `train_and_save` only writes artifacts. A new model
//     becomes active solely through an explicit `reload`.
// 4.  **Paired artifacts**: every model is written together with the exact
//     training snapshot that produced it, sharing one `trained_at` stamp.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{Config, TrainingConfig};
use crate::core_modules::classifier::{self, Classifier, LogisticRegression};
use crate::core_modules::feature_vector::FeatureVector;
use crate::core_modules::label::Label;
use crate::core_modules::training_data::{self, TrainingSet, TrainingSnapshot};
use crate::core_modules::utils::atomic_file;
use crate::error::{Error, Result};

const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
}

impl ModelState {
    fn as_u8(self) -> u8 {
        match self {
            ModelState::Unloaded => 0,
            ModelState::Loading => 1,
            ModelState::Loaded => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ModelState::Loading,
            2 => ModelState::Loaded,
            _ => ModelState::Unloaded,
        }
    }
}

/// The persisted model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "C: Classifier")]
pub struct ModelArtifact<C> {
    pub format_version: u32,
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    /// Report-only estimate from the seeded holdout split.
    pub holdout_accuracy: Option<f64>,
    pub classifier: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Label,
    /// Probability of `label`, in [0, 1].
    pub confidence: f64,
}

/// A loaded, immutable model.
#[derive(Debug)]
pub struct ActiveModel<C> {
    artifact: ModelArtifact<C>,
}

impl<C: Classifier> ActiveModel<C> {
    pub fn predict(&self, features: &[f64]) -> Result<Prediction> {
        let expected = self.artifact.classifier.n_features();
        if features.len() != expected {
            return Err(Error::InvalidFeatureShape {
                expected,
                actual: features.len(),
            });
        }
        let (label, confidence) = self.artifact.classifier.predict(features);
        Ok(Prediction {
            label,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.artifact.trained_at
    }

    pub fn artifact(&self) -> &ModelArtifact<C> {
        &self.artifact
    }
}

/// What `train_and_save` wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHandle {
    pub model_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub trained_at: DateTime<Utc>,
    pub training_samples: usize,
    pub class_counts: [usize; 2],
    pub holdout_accuracy: Option<f64>,
}

/// Where the manager's artifacts live and how it trains.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_path: PathBuf,
    pub snapshot_path: PathBuf,
    /// Fallback source of base data for bootstrap.
    pub feature_store_dir: PathBuf,
    pub feature_names: Vec<String>,
    pub training: TrainingConfig,
}

impl ModelSettings {
    pub fn from_config(config: &Config, feature_names: Vec<String>) -> Self {
        Self {
            model_path: config.model_path(),
            snapshot_path: config.snapshot_path(),
            feature_store_dir: config.feature_store_dir(),
            feature_names,
            training: config.training.clone(),
        }
    }
}

pub struct ModelManager<C: Classifier = LogisticRegression> {
    settings: ModelSettings,
    options: C::Options,
    active: RwLock<Option<Arc<ActiveModel<C>>>>,
    /// Serializes loads, bootstraps and reloads.
    gate: Mutex<()>,
    /// Held while a model/snapshot pair is written or read back. Taken after `gate`.
    artifacts: Mutex<()>,
    state: AtomicU8,
}

impl ModelManager<LogisticRegression> {
    pub fn logistic(settings: ModelSettings) -> Self {
        let options = (&settings.training).into();
        Self::new(settings, options)
    }
}

impl<C: Classifier> ModelManager<C> {
    pub fn new(settings: ModelSettings, options: C::Options) -> Self {
        Self {
            settings,
            options,
            active: RwLock::new(None),
            gate: Mutex::new(()),
            artifacts: Mutex::new(()),
            state: AtomicU8::new(ModelState::Unloaded.as_u8()),
        }
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn feature_names(&self) -> &[String] {
        &self.settings.feature_names
    }

    /// The currently published model, if any.
    pub async fn active(&self) -> Option<Arc<ActiveModel<C>>> {
        self.active.read().await.clone()
    }

    pub async fn predict(&self, vector: &FeatureVector) -> Result<Prediction> {
        let model = self.ensure_loaded().await?;
        model.predict(vector.as_slice())
    }

    /// Returns the active model, loading or bootstrapping one on first use.
    pub async fn ensure_loaded(&self) -> Result<Arc<ActiveModel<C>>> {
        if let Some(model) = self.active().await {
            return Ok(model);
        }
        let _gate = self.gate.lock().await;
        // Another caller may have finished loading while we waited.
        if let Some(model) = self.active().await {
            return Ok(model);
        }
        self.set_state(ModelState::Loading);
        match self.load_blocking(true).await {
            Ok(model) => Ok(self.publish(model).await),
            Err(err) => {
                self.set_state(ModelState::Unloaded);
                Err(err)
            }
        }
    }

    /// Re-reads the persisted artifact and swaps it in. On failure the previous
    /// model, if any, stays active.
    pub async fn reload(&self) -> Result<Arc<ActiveModel<C>>> {
        let _gate = self.gate.lock().await;
        let previous = self.active().await;
        self.set_state(ModelState::Loading);
        // A corrupt artifact only falls back to bootstrap when nothing is being served.
        match self.load_blocking(previous.is_none()).await {
            Ok(model) => {
                let model = self.publish(model).await;
                info!("Reloaded model trained at {}", model.trained_at());
                Ok(model)
            }
            Err(err) => {
                warn!("Model reload failed, keeping the previous model: {err}");
                let restored = if previous.is_some() {
                    ModelState::Loaded
                } else {
                    ModelState::Unloaded
                };
                self.set_state(restored);
                Err(err)
            }
        }
    }

    /// Fits a model on `set` and persists it with its snapshot. Does not activate it.
    pub async fn train_and_save(&self, set: TrainingSet) -> Result<ModelHandle> {
        if set.feature_names != self.settings.feature_names {
            return Err(Error::TrainingData(format!(
                "training set features {:?} do not match the declared order {:?}",
                set.feature_names, self.settings.feature_names
            )));
        }
        let settings = self.settings.clone();
        let options = self.options.clone();
        let _artifacts = self.artifacts.lock().await;
        let (handle, _) =
            tokio::task::spawn_blocking(move || train_and_save_blocking::<C>(&settings, &options, set)).await??;
        Ok(handle)
    }

    async fn load_blocking(&self, bootstrap_on_corrupt: bool) -> Result<ActiveModel<C>> {
        let settings = self.settings.clone();
        let options = self.options.clone();
        let _artifacts = self.artifacts.lock().await;
        tokio::task::spawn_blocking(move || load_or_bootstrap::<C>(&settings, &options, bootstrap_on_corrupt))
            .await?
    }

    async fn publish(&self, model: ActiveModel<C>) -> Arc<ActiveModel<C>> {
        let model = Arc::new(model);
        *self.active.write().await = Some(Arc::clone(&model));
        self.set_state(ModelState::Loaded);
        model
    }

    fn set_state(&self, state: ModelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

fn load_or_bootstrap<C: Classifier>(
    settings: &ModelSettings,
    options: &C::Options,
    bootstrap_on_corrupt: bool,
) -> Result<ActiveModel<C>> {
    match atomic_file::read_json::<ModelArtifact<C>>(&settings.model_path) {
        Ok(Some(artifact)) if layout_matches(&artifact, settings) => {
            info!(
                "Loaded model from {} ({} training samples)",
                settings.model_path.display(),
                artifact.training_samples
            );
            return Ok(ActiveModel { artifact });
        }
        Ok(Some(artifact)) => warn!(
            "Model at {} was trained on {:?}, retraining for {:?}",
            settings.model_path.display(),
            artifact.feature_names,
            settings.feature_names
        ),
        Ok(None) => info!("No model at {}, bootstrapping", settings.model_path.display()),
        Err(err) if bootstrap_on_corrupt => warn!("Unreadable model artifact, bootstrapping: {err}"),
        Err(err) => return Err(err),
    }

    let (base, source) = training_data::load_base(
        &settings.snapshot_path,
        &settings.feature_store_dir,
        &settings.feature_names,
        settings.training.placeholder_samples,
        settings.training.seed,
    );
    info!("Bootstrap training from {source:?} ({} samples)", base.len());
    let (_, artifact) = train_and_save_blocking::<C>(settings, options, base)?;
    Ok(ActiveModel { artifact })
}

fn layout_matches<C: Classifier>(artifact: &ModelArtifact<C>, settings: &ModelSettings) -> bool {
    artifact.feature_names == settings.feature_names
        && artifact.classifier.n_features() == settings.feature_names.len()
}

fn train_and_save_blocking<C: Classifier>(
    settings: &ModelSettings,
    options: &C::Options,
    set: TrainingSet,
) -> Result<(ModelHandle, ModelArtifact<C>)> {
    set.validate()?;

    let holdout_accuracy = holdout_accuracy::<C>(&set, options, &settings.training);
    let classifier = C::train(&set, options)?;
    let trained_at = Utc::now();

    let snapshot = TrainingSnapshot { trained_at, set };
    snapshot.save(&settings.snapshot_path)?;

    let artifact = ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        feature_names: settings.feature_names.clone(),
        trained_at,
        training_samples: snapshot.set.len(),
        holdout_accuracy,
        classifier,
    };
    atomic_file::write_json_atomic(&settings.model_path, &artifact)?;

    let handle = ModelHandle {
        model_path: settings.model_path.clone(),
        snapshot_path: settings.snapshot_path.clone(),
        trained_at,
        training_samples: snapshot.set.len(),
        class_counts: snapshot.set.class_counts(),
        holdout_accuracy,
    };
    info!(
        "Saved model to {} ({} samples, real/synthetic {:?})",
        handle.model_path.display(),
        handle.training_samples,
        handle.class_counts
    );
    Ok((handle, artifact))
}

/// Fits on the training split and scores the holdout. Never affects the saved model.
fn holdout_accuracy<C: Classifier>(set: &TrainingSet, options: &C::Options, training: &TrainingConfig) -> Option<f64> {
    if training.holdout_fraction <= 0.0 {
        return None;
    }
    let (train, holdout) = set.holdout_split(training.holdout_fraction, training.seed);
    if holdout.is_empty() || train.validate().is_err() {
        info!("Skipping holdout evaluation, too few samples per class");
        return None;
    }
    let model = C::train(&train, options).ok()?;
    let accuracy = classifier::accuracy(&model, &holdout);
    if let Some(accuracy) = accuracy {
        info!("Holdout accuracy {:.3} on {} samples", accuracy, holdout.len());
    }
    accuracy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::training_data::RowOrigin;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> ModelSettings {
        let config = Config::with_data_dir(dir.path());
        let mut settings = ModelSettings::from_config(&config, vec!["a".into(), "b".into()]);
        settings.training.placeholder_samples = 20;
        settings.training.epochs = 50;
        settings
    }

    fn separable(names: &[String]) -> TrainingSet {
        let mut set = TrainingSet::new(names.to_vec());
        for i in 0..10 {
            let j = i as f64 * 0.01;
            set.push(vec![0.1 + j, 0.2], Label::Real, RowOrigin::Base);
            set.push(vec![0.9 - j, 0.8], Label::Synthetic, RowOrigin::Base);
        }
        set
    }

    #[tokio::test]
    async fn first_predict_bootstraps_a_model() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::logistic(settings(&dir));
        assert_eq!(manager.state(), ModelState::Unloaded);

        let prediction = manager.predict(&FeatureVector::from(vec![0.5, 0.5])).await.unwrap();
        assert!((0.0..=1.0).contains(&prediction.confidence));
        assert_eq!(manager.state(), ModelState::Loaded);
        assert!(manager.settings().model_path.exists());
        assert!(manager.settings().snapshot_path.exists());
    }

    #[tokio::test]
    async fn wrong_width_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::logistic(settings(&dir));
        let err = manager.predict(&FeatureVector::from(vec![0.5])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFeatureShape { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn train_and_save_does_not_swap_until_reload() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::logistic(settings(&dir));
        let bootstrapped = manager.ensure_loaded().await.unwrap();

        let names = manager.feature_names().to_vec();
        let handle = manager.train_and_save(separable(&names)).await.unwrap();
        assert_eq!(handle.class_counts, [10, 10]);
        assert!(handle.holdout_accuracy.is_some());
        assert_eq!(manager.active().await.unwrap().trained_at(), bootstrapped.trained_at());

        let reloaded = manager.reload().await.unwrap();
        assert_eq!(reloaded.trained_at(), handle.trained_at);
        let snapshot = TrainingSnapshot::load(&handle.snapshot_path).unwrap().unwrap();
        assert_eq!(snapshot.trained_at, handle.trained_at);
        assert_eq!(snapshot.set.len(), 20);
    }

    #[tokio::test]
    async fn single_class_training_keeps_previous_model() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::logistic(settings(&dir));
        let before = manager.ensure_loaded().await.unwrap();

        let mut set = TrainingSet::new(manager.feature_names().to_vec());
        set.push(vec![0.1, 0.1], Label::Real, RowOrigin::Base);
        let err = manager.train_and_save(set).await.unwrap_err();
        assert!(matches!(err, Error::TrainingData(_)));

        let after = manager.reload().await.unwrap();
        assert_eq!(after.trained_at(), before.trained_at());
    }

    #[tokio::test]
    async fn corrupt_artifact_on_reload_keeps_serving() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::logistic(settings(&dir));
        manager.ensure_loaded().await.unwrap();
        std::fs::write(&manager.settings().model_path, b"{broken").unwrap();

        assert!(manager.reload().await.is_err());
        assert_eq!(manager.state(), ModelState::Loaded);
        manager.predict(&FeatureVector::from(vec![0.3, 0.3])).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reload_never_exposes_a_missing_model() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ModelManager::logistic(settings(&dir)));
        manager.ensure_loaded().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    manager.reload().await.map(|_| ())
                } else {
                    manager.predict(&FeatureVector::from(vec![0.4, 0.6])).await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(manager.state(), ModelState::Loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bootstrap_and_training_keep_artifacts_paired() {
        for _ in 0..5 {
            let dir = TempDir::new().unwrap();
            let manager = Arc::new(ModelManager::logistic(settings(&dir)));
            let names = manager.feature_names().to_vec();

            let bootstrap = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.ensure_loaded().await.map(|_| ()) })
            };
            let training = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.train_and_save(separable(&names)).await.map(|_| ()) })
            };
            bootstrap.await.unwrap().unwrap();
            training.await.unwrap().unwrap();

            let paths = manager.settings();
            let artifact = atomic_file::read_json::<ModelArtifact<LogisticRegression>>(&paths.model_path)
                .unwrap()
                .unwrap();
            let snapshot = TrainingSnapshot::load(&paths.snapshot_path).unwrap().unwrap();
            assert_eq!(snapshot.trained_at, artifact.trained_at);
            assert_eq!(snapshot.set.len(), artifact.training_samples);
        }
    }
}
