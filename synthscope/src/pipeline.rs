// THEORY:
// The `pipeline` module is the top-level API of the engine. `ForensicPipeline`
// wires the stages into the small surface that HTTP or CLI collaborators need:
// analyze an image, submit a correction, retrain, reload, and hand a dataset to
// the batch extractor.
//
// Key architectural principles:
// 1.  **One extraction path**: inference, feedback retraining and batch
//     extraction share a single `FeatureExtractor`, so the classifier never sees
//     features produced differently from the ones it was trained on.
// 2.  **Injected state**: the active model lives in a `ModelManager` owned here,
//     never in ambient global state.
// 3.  **Contained failures**: a failing detector degrades one feature to 0.0 and
//     shows up in `failures`; `analyze` still answers.
// 4.  **Explicit promotion**: `retrain` writes a model, `reload_model` activates
//     it. Only the `background` feedback policy chains the two automatically.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{Config, RetrainPolicy, TrainingConfig};
use crate::core_modules::classifier::{Classifier, LogisticRegression};
use crate::core_modules::detector::DetectorRegistry;
use crate::core_modules::detectors;
use crate::core_modules::extractor::FeatureExtractor;
use crate::core_modules::feedback_store::FeedbackStore;
use crate::core_modules::model_manager::{ModelManager, ModelSettings, ModelState};
use crate::core_modules::retrainer::RetrainingCoordinator;
use crate::error::Result;
use crate::parallel_pipeline::{BatchExtractor, BatchSettings};

// Re-export key data structures for the public API.
pub use crate::core_modules::feature_vector::FeatureVector;
pub use crate::core_modules::label::Label;
pub use crate::core_modules::model_manager::{ModelHandle, Prediction};
pub use crate::core_modules::preprocessor::PreprocessStatus;
pub use crate::core_modules::retrainer::RetrainReport;

/// The answer to `analyze`.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub label: Label,
    /// Probability of `label`, in [0, 1].
    pub confidence: f64,
    /// Effective score per registered detector; failures read 0.0.
    pub per_detector_scores: BTreeMap<String, f64>,
    /// Error or diagnostic per failed detector.
    pub failures: BTreeMap<String, String>,
    pub feature_vector: FeatureVector,
    #[serde(skip)]
    pub preprocess: PreprocessStatus,
}

/// Acknowledges a durably stored feedback sample.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReceipt {
    pub path: PathBuf,
    pub label: Label,
    /// Whether a background retrain was started.
    pub retrain_scheduled: bool,
}

/// Acknowledges a model swap.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReceipt {
    pub trained_at: chrono::DateTime<chrono::Utc>,
    pub training_samples: usize,
}

pub struct ForensicPipeline<C: Classifier = LogisticRegression> {
    config: Config,
    extractor: Arc<FeatureExtractor>,
    model: Arc<ModelManager<C>>,
    feedback: FeedbackStore,
    retrainer: Arc<RetrainingCoordinator<C>>,
}

impl ForensicPipeline<LogisticRegression> {
    /// The standard detector battery with the logistic-regression classifier.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = detectors::standard_registry()?;
        Self::new(config, registry)
    }
}

impl<C> ForensicPipeline<C>
where
    C: Classifier,
    C::Options: for<'a> From<&'a TrainingConfig>,
{
    pub fn new(config: Config, registry: DetectorRegistry) -> Result<Self> {
        config.validate()?;
        let extractor = Arc::new(FeatureExtractor::from_config(&config, registry)?);
        let settings = ModelSettings::from_config(&config, extractor.feature_names().to_vec());
        let options = C::Options::from(&config.training);
        let model = Arc::new(ModelManager::<C>::new(settings, options));
        let feedback = FeedbackStore::new(config.feedback_dir());
        let retrainer = Arc::new(RetrainingCoordinator::new(
            Arc::clone(&extractor),
            feedback.clone(),
            Arc::clone(&model),
        ));
        info!(
            "Pipeline ready with detectors {:?}, data in {}",
            extractor.feature_names(),
            config.data_dir.display()
        );
        Ok(Self {
            config,
            extractor,
            model,
            feedback,
            retrainer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feature_names(&self) -> &[String] {
        self.extractor.feature_names()
    }

    pub fn model_manager(&self) -> &Arc<ModelManager<C>> {
        &self.model
    }

    pub fn model_state(&self) -> ModelState {
        self.model.state()
    }

    pub async fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisReport> {
        let extraction = self.extractor.extract(image_bytes).await?;
        let prediction = self.model.predict(&extraction.vector).await?;
        Ok(AnalysisReport {
            label: prediction.label,
            confidence: prediction.confidence,
            per_detector_scores: extraction.outcomes.scores(),
            failures: extraction.outcomes.failures(),
            feature_vector: extraction.vector,
            preprocess: extraction.preprocess,
        })
    }

    /// Stores a corrected sample. Succeeds once the sample is on disk, whatever
    /// happens to any retrain it triggers.
    pub async fn submit_feedback(&self, image_bytes: &[u8], label: Label) -> Result<FeedbackReceipt> {
        let feedback = self.feedback.clone();
        let bytes = image_bytes.to_vec();
        let sample = tokio::task::spawn_blocking(move || feedback.save(&bytes, label)).await??;

        let retrain_scheduled = match self.config.feedback.retrain {
            RetrainPolicy::Manual => false,
            RetrainPolicy::Background => {
                self.spawn_background_retrain();
                true
            }
        };
        Ok(FeedbackReceipt {
            path: sample.path,
            label,
            retrain_scheduled,
        })
    }

    fn spawn_background_retrain(&self) {
        let retrainer = Arc::clone(&self.retrainer);
        let model = Arc::clone(&self.model);
        tokio::spawn(async move {
            match retrainer.retrain().await {
                Ok(report) => {
                    if let Err(err) = model.reload().await {
                        error!("Background reload failed: {err}");
                    } else {
                        info!("Background retrain activated ({} samples)", report.model.training_samples);
                    }
                }
                Err(err) => error!("Background retrain failed: {err}"),
            }
        });
    }

    /// Writes a new model from base data plus feedback. Call `reload_model` to activate it.
    pub async fn retrain(&self) -> Result<RetrainReport> {
        self.retrainer.retrain().await
    }

    pub async fn reload_model(&self) -> Result<ReloadReceipt> {
        let model = self.model.reload().await?;
        Ok(ReloadReceipt {
            trained_at: model.trained_at(),
            training_samples: model.artifact().training_samples,
        })
    }

    /// A batch extractor over `dataset_root` sharing this pipeline's extraction path.
    pub fn batch_extractor(&self, dataset_root: impl Into<PathBuf>) -> BatchExtractor {
        BatchExtractor::new(
            BatchSettings::from_config(&self.config, dataset_root),
            Arc::clone(&self.extractor),
        )
    }
}
