//! Feedback-driven retraining.
//!
//! `retrain` rebuilds the training set from the base data plus every feedback
//! sample, re-extracting each sample's features through the same
//! `FeatureExtractor` used at inference, then asks the model manager to fit and
//! persist a model. Activation is left to an explicit `reload`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core_modules::classifier::{Classifier, LogisticRegression};
use crate::core_modules::extractor::FeatureExtractor;
use crate::core_modules::feedback_store::FeedbackStore;
use crate::core_modules::model_manager::{ModelHandle, ModelManager};
use crate::core_modules::preprocessor::PreprocessStatus;
use crate::core_modules::training_data::{self, BaseSource, RowOrigin};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct RetrainReport {
    pub model: ModelHandle,
    #[serde(skip)]
    pub base_source: BaseSource,
    pub base_samples: usize,
    pub feedback_samples: usize,
    /// Feedback files that could not be read or decoded, with the reason.
    pub skipped_feedback: Vec<(String, String)>,
}

pub struct RetrainingCoordinator<C: Classifier = LogisticRegression> {
    extractor: Arc<FeatureExtractor>,
    feedback: FeedbackStore,
    model: Arc<ModelManager<C>>,
    /// One retraining run at a time.
    running: Mutex<()>,
}

impl<C: Classifier> RetrainingCoordinator<C> {
    pub fn new(extractor: Arc<FeatureExtractor>, feedback: FeedbackStore, model: Arc<ModelManager<C>>) -> Self {
        Self {
            extractor,
            feedback,
            model,
            running: Mutex::new(()),
        }
    }

    pub async fn retrain(&self) -> Result<RetrainReport> {
        let _running = self.running.lock().await;
        let settings = self.model.settings().clone();

        let (mut set, base_source) = tokio::task::spawn_blocking(move || {
            training_data::load_base(
                &settings.snapshot_path,
                &settings.feature_store_dir,
                &settings.feature_names,
                settings.training.placeholder_samples,
                settings.training.seed,
            )
        })
        .await?;
        let base_samples = set.len();

        let feedback = self.feedback.clone();
        let samples = tokio::task::spawn_blocking(move || feedback.list()).await??;
        info!(
            "Retraining from {base_samples} base samples ({base_source:?}) and {} feedback samples",
            samples.len()
        );

        let mut feedback_samples = 0;
        let mut skipped_feedback = Vec::new();
        for sample in samples {
            let bytes = match tokio::fs::read(&sample.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("Skipping unreadable feedback sample {}: {err}", sample.path.display());
                    skipped_feedback.push((sample.file_name, err.to_string()));
                    continue;
                }
            };
            let extraction = self.extractor.extract(&bytes).await?;
            if extraction.preprocess == PreprocessStatus::Passthrough {
                warn!("Skipping undecodable feedback sample {}", sample.path.display());
                skipped_feedback.push((sample.file_name, "image could not be decoded".to_string()));
                continue;
            }
            set.push(
                extraction.vector.into_inner(),
                sample.label,
                RowOrigin::Feedback {
                    file: sample.file_name,
                },
            );
            feedback_samples += 1;
        }

        set.drop_placeholder_if_viable();
        let model = self.model.train_and_save(set).await?;
        Ok(RetrainReport {
            model,
            base_source,
            base_samples,
            feedback_samples,
            skipped_feedback,
        })
    }
}
