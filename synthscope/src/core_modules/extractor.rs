//! Preprocessor -> Orchestrator -> Builder, as one reusable stage.
//!
//! Inference, feedback retraining and batch extraction all go through this type
//! so the classifier always sees features produced the same way.

use std::sync::Arc;

use crate::config::Config;
use crate::core_modules::detector::DetectorRegistry;
use crate::core_modules::feature_vector::{FeatureVector, FeatureVectorBuilder};
use crate::core_modules::orchestrator::{Orchestrator, Outcomes};
use crate::core_modules::preprocessor::{PreprocessStatus, Preprocessor};
use crate::error::Result;

/// Everything one extraction produced.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub preprocess: PreprocessStatus,
    pub outcomes: Outcomes,
    pub vector: FeatureVector,
}

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    preprocessor: Preprocessor,
    orchestrator: Orchestrator,
    builder: FeatureVectorBuilder,
}

impl FeatureExtractor {
    pub fn new(preprocessor: Preprocessor, orchestrator: Orchestrator, builder: FeatureVectorBuilder) -> Self {
        Self {
            preprocessor,
            orchestrator,
            builder,
        }
    }

    /// Wires the stages from configuration, validating the declared feature order
    /// against the registry.
    pub fn from_config(config: &Config, registry: DetectorRegistry) -> Result<Self> {
        let order = registry.resolve_order(config.feature_order.as_deref())?;
        Ok(Self::new(
            Preprocessor::new(config.preprocess.max_long_edge, config.preprocess.min_short_edge),
            Orchestrator::new(Arc::new(registry), config.detector_timeout()),
            FeatureVectorBuilder::new(order),
        ))
    }

    pub fn feature_names(&self) -> &[String] {
        self.builder.declared_order()
    }

    pub async fn extract(&self, image_bytes: &[u8]) -> Result<Extraction> {
        let preprocessor = self.preprocessor.clone();
        let input = image_bytes.to_vec();
        let preprocessed = tokio::task::spawn_blocking(move || preprocessor.process(&input)).await?;

        let outcomes = self.orchestrator.run(&preprocessed.bytes).await;
        let vector = self.builder.build(&outcomes);
        Ok(Extraction {
            preprocess: preprocessed.status,
            outcomes,
            vector,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detector::{DetectorError, ScoreResult};
    use crate::core_modules::utils::image_helper;

    type DetectorResult = std::result::Result<ScoreResult, DetectorError>;

    #[tokio::test]
    async fn extraction_follows_declared_order() {
        let registry = DetectorRegistry::new()
            .with("first", |_: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(0.1)) })
            .unwrap()
            .with("second", |_: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(0.9)) })
            .unwrap();
        let mut config = Config::default();
        config.feature_order = Some(vec!["second".into(), "first".into()]);

        let extractor = FeatureExtractor::from_config(&config, registry).unwrap();
        let extraction = extractor.extract(&image_helper::solid_png(8, 8, 10)).await.unwrap();

        assert_eq!(extractor.feature_names(), &["second", "first"]);
        assert_eq!(extraction.vector.as_slice(), &[0.9, 0.1]);
        assert!(matches!(extraction.preprocess, PreprocessStatus::Reencoded { resized: false, .. }));
    }

    #[tokio::test]
    async fn undecodable_input_still_produces_a_vector() {
        let registry = crate::core_modules::detectors::standard_registry().unwrap();
        let extractor = FeatureExtractor::from_config(&Config::default(), registry).unwrap();
        let extraction = extractor.extract(b"garbage").await.unwrap();
        assert_eq!(extraction.preprocess, PreprocessStatus::Passthrough);
        assert_eq!(extraction.vector.len(), 6);
        assert_eq!(extraction.outcomes.failures().len(), 6);
    }
}
