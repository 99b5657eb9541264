// THEORY:
// The `Orchestrator` is the fan-out/fan-in stage of the engine. It is not an
// analyzer itself; it owns the registered detector battery and runs every
// detector against one image, collecting a named outcome per detector.
//
// Key architectural principles:
// 1.  **True parallelism**: detectors are CPU-bound, so each one runs on its own
//     blocking thread (`spawn_blocking`) rather than being interleaved on the
//     async scheduler.
// 2.  **Failure isolation**: every task returns an explicit outcome. An error, a
//     panic or a timeout in one detector becomes that detector's failed outcome
//     (score 0.0 downstream) and never touches its siblings.
// 3.  **Complete collection**: `run` returns only once every task has finished or
//     failed, and the outcome map holds exactly one entry per registered name.
// 4.  **No shared mutable state**: each task receives its own copy of the bytes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::core_modules::detector::{CONFIDENCE_FIELD, DetectorRegistry, ScoreResult};

/// Per-detector result of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub detector: String,
    /// `None` when the detector failed or produced no canonical score.
    pub score: Option<f64>,
    /// Captured failure or diagnostic message.
    pub error: Option<String>,
}

impl AnalysisOutcome {
    fn from_result(detector: String, result: ScoreResult) -> Self {
        match result.canonical() {
            Some(score) => Self {
                detector,
                score: Some(score),
                error: None,
            },
            None => {
                let message = format!("structured result has no `{CONFIDENCE_FIELD}` field");
                debug!(detector = %detector, "{message}");
                Self {
                    detector,
                    score: None,
                    error: Some(message),
                }
            }
        }
    }

    fn failed(detector: String, message: String) -> Self {
        warn!(detector = %detector, "Detector failed: {message}");
        Self {
            detector,
            score: None,
            error: Some(message),
        }
    }

    /// Score used for aggregation: failures count as 0.0.
    pub fn effective_score(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcomes of one run, keyed by detector name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcomes {
    entries: BTreeMap<String, AnalysisOutcome>,
}

impl Outcomes {
    pub fn get(&self, detector: &str) -> Option<&AnalysisOutcome> {
        self.entries.get(detector)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisOutcome> {
        self.entries.values()
    }

    /// Effective score per detector.
    pub fn scores(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|(name, outcome)| (name.clone(), outcome.effective_score()))
            .collect()
    }

    /// Error or diagnostic message per failed detector.
    pub fn failures(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(name, outcome)| outcome.error.clone().map(|e| (name.clone(), e)))
            .collect()
    }
}

impl FromIterator<AnalysisOutcome> for Outcomes {
    fn from_iter<I: IntoIterator<Item = AnalysisOutcome>>(iter: I) -> Self {
        let mut entries = BTreeMap::new();
        for outcome in iter {
            if entries.contains_key(&outcome.detector) {
                warn!(detector = %outcome.detector, "Duplicate outcome ignored");
                continue;
            }
            entries.insert(outcome.detector.clone(), outcome);
        }
        Self { entries }
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<DetectorRegistry>,
    detector_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: Arc<DetectorRegistry>, detector_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            detector_timeout,
        }
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// Runs every registered detector against `image_bytes` in parallel.
    pub async fn run(&self, image_bytes: &[u8]) -> Outcomes {
        let tasks = self.registry.descriptors().iter().map(|descriptor| {
            let name = descriptor.name.clone();
            let detector = Arc::clone(&descriptor.detector);
            let input = image_bytes.to_vec();
            let timeout = self.detector_timeout;

            async move {
                let handle = tokio::task::spawn_blocking(move || detector.analyze(&input));
                let joined = match timeout {
                    // On overrun the blocking thread is detached, not killed.
                    Some(limit) => match tokio::time::timeout(limit, handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            return AnalysisOutcome::failed(name, format!("timed out after {limit:?}"));
                        }
                    },
                    None => handle.await,
                };
                match joined {
                    Ok(Ok(result)) => AnalysisOutcome::from_result(name, result),
                    Ok(Err(err)) => AnalysisOutcome::failed(name, err.to_string()),
                    Err(join_err) if join_err.is_panic() => {
                        AnalysisOutcome::failed(name, "detector panicked".to_string())
                    }
                    Err(join_err) => AnalysisOutcome::failed(name, join_err.to_string()),
                }
            }
        });

        join_all(tasks).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detector::{Detector, DetectorError};

    type DetectorResult = std::result::Result<ScoreResult, DetectorError>;

    fn orchestrator(registry: DetectorRegistry) -> Orchestrator {
        Orchestrator::new(Arc::new(registry), Some(Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn failing_detector_is_isolated() {
        let registry = DetectorRegistry::new()
            .with("good", |_: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(0.8)) })
            .unwrap()
            .with("bad", |_: &[u8]| -> DetectorResult { Err(DetectorError::Analysis("boom".into())) })
            .unwrap()
            .with("panics", |_: &[u8]| -> DetectorResult { panic!("detector bug") })
            .unwrap();

        let outcomes = orchestrator(registry).run(b"bytes").await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.get("good").unwrap().score, Some(0.8));
        let bad = outcomes.get("bad").unwrap();
        assert_eq!(bad.effective_score(), 0.0);
        assert_eq!(bad.error.as_deref(), Some("boom"));
        assert_eq!(outcomes.get("panics").unwrap().error.as_deref(), Some("detector panicked"));
        assert_eq!(outcomes.failures().len(), 2);
    }

    #[tokio::test]
    async fn empty_registry_yields_empty_outcomes() {
        let outcomes = orchestrator(DetectorRegistry::new()).run(b"bytes").await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn missing_confidence_field_is_a_diagnostic() {
        let registry = DetectorRegistry::new()
            .with("structured", |_: &[u8]| -> DetectorResult {
                Ok(ScoreResult::structured([("raw", 3.0)]))
            })
            .unwrap();
        let outcomes = orchestrator(registry).run(b"bytes").await;
        let outcome = outcomes.get("structured").unwrap();
        assert_eq!(outcome.score, None);
        assert_eq!(outcome.effective_score(), 0.0);
        assert!(outcome.error.as_deref().unwrap().contains("confidence"));
    }

    #[tokio::test]
    async fn overrunning_detector_times_out() {
        struct Sleepy;
        impl Detector for Sleepy {
            fn analyze(&self, _: &[u8]) -> DetectorResult {
                std::thread::sleep(Duration::from_millis(300));
                Ok(ScoreResult::Scalar(1.0))
            }
        }
        let registry = DetectorRegistry::new()
            .with("sleepy", Sleepy)
            .unwrap()
            .with("fast", |_: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(0.2)) })
            .unwrap();
        let orchestrator = Orchestrator::new(Arc::new(registry), Some(Duration::from_millis(20)));

        let outcomes = orchestrator.run(b"bytes").await;
        assert!(outcomes.get("sleepy").unwrap().error.as_deref().unwrap().contains("timed out"));
        assert_eq!(outcomes.get("fast").unwrap().score, Some(0.2));
    }

    #[tokio::test]
    async fn each_detector_sees_the_same_input() {
        let registry = DetectorRegistry::new()
            .with("len_a", |bytes: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(bytes.len() as f64)) })
            .unwrap()
            .with("len_b", |bytes: &[u8]| -> DetectorResult { Ok(ScoreResult::Scalar(bytes.len() as f64)) })
            .unwrap();
        let outcomes = orchestrator(registry).run(&[7u8; 5]).await;
        assert_eq!(outcomes.scores().values().copied().collect::<Vec<_>>(), vec![5.0, 5.0]);
    }
}
