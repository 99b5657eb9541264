//! Fixed-order assembly of detector outcomes into classifier input.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::orchestrator::Outcomes;

/// Value substituted for a missing or non-finite score.
pub const NEUTRAL_SCORE: f64 = 0.0;

/// Ordered scores, one per declared detector. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values.into_iter().map(sanitize).collect())
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() { value } else { NEUTRAL_SCORE }
}

/// Builds a vector of exactly `declared_order.len()` elements. Completion order
/// of the detectors plays no part; only the declared order does.
pub fn build(outcomes: &Outcomes, declared_order: &[String]) -> FeatureVector {
    let values = declared_order
        .iter()
        .map(|name| match outcomes.get(name).and_then(|o| o.score) {
            Some(score) if score.is_finite() => score,
            Some(score) => {
                debug!(detector = %name, "Non-finite score {score} replaced with neutral value");
                NEUTRAL_SCORE
            }
            None => NEUTRAL_SCORE,
        })
        .collect();
    FeatureVector(values)
}

/// Holds the deployed feature order.
#[derive(Debug, Clone)]
pub struct FeatureVectorBuilder {
    declared_order: Vec<String>,
}

impl FeatureVectorBuilder {
    pub fn new(declared_order: Vec<String>) -> Self {
        Self { declared_order }
    }

    pub fn declared_order(&self) -> &[String] {
        &self.declared_order
    }

    pub fn build(&self, outcomes: &Outcomes) -> FeatureVector {
        build(outcomes, &self.declared_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::orchestrator::AnalysisOutcome;

    fn outcome(name: &str, score: Option<f64>) -> AnalysisOutcome {
        AnalysisOutcome {
            detector: name.to_string(),
            score,
            error: score.is_none().then(|| "failed".to_string()),
        }
    }

    fn order(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn length_follows_declared_order_not_outcomes() {
        let outcomes: Outcomes = vec![outcome("b", Some(0.5)), outcome("a", None)].into_iter().collect();
        let vector = build(&outcomes, &order(&["a", "b", "c"]));
        assert_eq!(vector.as_slice(), &[0.0, 0.5, 0.0]);
    }

    #[test]
    fn non_finite_scores_are_neutralized() {
        let outcomes: Outcomes = vec![
            outcome("nan", Some(f64::NAN)),
            outcome("inf", Some(f64::INFINITY)),
            outcome("ok", Some(0.25)),
        ]
        .into_iter()
        .collect();
        let builder = FeatureVectorBuilder::new(order(&["ok", "nan", "inf"]));
        assert_eq!(builder.build(&outcomes).as_slice(), &[0.25, 0.0, 0.0]);
    }

    #[test]
    fn empty_outcomes_still_fill_every_slot() {
        let vector = build(&Outcomes::default(), &order(&["x", "y"]));
        assert_eq!(vector.len(), 2);
        assert!(vector.as_slice().iter().all(|v| *v == NEUTRAL_SCORE));
    }

    #[test]
    fn from_vec_sanitizes() {
        let vector = FeatureVector::from(vec![1.0, f64::NAN]);
        assert_eq!(vector.into_inner(), vec![1.0, 0.0]);
    }
}
