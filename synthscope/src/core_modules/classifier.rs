//! Binary classifier over feature vectors.
//!
//! The model manager is generic over [`Classifier`]; the shipped implementation
//! is a standardized logistic regression trained with seeded mini-batch SGD, so
//! the same data and seed always yield the same weights.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::core_modules::label::Label;
use crate::core_modules::training_data::TrainingSet;
use crate::error::{Error, Result};

/// A trainable, serializable two-class model.
pub trait Classifier: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    type Options: Clone + Send + Sync + 'static;

    fn train(set: &TrainingSet, options: &Self::Options) -> Result<Self>;

    /// Input width the model was fitted on.
    fn n_features(&self) -> usize;

    /// Class probabilities indexed by `Label::index`. Caller guarantees the width.
    fn predict_proba(&self, features: &[f64]) -> [f64; 2];

    fn predict(&self, features: &[f64]) -> (Label, f64) {
        let proba = self.predict_proba(features);
        if proba[Label::Synthetic.index()] > proba[Label::Real.index()] {
            (Label::Synthetic, proba[Label::Synthetic.index()])
        } else {
            (Label::Real, proba[Label::Real.index()])
        }
    }
}

/// Fraction of `set` the classifier labels correctly.
pub fn accuracy<C: Classifier>(classifier: &C, set: &TrainingSet) -> Option<f64> {
    if set.is_empty() {
        return None;
    }
    let correct = set
        .features
        .iter()
        .zip(&set.labels)
        .filter(|(row, label)| classifier.predict(row).0 == **label)
        .count();
    Some(correct as f64 / set.len() as f64)
}

#[derive(Debug, Clone)]
pub struct LogRegOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for LogRegOptions {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

impl From<&TrainingConfig> for LogRegOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            learning_rate: config.learning_rate,
            l2: config.l2,
            batch_size: config.batch_size,
            seed: config.seed,
        }
    }
}

/// Logistic regression on standardized inputs. Output is P(synthetic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticRegression {
    fn standardize<'a>(&'a self, features: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
        features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
    }

    fn logit(&self, features: &[f64]) -> f64 {
        self.standardize(features)
            .zip(&self.weights)
            .fold(self.bias, |sum, (x, w)| sum + x * w)
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn column_stats(rows: &[Vec<f64>], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len().max(1) as f64;
    let mut mean = vec![0.0; dim];
    for row in rows {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x / n;
        }
    }
    let mut scale = vec![0.0; dim];
    for row in rows {
        for (i, x) in row.iter().enumerate() {
            scale[i] += (x - mean[i]).powi(2) / n;
        }
    }
    // Constant columns keep a unit scale so they standardize to zero.
    let scale = scale
        .into_iter()
        .map(|var| if var > 1e-12 { var.sqrt() } else { 1.0 })
        .collect();
    (mean, scale)
}

impl Classifier for LogisticRegression {
    type Options = LogRegOptions;

    fn train(set: &TrainingSet, options: &LogRegOptions) -> Result<Self> {
        set.validate()?;
        if !options.learning_rate.is_finite() || options.learning_rate <= 0.0 {
            return Err(Error::TrainingData("learning rate must be > 0".into()));
        }
        let dim = set.feature_count();
        let (mean, scale) = column_stats(&set.features, dim);

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut model = LogisticRegression {
            mean,
            scale,
            weights: (0..dim).map(|_| (rng.random::<f64>() - 0.5) * 0.01).collect(),
            bias: 0.0,
        };
        let standardized: Vec<Vec<f64>> = set
            .features
            .iter()
            .map(|row| model.standardize(row).collect())
            .collect();
        let targets: Vec<f64> = set
            .labels
            .iter()
            .map(|label| if *label == Label::Synthetic { 1.0 } else { 0.0 })
            .collect();

        let mut indices: Vec<usize> = (0..set.len()).collect();
        let batch_size = options.batch_size.max(1);
        let lr = options.learning_rate;
        let l2 = options.l2.max(0.0);

        for _epoch in 0..options.epochs {
            indices.shuffle(&mut rng);
            for chunk in indices.chunks(batch_size) {
                let mut grad_w = vec![0.0; dim];
                let mut grad_b = 0.0;
                for &idx in chunk {
                    let x = &standardized[idx];
                    let z = x.iter().zip(&model.weights).fold(model.bias, |s, (x, w)| s + x * w);
                    let diff = sigmoid(z) - targets[idx];
                    for (g, xi) in grad_w.iter_mut().zip(x) {
                        *g += diff * xi;
                    }
                    grad_b += diff;
                }
                let inv = 1.0 / chunk.len() as f64;
                for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                    *w -= lr * (g * inv + l2 * *w);
                }
                model.bias -= lr * grad_b * inv;
            }
        }
        Ok(model)
    }

    fn n_features(&self) -> usize {
        self.weights.len()
    }

    fn predict_proba(&self, features: &[f64]) -> [f64; 2] {
        let synthetic = sigmoid(self.logit(features));
        let mut proba = [0.0; 2];
        proba[Label::Synthetic.index()] = synthetic;
        proba[Label::Real.index()] = 1.0 - synthetic;
        proba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::training_data::RowOrigin;

    fn separable() -> TrainingSet {
        let mut set = TrainingSet::new(vec!["a".into(), "b".into()]);
        for i in 0..20 {
            let jitter = i as f64 * 0.01;
            set.push(vec![0.1 + jitter, 5.0], Label::Real, RowOrigin::Base);
            set.push(vec![0.9 - jitter, 5.0], Label::Synthetic, RowOrigin::Base);
        }
        set
    }

    #[test]
    fn learns_a_separable_problem() {
        let model = LogisticRegression::train(&separable(), &LogRegOptions::default()).unwrap();
        assert_eq!(model.n_features(), 2);
        assert_eq!(model.predict(&[0.05, 5.0]).0, Label::Real);
        assert_eq!(model.predict(&[0.95, 5.0]).0, Label::Synthetic);
        assert_eq!(accuracy(&model, &separable()), Some(1.0));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let model = LogisticRegression::train(&separable(), &LogRegOptions::default()).unwrap();
        let [real, synthetic] = model.predict_proba(&[0.4, 5.0]);
        assert!((real + synthetic - 1.0).abs() < 1e-12);
        let (_, confidence) = model.predict(&[0.4, 5.0]);
        assert!((0.5..=1.0).contains(&confidence));
    }

    #[test]
    fn standardizes_rows_independently_of_the_model() {
        let model = LogisticRegression::train(&separable(), &LogRegOptions::default()).unwrap();
        let standardized: Vec<f64> = model.standardize(&vec![0.5, 5.0]).collect();
        assert_eq!(standardized.len(), 2);
        // The constant column keeps unit scale around its mean.
        assert!(standardized[1].abs() < 1e-12);
    }

    #[test]
    fn training_is_deterministic_for_a_seed() {
        let options = LogRegOptions::default();
        let a = LogisticRegression::train(&separable(), &options).unwrap();
        let b = LogisticRegression::train(&separable(), &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_class_fails() {
        let mut set = TrainingSet::new(vec!["a".into()]);
        set.push(vec![1.0], Label::Real, RowOrigin::Base);
        set.push(vec![2.0], Label::Real, RowOrigin::Base);
        let err = LogisticRegression::train(&set, &LogRegOptions::default()).unwrap_err();
        assert!(matches!(err, Error::TrainingData(_)));
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(1000.0), 1.0);
        assert_eq!(sigmoid(-1000.0), 0.0);
    }
}
