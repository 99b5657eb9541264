// THEORY:
// A `Detector` is one independent forensic heuristic. The engine treats it as a
// black box with a single obligation: given image bytes, produce a score in [0, 1]
// (or a structured result carrying a `confidence` field), or fail.
//
// Detectors are collected into a `DetectorRegistry` at startup. The registry is
// static and explicit: names are unique, registration order is preserved, and the
// set never changes for the lifetime of the process. That order (or a declared
// permutation of it) is the feature layout the classifier is trained on, so it
// must be auditable rather than discovered at runtime.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{Error, Result};

/// Field extracted from a structured result.
pub const CONFIDENCE_FIELD: &str = "confidence";

/// Failure reported by a single detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("image too small for analysis: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("{0}")]
    Analysis(String),
}

impl From<image::ImageError> for DetectorError {
    fn from(err: image::ImageError) -> Self {
        DetectorError::Decode(err.to_string())
    }
}

/// What a detector returns on success.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreResult {
    Scalar(f64),
    Structured(BTreeMap<String, f64>),
}

impl ScoreResult {
    /// Builds a structured result from `(name, value)` pairs.
    pub fn structured<'a>(fields: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        ScoreResult::Structured(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// The canonical score: the scalar itself, or the `confidence` field.
    pub fn canonical(&self) -> Option<f64> {
        match self {
            ScoreResult::Scalar(value) => Some(*value),
            ScoreResult::Structured(fields) => fields.get(CONFIDENCE_FIELD).copied(),
        }
    }
}

/// A single forensic analysis over raw image bytes.
pub trait Detector: Send + Sync {
    fn analyze(&self, image_bytes: &[u8]) -> std::result::Result<ScoreResult, DetectorError>;
}

impl<F> Detector for F
where
    F: Fn(&[u8]) -> std::result::Result<ScoreResult, DetectorError> + Send + Sync,
{
    fn analyze(&self, image_bytes: &[u8]) -> std::result::Result<ScoreResult, DetectorError> {
        self(image_bytes)
    }
}

/// A registered detector and the name it is keyed by.
#[derive(Clone)]
pub struct DetectorDescriptor {
    pub name: String,
    pub detector: Arc<dyn Detector>,
}

impl fmt::Debug for DetectorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorDescriptor").field("name", &self.name).finish()
    }
}

/// Ordered, append-only set of detectors.
#[derive(Debug, Clone, Default)]
pub struct DetectorRegistry {
    descriptors: Vec<DetectorDescriptor>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a detector under a unique name.
    pub fn register(&mut self, name: impl Into<String>, detector: impl Detector + 'static) -> Result<()> {
        self.register_arc(name, Arc::new(detector))
    }

    pub fn register_arc(&mut self, name: impl Into<String>, detector: Arc<dyn Detector>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Registry("detector name must not be empty".into()));
        }
        if self.contains(&name) {
            return Err(Error::Registry(format!("detector `{name}` is already registered")));
        }
        self.descriptors.push(DetectorDescriptor { name, detector });
        Ok(())
    }

    /// Builder-style registration for static registries.
    pub fn with(mut self, name: impl Into<String>, detector: impl Detector + 'static) -> Result<Self> {
        self.register(name, detector)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }

    pub fn descriptors(&self) -> &[DetectorDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    /// Resolves the feature order: the declared order if given, otherwise
    /// registration order. A declared order must name every registered detector
    /// exactly once.
    pub fn resolve_order(&self, declared: Option<&[String]>) -> Result<Vec<String>> {
        let Some(declared) = declared else {
            return Ok(self.names());
        };
        let mut seen = HashSet::with_capacity(declared.len());
        for name in declared {
            if !self.contains(name) {
                return Err(Error::Config(format!("feature_order names unknown detector `{name}`")));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!("feature_order lists `{name}` twice")));
            }
        }
        if let Some(missing) = self.descriptors.iter().find(|d| !seen.contains(d.name.as_str())) {
            return Err(Error::Config(format!(
                "feature_order omits registered detector `{}`",
                missing.name
            )));
        }
        Ok(declared.to_vec())
    }
}
