//! Error types shared across the engine.
//!
//! Per-detector and per-file failures are contained where they happen and never
//! surface through this type; what reaches a caller here is fatal to that one
//! top-level operation only.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Image bytes could not be decoded.
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// A detector failed. Only raised when a caller asks a single detector directly.
    #[error("Detector `{detector}` failed: {reason}")]
    DetectorFailure { detector: String, reason: String },

    /// A feature vector does not match the shape the active model was trained on.
    #[error("Invalid feature shape: expected {expected} features, got {actual}")]
    InvalidFeatureShape { expected: usize, actual: usize },

    /// The training set cannot produce a model (fewer than two classes, ragged rows...).
    #[error("Training data rejected: {0}")]
    TrainingData(String),

    /// A persisted artifact could not be read or written.
    #[error("Persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A persisted artifact exists but could not be (de)serialized.
    #[error("Serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The detector registry rejected a registration.
    #[error("Detector registry error: {0}")]
    Registry(String),

    /// A progress manifest on disk belongs to a different dataset root.
    #[error("Manifest at {manifest} was created for {expected}, not {actual}")]
    ManifestMismatch {
        manifest: PathBuf,
        expected: PathBuf,
        actual: PathBuf,
    },

    /// The feature store on disk was built with a different feature layout.
    #[error("Feature store at {path} holds features {stored:?}, expected {expected:?}")]
    FeatureStoreMismatch {
        path: PathBuf,
        stored: Vec<String>,
        expected: Vec<String>,
    },

    /// A background task could not be joined.
    #[error("Task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Serialization {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}
