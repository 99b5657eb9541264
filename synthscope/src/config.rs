// THEORY:
// A single `Config` value describes one deployment of the engine: where its
// persisted artifacts live, how the preprocessor bounds images, how long a
// detector may run, the declared feature order, the training hyperparameters and
// the batch extraction layout. Every section carries defaults so a missing file
// or a partial TOML document is always usable; the declared feature order is the
// one piece that must be audited by hand, since it fixes the model's input layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Environment variable pointing at a TOML config file.
pub const CONFIG_PATH_ENV: &str = "SYNTHSCOPE_CONFIG";
/// Environment variable overriding `data_dir`.
pub const DATA_DIR_ENV: &str = "SYNTHSCOPE_DATA_DIR";

const MODEL_FILE: &str = "model.json";
const SNAPSHOT_FILE: &str = "model_training_data.json";
const FEEDBACK_DIR: &str = "feedback_dataset";
const MANIFEST_DIR: &str = "manifests";
const FEATURE_STORE_DIR: &str = "feature_store";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for every persisted artifact.
    pub data_dir: PathBuf,
    pub preprocess: PreprocessConfig,
    pub orchestrator: OrchestratorConfig,
    /// Declared feature order. Must be a permutation of the registered detector
    /// names; `None` uses registration order.
    pub feature_order: Option<Vec<String>>,
    pub training: TrainingConfig,
    pub batch: BatchConfig,
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Images whose longer edge exceeds this are scaled down to it.
    pub max_long_edge: u32,
    /// Downscaling never takes the shorter edge below this.
    pub min_short_edge: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wall-clock budget per detector task. `0` disables the bound.
    pub detector_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub seed: u64,
    /// Fraction of samples held out for the report-only accuracy estimate.
    pub holdout_fraction: f64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub batch_size: usize,
    /// Size of the synthetic placeholder set used when no real data exists.
    pub placeholder_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    /// Parallel extraction workers; `None` uses the number of CPUs.
    pub workers: Option<usize>,
    /// Lower-case file extensions eligible for extraction.
    pub image_extensions: Vec<String>,
    /// Override for the progress manifest location. Only sensible when a single
    /// dataset root is ever extracted.
    pub manifest_path: Option<PathBuf>,
    /// Override for the feature store directory.
    pub feature_store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub retrain: RetrainPolicy,
}

/// What happens after a feedback sample is durably written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrainPolicy {
    /// The caller runs `retrain` and `reload_model` explicitly.
    #[default]
    Manual,
    /// A background task runs `retrain` followed by `reload_model`.
    Background,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("synthscope_data"),
            preprocess: PreprocessConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            feature_order: None,
            training: TrainingConfig::default(),
            batch: BatchConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_long_edge: 800,
            min_short_edge: 256,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            detector_timeout_ms: 30_000,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            holdout_fraction: 0.2,
            epochs: 300,
            learning_rate: 0.1,
            l2: 1e-3,
            batch_size: 32,
            placeholder_samples: 100,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            workers: None,
            image_extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
            manifest_path: None,
            feature_store_dir: None,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            retrain: RetrainPolicy::Manual,
        }
    }
}

impl Config {
    /// A default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::persistence(path, source))?;
        Self::from_toml_str(&raw)
    }

    /// Resolve configuration from the environment: the file named by
    /// `SYNTHSCOPE_CONFIG` if set, then the `SYNTHSCOPE_DATA_DIR` override.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from_path(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.preprocess.max_long_edge == 0 || self.preprocess.min_short_edge == 0 {
            return Err(Error::Config("preprocess edge bounds must be > 0".into()));
        }
        if self.preprocess.min_short_edge > self.preprocess.max_long_edge {
            return Err(Error::Config("preprocess.min_short_edge must not exceed max_long_edge".into()));
        }
        if self.batch.chunk_size == 0 {
            return Err(Error::Config("batch.chunk_size must be > 0".into()));
        }
        if self.batch.workers == Some(0) {
            return Err(Error::Config("batch.workers must be > 0".into()));
        }
        let holdout = self.training.holdout_fraction;
        if !(0.0..1.0).contains(&holdout) {
            return Err(Error::Config("training.holdout_fraction must be in [0, 1)".into()));
        }
        if !self.training.learning_rate.is_finite() || self.training.learning_rate <= 0.0 {
            return Err(Error::Config("training.learning_rate must be > 0".into()));
        }
        Ok(())
    }

    pub fn detector_timeout(&self) -> Option<Duration> {
        match self.orchestrator.detector_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.batch.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn model_path(&self) -> PathBuf {
        self.data_dir.join(MODEL_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.data_dir.join(FEEDBACK_DIR)
    }

    /// Progress manifest for `dataset_root`: one file per canonical root under
    /// `data_dir/manifests`, unless overridden.
    pub fn manifest_path(&self, dataset_root: &Path) -> PathBuf {
        if let Some(path) = &self.batch.manifest_path {
            return path.clone();
        }
        self.data_dir
            .join(MANIFEST_DIR)
            .join(format!("{}.json", dataset_key(dataset_root)))
    }

    pub fn feature_store_dir(&self) -> PathBuf {
        self.batch
            .feature_store_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(FEATURE_STORE_DIR))
    }
}

/// `<root name>-<uuid v5 of the canonical root>`; stable across runs and distinct
/// per dataset root.
pub fn dataset_key(dataset_root: &Path) -> String {
    let root = std::fs::canonicalize(dataset_root)
        .or_else(|_| std::path::absolute(dataset_root))
        .unwrap_or_else(|_| dataset_root.to_path_buf());
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, root.to_string_lossy().as_bytes());
    let name: String = root
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() {
        id.simple().to_string()
    } else {
        format!("{name}-{}", id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            data_dir = "/var/lib/synthscope"
            feature_order = ["cfa", "ela"]

            [batch]
            chunk_size = 8

            [feedback]
            retrain = "background"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/synthscope"));
        assert_eq!(config.batch.chunk_size, 8);
        assert_eq!(config.batch.image_extensions, vec!["png", "jpg", "jpeg"]);
        assert_eq!(config.preprocess.max_long_edge, 800);
        assert_eq!(config.preprocess.min_short_edge, 256);
        assert_eq!(config.feedback.retrain, RetrainPolicy::Background);
        assert_eq!(config.feature_order.as_deref(), Some(&["cfa".to_string(), "ela".to_string()][..]));
        assert_eq!(config.model_path(), PathBuf::from("/var/lib/synthscope/model.json"));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = Config::from_toml_str("[batch]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_timeout_disables_bound() {
        let mut config = Config::default();
        config.orchestrator.detector_timeout_ms = 0;
        assert_eq!(config.detector_timeout(), None);
        assert_eq!(Config::default().detector_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn each_dataset_root_gets_its_own_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        let config = Config::with_data_dir(dir.path().join("data"));

        let manifest_a = config.manifest_path(&a);
        assert_ne!(manifest_a, config.manifest_path(&b));
        assert_eq!(manifest_a, config.manifest_path(&a.join(".")));
        assert!(manifest_a.starts_with(dir.path().join("data").join("manifests")));
        assert!(manifest_a.file_name().unwrap().to_string_lossy().starts_with("a-"));

        let mut pinned = config.clone();
        pinned.batch.manifest_path = Some(PathBuf::from("/tmp/progress.json"));
        assert_eq!(pinned.manifest_path(&a), PathBuf::from("/tmp/progress.json"));
    }
}
