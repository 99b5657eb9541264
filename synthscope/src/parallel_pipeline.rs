// THEORY:
// The parallel pipeline is the batch half of the engine: it turns a labelled
// dataset directory into rows of the feature store, resumably.
//
// Per dataset root the run moves `Uninitialized -> Scanning -> Processing -> Done`
// (or `Interrupted` on cancellation). Files flow through a `WorkerPool`: one
// dispatcher hands tasks round-robin to N stateless workers, each of which reads
// a file, runs it through the shared `FeatureExtractor` and answers on a oneshot
// channel. Results are drained as they arrive.
//
// Runs are serialized per feature store directory across the whole process, so
// two extractors over the same store never interleave appends or manifest writes.
//
// The feature store is shared by every dataset root, so its row ids are the
// manifest's root-relative ids prefixed with the root's `dataset_key`.
//
// Checkpointing is two-level. The manifest is rewritten after every single file;
// the feature store is appended once per chunk (and once more on cancellation for
// whatever the chunk finished). A file is skipped on resume only when the manifest
// says `completed` and the store agrees, or when it is recorded as an error.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, dataset_key};
use crate::core_modules::classifier::Classifier;
use crate::core_modules::extractor::FeatureExtractor;
use crate::core_modules::feature_store::{FeatureStore, StoredRow};
use crate::core_modules::feature_vector::FeatureVector;
use crate::core_modules::label::Label;
use crate::core_modules::manifest::{self, FileStatus, ManifestCounts, ProgressManifest};
use crate::core_modules::model_manager::{ModelHandle, ModelManager};
use crate::core_modules::preprocessor::PreprocessStatus;
use crate::error::{Error, Result};

/// One file handed to the pool.
pub struct ExtractionTask {
    pub file: String,
    pub path: PathBuf,
    pub label: Label,
    pub result_sender: oneshot::Sender<FileExtraction>,
}

/// A worker's answer for one file.
#[derive(Debug, Clone)]
pub struct FileExtraction {
    pub file: String,
    pub label: Label,
    pub result: std::result::Result<FeatureVector, String>,
}

pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<ExtractionTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(extractor: Arc<FeatureExtractor>, size: usize) -> Self {
        let size = size.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<ExtractionTask>();
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel::<ExtractionTask>()).unzip();

        // Dispatcher: round-robin over the workers until the pool is dropped.
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(task).is_err() {
                    warn!("Extraction worker {worker_idx} has stopped");
                }
                worker_idx = (worker_idx + 1) % size;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .map(|mut worker_receiver| {
                let extractor = Arc::clone(&extractor);
                tokio::spawn(async move {
                    while let Some(task) = worker_receiver.recv().await {
                        let extraction = Self::process_file_worker(&extractor, &task).await;
                        // The run may have been cancelled; nobody is listening then.
                        let _ = task.result_sender.send(extraction);
                    }
                })
            })
            .collect();

        Self { task_sender, workers }
    }

    async fn process_file_worker(extractor: &FeatureExtractor, task: &ExtractionTask) -> FileExtraction {
        let result = match tokio::fs::read(&task.path).await {
            Ok(bytes) => match extractor.extract(&bytes).await {
                Ok(extraction) if extraction.preprocess == PreprocessStatus::Passthrough => {
                    Err("image could not be decoded".to_string())
                }
                Ok(extraction) => Ok(extraction.vector),
                Err(err) => Err(err.to_string()),
            },
            Err(err) => Err(format!("failed to read {}: {err}", task.path.display())),
        };
        FileExtraction {
            file: task.file.clone(),
            label: task.label,
            result,
        }
    }

    /// Queues one file and returns the channel its result will arrive on.
    pub fn submit(&self, file: String, path: PathBuf, label: Label) -> Result<oneshot::Receiver<FileExtraction>> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(ExtractionTask {
                file,
                path,
                label,
                result_sender,
            })
            .map_err(|_| Error::Task("failed to send task to worker pool".into()))?;
        Ok(result_receiver)
    }

    /// Closes the queue and waits for in-flight work to finish.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Uninitialized,
    Scanning,
    Processing,
    Interrupted,
    Done,
}

impl BatchState {
    const ALL: [BatchState; 5] = [
        BatchState::Uninitialized,
        BatchState::Scanning,
        BatchState::Processing,
        BatchState::Interrupted,
        BatchState::Done,
    ];

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(BatchState::Uninitialized)
    }
}

/// Emitted after every file result.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub file: String,
    pub status: FileStatus,
    pub counts: ManifestCounts,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExtractionOptions {
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressCallback>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub state: BatchState,
    /// Whether this run performed the initial scan.
    pub scanned: bool,
    pub extracted: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Stored files that the manifest had not yet marked completed.
    pub reconciled: usize,
    pub counts: ManifestCounts,
    pub store_rows: usize,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub dataset_root: PathBuf,
    /// Prefix of this root's row ids in the feature store.
    pub dataset_key: String,
    pub manifest_path: PathBuf,
    pub feature_store_dir: PathBuf,
    pub chunk_size: usize,
    pub workers: usize,
    pub image_extensions: Vec<String>,
}

impl BatchSettings {
    pub fn from_config(config: &Config, dataset_root: impl Into<PathBuf>) -> Self {
        let dataset_root = dataset_root.into();
        Self {
            dataset_key: dataset_key(&dataset_root),
            manifest_path: config.manifest_path(&dataset_root),
            dataset_root,
            feature_store_dir: config.feature_store_dir(),
            chunk_size: config.batch.chunk_size,
            workers: config.worker_count(),
            image_extensions: config.batch.image_extensions.clone(),
        }
    }
}

type RunLocks = std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

static RUN_LOCKS: Lazy<RunLocks> = Lazy::new(Default::default);

/// The process-wide run lock for a feature store directory.
fn run_lock_for(feature_store_dir: &Path) -> Arc<Mutex<()>> {
    let key = std::path::absolute(feature_store_dir).unwrap_or_else(|_| feature_store_dir.to_path_buf());
    let mut locks = RUN_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

pub struct BatchExtractor {
    settings: BatchSettings,
    extractor: Arc<FeatureExtractor>,
    /// Shared with every extractor writing to the same feature store.
    run_lock: Arc<Mutex<()>>,
    /// State of the current or last run in this process.
    live: AtomicU8,
}

impl BatchExtractor {
    pub fn new(settings: BatchSettings, extractor: Arc<FeatureExtractor>) -> Self {
        Self {
            run_lock: run_lock_for(&settings.feature_store_dir),
            settings,
            extractor,
            live: AtomicU8::new(BatchState::Uninitialized.as_u8()),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// State of the running (or last) run, else as recorded on disk.
    pub fn state(&self) -> Result<BatchState> {
        let live = BatchState::from_u8(self.live.load(Ordering::Acquire));
        if live != BatchState::Uninitialized {
            return Ok(live);
        }
        let Some(manifest) = ProgressManifest::load(&self.settings.manifest_path)? else {
            return Ok(BatchState::Uninitialized);
        };
        let processed = FeatureStore::processed_files(&self.settings.feature_store_dir)?;
        let stored = StoredFiles::new(&self.settings.dataset_key, &processed);
        Ok(if outstanding(&manifest, stored) == 0 {
            BatchState::Done
        } else {
            BatchState::Processing
        })
    }

    pub async fn run(&self, options: ExtractionOptions) -> Result<ExtractionReport> {
        let _run = self.run_lock.lock().await;
        let settings = self.settings.clone();
        let feature_names = self.extractor.feature_names().to_vec();

        if !settings.manifest_path.exists() {
            info!("Scanning dataset {}", settings.dataset_root.display());
            self.set_state(BatchState::Scanning);
        }
        let (mut manifest, scanned, mut store) = tokio::task::spawn_blocking(move || {
            let (manifest, scanned) = ProgressManifest::load_or_scan(
                &settings.manifest_path,
                &settings.dataset_root,
                settings.chunk_size,
                &settings.image_extensions,
            )?;
            let store = FeatureStore::open(&settings.feature_store_dir, &feature_names)?;
            Ok::<_, Error>((manifest, scanned, store))
        })
        .await??;
        self.set_state(BatchState::Processing);

        let mut report = ExtractionReport {
            state: BatchState::Processing,
            scanned,
            extracted: 0,
            failed: 0,
            skipped: 0,
            reconciled: reconcile(&mut manifest, self.stored(&store))?,
            counts: manifest.counts(),
            store_rows: store.len(),
        };

        if outstanding(&manifest, self.stored(&store)) == 0 {
            info!("Nothing left to extract under {}", self.settings.dataset_root.display());
            report.skipped = manifest.files.len();
        } else {
            let pool = WorkerPool::new(Arc::clone(&self.extractor), self.settings.workers);
            let interrupted = self.process_chunks(&pool, &mut manifest, &mut store, &options, &mut report).await?;
            if interrupted {
                // In-flight tasks are abandoned; their files are still pending.
                drop(pool);
                report.state = BatchState::Interrupted;
            } else {
                pool.shutdown().await;
            }
        }

        if report.state != BatchState::Interrupted {
            report.state = if outstanding(&manifest, self.stored(&store)) == 0 {
                BatchState::Done
            } else {
                BatchState::Processing
            };
        }
        report.counts = manifest.counts();
        report.store_rows = store.len();
        self.set_state(report.state);
        info!(
            "Extraction {:?}: {} extracted, {} failed, {} skipped, {} rows stored",
            report.state, report.extracted, report.failed, report.skipped, report.store_rows
        );
        Ok(report)
    }

    fn stored<'a>(&'a self, store: &'a FeatureStore) -> StoredFiles<'a> {
        StoredFiles::new(&self.settings.dataset_key, store.processed())
    }

    fn set_state(&self, state: BatchState) {
        self.live.store(state.as_u8(), Ordering::Release);
    }

    /// Returns `true` when cancelled.
    async fn process_chunks(
        &self,
        pool: &WorkerPool,
        manifest: &mut ProgressManifest,
        store: &mut FeatureStore,
        options: &ExtractionOptions,
        report: &mut ExtractionReport,
    ) -> Result<bool> {
        let chunks = manifest.chunks.clone();
        for (chunk_idx, chunk) in chunks.iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Ok(true);
            }
            let pending: Vec<&String> = chunk
                .iter()
                .filter(|file| needs_extraction(manifest, self.stored(store), file))
                .collect();
            report.skipped += chunk.len() - pending.len();
            if pending.is_empty() {
                continue;
            }
            debug!("Chunk {chunk_idx}: {} of {} files pending", pending.len(), chunk.len());

            let mut in_flight = FuturesUnordered::new();
            for file in pending {
                let Some(label) = manifest::label_of(file) else {
                    manifest.record(file, FileStatus::Error {
                        reason: "file is not under a label directory".into(),
                    })?;
                    report.failed += 1;
                    continue;
                };
                in_flight.push(pool.submit(file.clone(), manifest.absolute_path(file), label)?);
            }

            let mut rows = Vec::new();
            let mut interrupted = false;
            loop {
                tokio::select! {
                    biased;
                    _ = options.cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    next = in_flight.next() => match next {
                        None => break,
                        Some(Ok(extraction)) => {
                            let status = match extraction.result {
                                Ok(vector) => {
                                    rows.push(StoredRow {
                                        file: row_id(&self.settings.dataset_key, &extraction.file),
                                        label: extraction.label,
                                        features: vector.into_inner(),
                                    });
                                    report.extracted += 1;
                                    FileStatus::Completed
                                }
                                Err(reason) => {
                                    warn!(file = %extraction.file, "Extraction failed: {reason}");
                                    report.failed += 1;
                                    FileStatus::Error { reason }
                                }
                            };
                            manifest.record(&extraction.file, status.clone())?;
                            if let Some(on_progress) = &options.on_progress {
                                on_progress(&ProgressEvent {
                                    file: extraction.file,
                                    status,
                                    counts: manifest.counts(),
                                });
                            }
                        }
                        Some(Err(_)) => return Err(Error::Task("extraction worker dropped a task".into())),
                    }
                }
            }

            if !rows.is_empty() {
                store.append(rows)?;
            }
            if interrupted {
                info!("Extraction interrupted in chunk {chunk_idx}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fits and persists a model from the feature store. Activation is left to `reload`.
    pub async fn train<C: Classifier>(&self, manager: &ModelManager<C>) -> Result<ModelHandle> {
        let dir = self.settings.feature_store_dir.clone();
        let names = manager.feature_names().to_vec();
        let set = tokio::task::spawn_blocking(move || FeatureStore::load_training_set(&dir, &names))
            .await??
            .filter(|set| !set.is_empty())
            .ok_or_else(|| Error::TrainingData("feature store is empty, run extraction first".into()))?;
        info!("Training from feature store ({} samples, {:?})", set.len(), set.class_counts());
        manager.train_and_save(set).await
    }
}

/// Store row id of a root-relative file.
fn row_id(dataset_key: &str, file: &str) -> String {
    format!("{dataset_key}/{file}")
}

/// One dataset root's view of the shared feature store's processed set.
#[derive(Clone, Copy)]
struct StoredFiles<'a> {
    dataset_key: &'a str,
    processed: &'a BTreeSet<String>,
}

impl<'a> StoredFiles<'a> {
    fn new(dataset_key: &'a str, processed: &'a BTreeSet<String>) -> Self {
        Self { dataset_key, processed }
    }

    fn contains(&self, file: &str) -> bool {
        self.processed.contains(&row_id(self.dataset_key, file))
    }

    /// Root-relative ids of this root's stored files.
    fn files(self) -> impl Iterator<Item = &'a str> {
        let prefix = format!("{}/", self.dataset_key);
        self.processed
            .iter()
            .filter_map(move |id| id.strip_prefix(prefix.as_str()))
    }
}

fn needs_extraction(manifest: &ProgressManifest, stored: StoredFiles<'_>, file: &str) -> bool {
    match manifest.status(file) {
        Some(FileStatus::Error { .. }) => false,
        Some(FileStatus::Completed) if stored.contains(file) => false,
        Some(FileStatus::Completed) => {
            debug!(file, "Completed in manifest but missing from store, re-extracting");
            true
        }
        _ => true,
    }
}

/// Files a run would still hand to a worker.
fn outstanding(manifest: &ProgressManifest, stored: StoredFiles<'_>) -> usize {
    manifest
        .files
        .keys()
        .filter(|file| needs_extraction(manifest, stored, file))
        .count()
}

/// Marks stored files completed in the manifest. Returns how many changed.
fn reconcile(manifest: &mut ProgressManifest, stored: StoredFiles<'_>) -> Result<usize> {
    let stale: Vec<String> = stored
        .files()
        .filter(|file| matches!(manifest.status(file), Some(status) if *status != FileStatus::Completed))
        .map(str::to_string)
        .collect();
    for file in &stale {
        manifest.mark(file, FileStatus::Completed);
    }
    if !stale.is_empty() {
        info!("Marked {} stored files completed in the manifest", stale.len());
        manifest.save()?;
    }
    Ok(stale.len())
}
