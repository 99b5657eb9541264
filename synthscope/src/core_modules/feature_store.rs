// THEORY:
// The feature store is the cumulative output of batch extraction: one row per
// processed file (feature vector + label), plus the set of processed file ids
// that makes extraction idempotent. It only ever grows.
//
// Storage is an arena plus an index:
//   * `rows.jsonl` - append-only, one JSON row per line.
//   * `index.json` - atomically replaced; records how many arena bytes are
//     committed, the row count, the feature layout and the processed set.
//
// A row exists only once the index that covers its bytes has been persisted.
// Anything past `committed_bytes` is an uncommitted tail from an interrupted
// append and is cut off before the next write.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core_modules::label::Label;
use crate::core_modules::training_data::{RowOrigin, TrainingSet};
use crate::core_modules::utils::atomic_file;
use crate::error::{Error, Result};

const ROWS_FILE: &str = "rows.jsonl";
const INDEX_FILE: &str = "index.json";
const STORE_FORMAT_VERSION: u32 = 1;

/// One extracted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub file: String,
    pub label: Label,
    pub features: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreIndex {
    format_version: u32,
    feature_names: Vec<String>,
    committed_bytes: u64,
    rows: usize,
    processed: BTreeSet<String>,
    updated_at: DateTime<Utc>,
}

impl StoreIndex {
    fn empty(feature_names: &[String]) -> Self {
        Self {
            format_version: STORE_FORMAT_VERSION,
            feature_names: feature_names.to_vec(),
            committed_bytes: 0,
            rows: 0,
            processed: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct FeatureStore {
    dir: PathBuf,
    index: StoreIndex,
}

impl FeatureStore {
    /// Opens (or creates) the store at `dir` for the given feature layout.
    pub fn open(dir: &Path, feature_names: &[String]) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|source| Error::persistence(dir, source))?;
        let index = match read_index(dir)? {
            Some(index) => {
                check_layout(dir, &index, feature_names)?;
                index
            }
            None => StoreIndex::empty(feature_names),
        };
        let store = Self {
            dir: dir.to_path_buf(),
            index,
        };
        store.truncate_uncommitted()?;
        info!(
            "Opened feature store {} ({} rows)",
            store.dir.display(),
            store.index.rows
        );
        Ok(store)
    }

    /// Reads an existing store as training data without modifying it.
    pub fn load_training_set(dir: &Path, feature_names: &[String]) -> Result<Option<TrainingSet>> {
        let Some(index) = read_index(dir)? else {
            return Ok(None);
        };
        check_layout(dir, &index, feature_names)?;
        let store = Self {
            dir: dir.to_path_buf(),
            index,
        };
        store.training_set().map(Some)
    }

    /// Processed file ids of the store at `dir`, read without opening it for writing.
    pub fn processed_files(dir: &Path) -> Result<BTreeSet<String>> {
        Ok(read_index(dir)?.map(|index| index.processed).unwrap_or_default())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn feature_names(&self) -> &[String] {
        &self.index.feature_names
    }

    pub fn len(&self) -> usize {
        self.index.rows
    }

    pub fn is_empty(&self) -> bool {
        self.index.rows == 0
    }

    pub fn contains(&self, file: &str) -> bool {
        self.index.processed.contains(file)
    }

    pub fn processed(&self) -> &BTreeSet<String> {
        &self.index.processed
    }

    /// Appends rows for files not yet processed and commits them. Returns the
    /// number of rows actually added.
    pub fn append(&mut self, rows: Vec<StoredRow>) -> Result<usize> {
        let width = self.index.feature_names.len();
        let mut seen = BTreeSet::new();
        let mut buffer = Vec::new();
        for row in rows {
            if row.features.len() != width {
                return Err(Error::InvalidFeatureShape {
                    expected: width,
                    actual: row.features.len(),
                });
            }
            if self.index.processed.contains(&row.file) || !seen.insert(row.file.clone()) {
                debug!(file = %row.file, "Skipping already stored row");
                continue;
            }
            let path = self.rows_path();
            serde_json::to_writer(&mut buffer, &row).map_err(|source| Error::serialization(&path, source))?;
            buffer.push(b'\n');
        }
        if seen.is_empty() {
            return Ok(0);
        }

        let rows_path = self.rows_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&rows_path)
            .map_err(|source| Error::persistence(&rows_path, source))?;
        file.set_len(self.index.committed_bytes)
            .map_err(|source| Error::persistence(&rows_path, source))?;
        file.seek(SeekFrom::End(0))
            .map_err(|source| Error::persistence(&rows_path, source))?;
        file.write_all(&buffer)
            .map_err(|source| Error::persistence(&rows_path, source))?;
        file.sync_all()
            .map_err(|source| Error::persistence(&rows_path, source))?;

        let mut next = self.index.clone();
        next.committed_bytes += buffer.len() as u64;
        next.rows += seen.len();
        next.processed.extend(seen.iter().cloned());
        next.updated_at = Utc::now();
        atomic_file::write_json_atomic(&self.index_path(), &next)?;
        self.index = next;

        info!("Feature store committed {} rows ({} total)", seen.len(), self.index.rows);
        Ok(seen.len())
    }

    /// Every committed row, in append order.
    pub fn rows(&self) -> Result<Vec<StoredRow>> {
        let path = self.rows_path();
        if self.index.committed_bytes == 0 {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|source| Error::persistence(&path, source))?;
        let reader = BufReader::new(file.take(self.index.committed_bytes));
        let mut rows = Vec::with_capacity(self.index.rows);
        for line in reader.lines() {
            let line = line.map_err(|source| Error::persistence(&path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line).map_err(|source| Error::serialization(&path, source))?);
        }
        Ok(rows)
    }

    pub fn training_set(&self) -> Result<TrainingSet> {
        let mut set = TrainingSet::new(self.index.feature_names.clone());
        for row in self.rows()? {
            set.push(row.features, row.label, RowOrigin::Dataset { file: row.file });
        }
        Ok(set)
    }

    fn truncate_uncommitted(&self) -> Result<()> {
        let path = self.rows_path();
        let actual = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(Error::persistence(&path, source)),
        };
        if actual > self.index.committed_bytes {
            warn!(
                "Discarding {} uncommitted bytes from {}",
                actual - self.index.committed_bytes,
                path.display()
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|source| Error::persistence(&path, source))?;
            file.set_len(self.index.committed_bytes)
                .map_err(|source| Error::persistence(&path, source))?;
        }
        Ok(())
    }

    fn rows_path(&self) -> PathBuf {
        self.dir.join(ROWS_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

fn read_index(dir: &Path) -> Result<Option<StoreIndex>> {
    atomic_file::read_json(&dir.join(INDEX_FILE))
}

fn check_layout(dir: &Path, index: &StoreIndex, expected: &[String]) -> Result<()> {
    if index.feature_names != expected {
        return Err(Error::FeatureStoreMismatch {
            path: dir.to_path_buf(),
            stored: index.feature_names.clone(),
            expected: expected.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn row(file: &str, label: Label) -> StoredRow {
        StoredRow {
            file: file.into(),
            label,
            features: vec![0.1, 0.2],
        }
    }

    #[test]
    fn append_dedupes_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = FeatureStore::open(dir.path(), &names()).unwrap();
        let added = store
            .append(vec![row("real/a.png", Label::Real), row("real/a.png", Label::Real)])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.append(vec![row("real/a.png", Label::Real)]).unwrap(), 0);
        store.append(vec![row("fake/b.png", Label::Synthetic)]).unwrap();

        let reopened = FeatureStore::open(dir.path(), &names()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains("fake/b.png"));
        let set = reopened.training_set().unwrap();
        assert_eq!(set.labels, vec![Label::Real, Label::Synthetic]);
    }

    #[test]
    fn uncommitted_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let mut store = FeatureStore::open(dir.path(), &names()).unwrap();
        store.append(vec![row("real/a.png", Label::Real)]).unwrap();

        let mut rows = OpenOptions::new().append(true).open(dir.path().join(ROWS_FILE)).unwrap();
        rows.write_all(b"{\"file\":\"real/partial").unwrap();
        drop(rows);

        let mut reopened = FeatureStore::open(dir.path(), &names()).unwrap();
        assert_eq!(reopened.rows().unwrap().len(), 1);
        reopened.append(vec![row("real/c.png", Label::Real)]).unwrap();
        assert_eq!(reopened.rows().unwrap().len(), 2);
    }

    #[test]
    fn layout_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut store = FeatureStore::open(dir.path(), &names()).unwrap();
        store.append(vec![row("real/a.png", Label::Real)]).unwrap();

        let err = FeatureStore::open(dir.path(), &["x".to_string()]).unwrap_err();
        assert!(matches!(err, Error::FeatureStoreMismatch { .. }));
    }

    #[test]
    fn wrong_row_width_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = FeatureStore::open(dir.path(), &names()).unwrap();
        let mut bad = row("real/a.png", Label::Real);
        bad.features.push(1.0);
        assert!(matches!(store.append(vec![bad]), Err(Error::InvalidFeatureShape { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn missing_store_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(FeatureStore::load_training_set(&dir.path().join("absent"), &names()).unwrap().is_none());
        assert!(FeatureStore::processed_files(&dir.path().join("absent")).unwrap().is_empty());
    }
}
