// THEORY:
// The progress manifest is the batch pipeline's resumability ledger for one
// dataset root. Scanning happens once: eligible files beneath the label
// directories are sorted and cut into fixed-size chunks, and every file starts as
// `pending`. From then on the manifest is only mutated one file status at a time
// and rewritten atomically after each change, so on disk it is never more than
// one file behind the work actually done.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core_modules::label::Label;
use crate::core_modules::utils::atomic_file;
use crate::error::{Error, Result};

const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Completed,
    Error { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManifestCounts {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressManifest {
    pub format_version: u32,
    pub dataset_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chunk_size: usize,
    /// Dataset-relative file ids, in processing order.
    pub chunks: Vec<Vec<String>>,
    pub files: BTreeMap<String, FileStatus>,
    #[serde(skip)]
    path: PathBuf,
}

impl ProgressManifest {
    /// Enumerates `dataset_root` into a fresh manifest. Nothing is written.
    pub fn scan(path: &Path, dataset_root: &Path, chunk_size: usize, extensions: &[String]) -> Result<Self> {
        if !dataset_root.is_dir() {
            return Err(Error::persistence(
                dataset_root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "dataset root is not a directory"),
            ));
        }
        let mut files = Vec::new();
        let mut label_dirs: Vec<_> = std::fs::read_dir(dataset_root)
            .map_err(|source| Error::persistence(dataset_root, source))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .collect();
        label_dirs.sort_by_key(|entry| entry.file_name());

        for dir in label_dirs {
            let dir_name = dir.file_name().to_string_lossy().into_owned();
            if Label::from_dir_name(&dir_name).is_none() {
                debug!("Ignoring non-label directory {dir_name}");
                continue;
            }
            for entry in WalkDir::new(dir.path()).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("Error accessing entry: {err}");
                        continue;
                    }
                };
                if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                    if let Some(id) = file_id(dataset_root, entry.path()) {
                        files.push(id);
                    }
                }
            }
        }
        files.sort();

        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Vec<String>> = files.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let now = Utc::now();
        info!(
            "Scanned {}: {} files in {} chunks",
            dataset_root.display(),
            files.len(),
            chunks.len()
        );
        Ok(Self {
            format_version: MANIFEST_FORMAT_VERSION,
            dataset_root: normalize(dataset_root),
            created_at: now,
            updated_at: now,
            chunk_size,
            files: files.into_iter().map(|f| (f, FileStatus::Pending)).collect(),
            chunks,
            path: path.to_path_buf(),
        })
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        Ok(atomic_file::read_json::<Self>(path)?.map(|mut manifest| {
            manifest.path = path.to_path_buf();
            manifest
        }))
    }

    /// Loads the manifest for `dataset_root`, or scans and persists a new one.
    /// Returns whether a scan happened.
    pub fn load_or_scan(
        path: &Path,
        dataset_root: &Path,
        chunk_size: usize,
        extensions: &[String],
    ) -> Result<(Self, bool)> {
        if let Some(manifest) = Self::load(path)? {
            let actual = normalize(dataset_root);
            if manifest.dataset_root != actual {
                return Err(Error::ManifestMismatch {
                    manifest: path.to_path_buf(),
                    expected: manifest.dataset_root,
                    actual,
                });
            }
            info!("Resuming from manifest {}", path.display());
            return Ok((manifest, false));
        }
        let manifest = Self::scan(path, dataset_root, chunk_size, extensions)?;
        manifest.save()?;
        Ok((manifest, true))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        atomic_file::write_json_atomic(&self.path, self)
    }

    pub fn status(&self, file: &str) -> Option<&FileStatus> {
        self.files.get(file)
    }

    pub fn mark(&mut self, file: &str, status: FileStatus) {
        self.updated_at = Utc::now();
        self.files.insert(file.to_string(), status);
    }

    /// Marks one file and persists immediately.
    pub fn record(&mut self, file: &str, status: FileStatus) -> Result<()> {
        self.mark(file, status);
        self.save()
    }

    pub fn counts(&self) -> ManifestCounts {
        let mut counts = ManifestCounts {
            total: self.files.len(),
            ..ManifestCounts::default()
        };
        for status in self.files.values() {
            match status {
                FileStatus::Pending => counts.pending += 1,
                FileStatus::Completed => counts.completed += 1,
                FileStatus::Error { .. } => counts.errors += 1,
            }
        }
        counts
    }

    pub fn absolute_path(&self, file: &str) -> PathBuf {
        file.split('/').fold(self.dataset_root.clone(), |path, part| path.join(part))
    }
}

/// Label encoded in a file id's first component.
pub fn label_of(file: &str) -> Option<Label> {
    file.split('/').next().and_then(Label::from_dir_name)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn file_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn normalize(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["png".into(), "jpg".into()]
    }

    fn dataset() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (sub, name) in [
            ("real", "b.png"),
            ("real", "a.JPG"),
            ("Fake", "c.png"),
            ("fake", "notes.txt"),
            ("misc", "d.png"),
        ] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join(name), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn scan_is_sorted_chunked_and_label_scoped() {
        let data = dataset();
        let manifest = ProgressManifest::scan(&data.path().join("m.json"), data.path(), 2, &extensions()).unwrap();
        assert_eq!(
            manifest.chunks,
            vec![
                vec!["Fake/c.png".to_string(), "real/a.JPG".to_string()],
                vec!["real/b.png".to_string()],
            ]
        );
        assert_eq!(manifest.counts().pending, 3);
        assert_eq!(label_of("Fake/c.png"), Some(Label::Synthetic));
    }

    #[test]
    fn existing_manifest_skips_scanning() {
        let data = dataset();
        let path = data.path().join("m.json");
        let (mut manifest, scanned) = ProgressManifest::load_or_scan(&path, data.path(), 10, &extensions()).unwrap();
        assert!(scanned);
        manifest.record("real/b.png", FileStatus::Completed).unwrap();
        std::fs::write(data.path().join("real").join("new.png"), b"x").unwrap();

        let (resumed, scanned) = ProgressManifest::load_or_scan(&path, data.path(), 10, &extensions()).unwrap();
        assert!(!scanned);
        assert_eq!(resumed.counts().total, 3);
        assert_eq!(resumed.status("real/b.png"), Some(&FileStatus::Completed));
    }

    #[test]
    fn foreign_manifest_is_rejected() {
        let data = dataset();
        let other = TempDir::new().unwrap();
        let path = data.path().join("m.json");
        ProgressManifest::load_or_scan(&path, data.path(), 10, &extensions()).unwrap();
        let err = ProgressManifest::load_or_scan(&path, other.path(), 10, &extensions()).unwrap_err();
        assert!(matches!(err, Error::ManifestMismatch { .. }));
    }

    #[test]
    fn counts_follow_marks() {
        let data = dataset();
        let mut manifest = ProgressManifest::scan(&data.path().join("m.json"), data.path(), 10, &extensions()).unwrap();
        manifest.mark("real/b.png", FileStatus::Completed);
        for file in ["Fake/c.png", "real/a.JPG"] {
            manifest.mark(file, FileStatus::Error { reason: "bad".into() });
        }
        let counts = manifest.counts();
        assert_eq!((counts.total, counts.pending, counts.completed, counts.errors), (3, 0, 1, 2));
    }
}
