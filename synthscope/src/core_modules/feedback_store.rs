//! Label-partitioned, append-only storage for user-corrected samples.
//!
//! Layout: `<root>/<label>/<uuid>.<ext>`. Each sample is staged in a temporary
//! file inside its label directory and linked into place with a no-clobber
//! rename, so concurrent submissions can never overwrite one another and a
//! reader never sees a partially written image.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core_modules::label::Label;
use crate::error::{Error, Result};

/// A stored feedback sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackSample {
    pub path: PathBuf,
    pub file_name: String,
    pub label: Label,
}

#[derive(Debug, Clone)]
pub struct FeedbackStore {
    root: PathBuf,
}

impl FeedbackStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn label_dir(&self, label: Label) -> PathBuf {
        self.root.join(label.as_str())
    }

    /// Durably writes `image_bytes` under `label`. Returns once the sample is on disk.
    pub fn save(&self, image_bytes: &[u8], label: Label) -> Result<FeedbackSample> {
        let dir = self.label_dir(label);
        std::fs::create_dir_all(&dir).map_err(|source| Error::persistence(&dir, source))?;

        let mut staged = NamedTempFile::new_in(&dir).map_err(|source| Error::persistence(&dir, source))?;
        staged
            .write_all(image_bytes)
            .map_err(|source| Error::persistence(staged.path(), source))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|source| Error::persistence(staged.path(), source))?;

        let file_name = format!("{}.{}", Uuid::new_v4(), extension_for(image_bytes));
        let path = dir.join(&file_name);
        staged
            .persist_noclobber(&path)
            .map_err(|err| Error::persistence(&path, err.error))?;

        info!("Stored feedback sample {} as {label}", path.display());
        Ok(FeedbackSample { path, file_name, label })
    }

    /// Every stored sample, sorted by label then file name.
    pub fn list(&self) -> Result<Vec<FeedbackSample>> {
        let mut samples = Vec::new();
        for label in Label::ALL {
            let dir = self.label_dir(label);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(Error::persistence(&dir, source)),
            };
            let mut found = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| Error::persistence(&dir, source))?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                // Hidden names cover in-flight temp files.
                if file_name.starts_with('.') {
                    debug!("Skipping {file_name} in {}", dir.display());
                    continue;
                }
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if is_file {
                    found.push(FeedbackSample {
                        path: entry.path(),
                        file_name,
                        label,
                    });
                }
            }
            found.sort_by(|a, b| a.file_name.cmp(&b.file_name));
            samples.extend(found);
        }
        Ok(samples)
    }

    pub fn read(&self, sample: &FeedbackSample) -> Result<Vec<u8>> {
        std::fs::read(&sample.path).map_err(|source| Error::persistence(&sample.path, source))
    }
}

fn extension_for(image_bytes: &[u8]) -> &'static str {
    image::guess_format(image_bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::utils::image_helper;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn samples_land_in_their_label_directory() {
        let dir = TempDir::new().unwrap();
        let store = FeedbackStore::new(dir.path());
        let sample = store.save(&image_helper::solid_png(4, 4, 128), Label::Real).unwrap();

        assert_eq!(sample.path.parent().unwrap(), dir.path().join("real"));
        assert!(sample.file_name.ends_with(".png"));
        assert_eq!(store.list().unwrap(), vec![sample.clone()]);
        assert_eq!(store.read(&sample).unwrap(), image_helper::solid_png(4, 4, 128));
    }

    #[test]
    fn concurrent_saves_never_collide() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FeedbackStore::new(dir.path()));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let label = if i % 2 == 0 { Label::Real } else { Label::Synthetic };
                    store.save(b"identical bytes", label).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let samples = store.list().unwrap();
        assert_eq!(samples.len(), 16);
        assert_eq!(samples.iter().filter(|s| s.label == Label::Synthetic).count(), 8);
    }

    #[test]
    fn hidden_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store = FeedbackStore::new(dir.path());
        std::fs::create_dir_all(store.label_dir(Label::Synthetic)).unwrap();
        std::fs::write(store.label_dir(Label::Synthetic).join(".tmpXYZ"), b"partial").unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
