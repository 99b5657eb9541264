//! Replace-on-write persistence.
//!
//! Every artifact is written to a temporary file in the destination directory,
//! synced, then renamed over the target. A reader sees either the previous
//! complete file or the new complete file; a failed write leaves the previous
//! file untouched.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|source| Error::persistence(dir, source))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|source| Error::persistence(dir, source))?;
    temp.write_all(data)
        .map_err(|source| Error::persistence(temp.path(), source))?;
    temp.as_file()
        .sync_all()
        .map_err(|source| Error::persistence(temp.path(), source))?;
    temp.persist(path)
        .map_err(|err| Error::persistence(path, err.error))?;
    sync_dir(dir);
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| Error::serialization(path, source))?;
    write_atomic(path, &data)
}

/// Reads a JSON artifact, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(Error::persistence(path, source)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| Error::serialization(path, source))
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: u32,
    }

    #[test]
    fn replaces_existing_file_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &Doc { version: 1 }).unwrap();
        write_json_atomic(&path, &Doc { version: 2 }).unwrap();

        assert_eq!(read_json::<Doc>(&path).unwrap(), Some(Doc { version: 2 }));
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_json::<Doc>(&dir.path().join("absent.json")).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_json::<Doc>(&path), Err(Error::Serialization { .. })));
    }
}
