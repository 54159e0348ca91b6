use crate::{write_atomic, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file per override key recording the last value applied to the service.
///
/// The container mounts this directory and reads its settings from these
/// files, so their content is the value alone with no trailing newline.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path(key)?.is_file())
    }

    /// Last applied value; an absent or empty file reads as `None`.
    pub fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        let value = fs::read_to_string(&path)?.replace(['\n', '\r'], "");
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    pub fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        write_atomic(&path, value.as_bytes())?;
        debug!("marker {} <- {value}", path.display());
        Ok(())
    }

    /// Delete the marker for `key`. Returns whether a file was removed.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path(key)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        debug!("marker {} removed", path.display());
        Ok(true)
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());

        assert_eq!(markers.read("cluster-name").unwrap(), None);
        markers.write("cluster-name", "c1").unwrap();
        assert_eq!(markers.read("cluster-name").unwrap().as_deref(), Some("c1"));
        assert_eq!(
            fs::read_to_string(dir.path().join("cluster-name")).unwrap(),
            "c1"
        );

        assert!(markers.remove("cluster-name").unwrap());
        assert!(!markers.remove("cluster-name").unwrap());
        assert!(!markers.exists("cluster-name").unwrap());
    }

    #[test]
    fn read_strips_newlines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chmpx-server-port"), "8020\n").unwrap();
        let markers = MarkerStore::new(dir.path());
        assert_eq!(
            markers.read("chmpx-server-port").unwrap().as_deref(),
            Some("8020")
        );
    }

    #[test]
    fn empty_file_reads_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("extdata-url"), "\n").unwrap();
        let markers = MarkerStore::new(dir.path());
        assert_eq!(markers.read("extdata-url").unwrap(), None);
        assert!(markers.exists("extdata-url").unwrap());
    }

    #[test]
    fn path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let markers = MarkerStore::new(dir.path());
        for bad in ["", "..", "../passwd", "a/b", "a b"] {
            assert!(
                matches!(markers.write(bad, "x"), Err(StoreError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
