//! On-disk state of the K2HDKC guest agent.
//!
//! This crate provides the persistence layer: a flat `key=value` codec
//! (`KeyValueCodec`), the primary configuration file holding the user override
//! set (`ConfigurationFile`, behind the `ConfigStore` trait), and the per-key
//! marker files used to detect configuration drift (`MarkerStore`). Every
//! write is atomic: temp file, fsync, rename, directory fsync.

pub mod codec;
pub mod config_file;
pub mod markers;

pub use codec::KeyValueCodec;
pub use config_file::{ConfigStore, ConfigurationFile};
pub use markers::MarkerStore;

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `content` without ever exposing a partial file.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed line {line} in {path}: '{content}'")]
    Parse {
        path: String,
        line: usize,
        content: String,
    },
    #[error("invalid configuration key: '{0}'")]
    InvalidKey(String),
    #[error("invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: &'static str },
}
