use crate::codec::KeyValueCodec;
use crate::{write_atomic, StoreError};
use k2hdkc_schema::OverrideSet;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const HEADER: &str = "Managed by the k2hdkc guest agent. Manual edits are overwritten.";

/// Persistence of the user override set.
pub trait ConfigStore: Send + Sync {
    /// Replace the persisted override set with `overrides`. Durable on return.
    fn apply_user_override(&self, overrides: &OverrideSet) -> Result<(), StoreError>;

    fn remove_user_override(&self) -> Result<(), StoreError>;

    /// Current value of `key`, `None` if unset or empty.
    fn get_value(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// The primary configuration file, e.g. `/etc/antpickax/k2hdkc-trove.cfg`.
#[derive(Debug, Clone)]
pub struct ConfigurationFile {
    path: PathBuf,
    codec: KeyValueCodec,
}

impl ConfigurationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            codec: KeyValueCodec::default(),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: KeyValueCodec) -> Self {
        self.codec = codec;
        self
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All persisted entries; an absent file reads as empty.
    pub fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        self.codec
            .parse(&content, &self.path.to_string_lossy())
    }
}

impl ConfigStore for ConfigurationFile {
    fn apply_user_override(&self, overrides: &OverrideSet) -> Result<(), StoreError> {
        let content = self.codec.serialize(Some(HEADER), overrides.iter())?;
        write_atomic(&self.path, content.as_bytes())?;
        info!(
            "wrote {} override(s) to {}",
            overrides.len(),
            self.path.display()
        );
        Ok(())
    }

    fn remove_user_override(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            info!("removed {}", self.path.display());
        } else {
            debug!("{} already absent", self.path.display());
        }
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.remove(key).filter(|v| !v.is_empty()))
    }
}
