use crate::CoreError;
use k2hdkc_schema::{AgentConfig, OverrideSet, RecognizedKey, RECOGNIZED_KEYS};
use k2hdkc_store::{ConfigStore, ConfigurationFile, MarkerStore};
use serde::Serialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What happened to one tracked key during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyChange {
    /// First value for a key that had no marker.
    Set,
    Updated,
    /// The key was dropped and its marker deleted.
    Removed,
    /// The key is unset and stays unset, but counts as a change.
    Unset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// One entry per changed key, in tracking order.
    pub changes: Vec<(String, KeyChange)>,
}

impl ReconcileOutcome {
    /// Whether the service must be restarted to pick up the overrides.
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn change_for(&self, key: &str) -> Option<KeyChange> {
        self.changes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, change)| *change)
    }
}

/// Persists override sets and decides whether they need a restart.
///
/// The configuration file holds the whole set; each tracked key is mirrored
/// into a marker file in the configuration directory, which the service
/// container reads on start-up. A key counts as changed when its requested
/// value differs from its marker.
pub struct ConfigReconciler {
    store: Box<dyn ConfigStore>,
    markers: MarkerStore,
    keys: &'static [RecognizedKey],
}

impl ConfigReconciler {
    /// Creates `config_dir` if needed and opens it to the container user.
    pub fn new(store: Box<dyn ConfigStore>, config_dir: impl Into<PathBuf>) -> Self {
        let dir = config_dir.into();
        prepare_config_dir(&dir);
        Self {
            store,
            markers: MarkerStore::new(dir),
            keys: &RECOGNIZED_KEYS,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            Box::new(ConfigurationFile::new(&config.config_file)),
            &config.config_dir,
        )
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Persist `overrides` and bring the markers in line with them.
    ///
    /// The configuration file is durable before any marker is touched.
    pub fn apply_overrides(&self, overrides: &OverrideSet) -> Result<ReconcileOutcome, CoreError> {
        self.store.apply_user_override(overrides)?;
        self.reconcile_markers(overrides)
    }

    /// Drop the persisted override set and every marker.
    pub fn remove_overrides(&self) -> Result<(), CoreError> {
        for key in self.keys {
            self.markers.remove(key.name)?;
        }
        self.store.remove_user_override()?;
        info!("removed persisted overrides");
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self.store.get_value(key)?)
    }

    /// Compare `overrides` with the markers and update them, leaving the
    /// configuration file alone.
    pub fn reconcile_markers(
        &self,
        overrides: &OverrideSet,
    ) -> Result<ReconcileOutcome, CoreError> {
        let mut outcome = ReconcileOutcome::default();
        for key in self.keys {
            let name = key.name;
            let requested = overrides.get(name);
            let change = match (requested, self.markers.read(name)?) {
                (Some(value), None) => {
                    self.markers.write(name, value)?;
                    Some(KeyChange::Set)
                }
                (Some(value), Some(current)) if value != current => {
                    self.markers.write(name, value)?;
                    Some(KeyChange::Updated)
                }
                (Some(_), Some(_)) => None,
                (None, _) => {
                    if self.markers.remove(name)? {
                        Some(KeyChange::Removed)
                    } else if key.empty_is_changed {
                        Some(KeyChange::Unset)
                    } else {
                        None
                    }
                }
            };
            match change {
                Some(change) => {
                    debug!("{name}: {change:?}");
                    outcome.changes.push((name.to_owned(), change));
                }
                None => debug!("{name}: unchanged"),
            }
        }
        if outcome.changed() {
            info!("{} tracked override(s) changed", outcome.changes.len());
        }
        Ok(outcome)
    }
}

fn prepare_config_dir(dir: &Path) {
    if !dir.exists() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("failed to create {}: {e}", dir.display());
            return;
        }
    }
    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o777)) {
        warn!("failed to chmod 0777 {}: {e}", dir.display());
    }
}
