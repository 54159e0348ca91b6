use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An override key the agent mirrors into its own marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecognizedKey {
    pub name: &'static str,
    /// Report a change even when the key is unset both before and after.
    pub empty_is_changed: bool,
}

/// Override keys consumed by the k2hdkc container on start-up.
pub const RECOGNIZED_KEYS: [RecognizedKey; 5] = [
    RecognizedKey {
        name: "cluster-name",
        empty_is_changed: true,
    },
    RecognizedKey {
        name: "extdata-url",
        empty_is_changed: true,
    },
    RecognizedKey {
        name: "chmpx-server-port",
        empty_is_changed: true,
    },
    RecognizedKey {
        name: "chmpx-server-ctlport",
        empty_is_changed: true,
    },
    RecognizedKey {
        name: "chmpx-slave-ctlport",
        empty_is_changed: true,
    },
];

/// Configuration overrides pushed by the control plane, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OverrideSet(BTreeMap<String, String>);

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// The value for `key`, treating an empty string as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Container environment derived from the overrides.
    ///
    /// `-` is not valid in shell variable names, so every key containing one
    /// is also exported with `-` replaced by `_`. The original keys stay.
    pub fn to_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.0.clone();
        for (key, value) in &self.0 {
            let replaced = key.replace('-', "_");
            if replaced != *key {
                env.insert(replaced, value.clone());
            }
        }
        env
    }
}

impl From<BTreeMap<String, String>> for OverrideSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for OverrideSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
