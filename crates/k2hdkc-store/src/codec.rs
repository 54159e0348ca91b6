use crate::StoreError;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Flat `key<delimiter>value` text format with whole-line comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyValueCodec {
    pub delimiter: char,
    pub comment_marker: char,
}

impl Default for KeyValueCodec {
    fn default() -> Self {
        Self {
            delimiter: '=',
            comment_marker: '#',
        }
    }
}

impl KeyValueCodec {
    /// Parse `input`; `origin` only labels parse errors.
    pub fn parse(&self, input: &str, origin: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut values = BTreeMap::new();
        for (idx, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(self.comment_marker) {
                continue;
            }
            let Some((key, value)) = line.split_once(self.delimiter) else {
                return Err(StoreError::Parse {
                    path: origin.to_owned(),
                    line: idx + 1,
                    content: raw.to_owned(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(StoreError::Parse {
                    path: origin.to_owned(),
                    line: idx + 1,
                    content: raw.to_owned(),
                });
            }
            values.insert(key.to_owned(), value.trim().to_owned());
        }
        Ok(values)
    }

    pub fn serialize<'a>(
        &self,
        header: Option<&str>,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<String, StoreError> {
        let mut out = String::new();
        if let Some(header) = header {
            for line in header.lines() {
                let _ = writeln!(out, "{} {line}", self.comment_marker);
            }
        }
        for (key, value) in entries {
            self.check_entry(key, value)?;
            let _ = writeln!(out, "{key}{}{value}", self.delimiter);
        }
        Ok(out)
    }

    fn check_entry(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key_ok = !key.trim().is_empty()
            && key.trim() == key
            && !key.contains(self.delimiter)
            && !key.starts_with(self.comment_marker)
            && !key.contains(['\n', '\r']);
        if !key_ok {
            return Err(StoreError::InvalidKey(key.to_owned()));
        }
        let reason = if value.contains(['\n', '\r']) {
            "values must be a single line"
        } else if value.trim() != value {
            // parse() trims values
            "values must not start or end with whitespace"
        } else {
            return Ok(());
        };
        Err(StoreError::InvalidValue {
            key: key.to_owned(),
            reason,
        })
    }
}
