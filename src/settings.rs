//! INI-backed configuration store (§4.9): sections/keys are flattened into
//! `"section.key" -> String` once at startup, and typed lookups parse
//! lazily, falling back to a caller-supplied default (with a WARNING) on a
//! missing key or parse failure rather than ever panicking.

use crate::error::SettingsError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let conf = ini::Ini::load_from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source: ini::Error::Parse(source),
        })?;

        let mut values = HashMap::new();
        for (section, properties) in conf.iter() {
            let section = section.unwrap_or_default();
            for (key, value) in properties.iter() {
                values.insert(format!("{section}.{key}"), value.to_string());
            }
        }

        tracing::info!(path = %path.display(), entries = values.len(), "loaded settings");
        Ok(Settings { values })
    }

    pub fn empty() -> Self {
        Settings {
            values: HashMap::new(),
        }
    }

    /// Parses `key` as `T`, falling back to `default` (with a WARN log) on
    /// a missing key or a parse failure. Never panics.
    pub fn get<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
    {
        match self.values.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, raw, "failed to parse setting, using default");
                default
            }),
            None => default,
        }
    }

    pub fn get_opt<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
    {
        self.values.get(key).and_then(|raw| match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, raw, "failed to parse setting");
                None
            }
        })
    }

    pub fn get_string(&self, key: &str, default: impl Into<String>) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    #[cfg(test)]
    fn from_map(values: HashMap<String, String>) -> Self {
        Settings { values }
    }

    pub fn path_default() -> PathBuf {
        PathBuf::from("/etc/bats-relay/relay.ini")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_returns_default() {
        let settings = Settings::empty();
        assert_eq!(settings.get::<u32>("coding.max_block_size", 65540), 65540);
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        let mut map = HashMap::new();
        map.insert("coding.max_block_size".to_string(), "not-a-number".to_string());
        let settings = Settings::from_map(map);
        assert_eq!(settings.get::<u32>("coding.max_block_size", 65540), 65540);
    }

    #[test]
    fn present_key_parses_successfully() {
        let mut map = HashMap::new();
        map.insert("coding.max_block_size".to_string(), "12345".to_string());
        let settings = Settings::from_map(map);
        assert_eq!(settings.get::<u32>("coding.max_block_size", 65540), 12345);
    }
}
