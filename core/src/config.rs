use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Load a JSON configuration from disk, writing the provided defaults first if it is missing.
///
/// Fields absent from an existing file are an error rather than silently defaulted, so a stale
/// config is noticed instead of half-applied.
pub fn load_or_init<T, F>(path: &Path, initializer: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded experiment config");
        Ok(value)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let value = initializer();
        let serialized = serde_json::to_string_pretty(&value)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote default experiment config");
        Ok(value)
    }
}

/// Read a non-empty environment variable.
pub fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        seed: u64,
        name: String,
    }

    #[test]
    fn writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let created: Sample = load_or_init(&path, || Sample {
            seed: 7,
            name: "first".into(),
        })
        .unwrap();
        assert!(path.exists());

        let loaded: Sample = load_or_init(&path, || Sample {
            seed: 99,
            name: "ignored".into(),
        })
        .unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ \"seed\": 1 }").unwrap();

        let err = load_or_init::<Sample, _>(&path, || unreachable!()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn unset_override_is_none() {
        assert_eq!(env_override("CONVTRACK_TEST_SURELY_UNSET_VARIABLE"), None);
    }
}
