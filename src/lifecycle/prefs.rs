//! # Preference Store
//!
//! Durable record of the last successfully loaded model identifier, kept in a
//! small JSON file so it survives process restarts. Reading never fails (it
//! degrades to the configured default) and writing is best-effort: a
//! persistence failure must never fail the load that triggered it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    last_model: String,
}

pub struct PreferenceStore {
    path: PathBuf,
    default_model: String,
    /// In-memory copy; the file is read at most once per cold start
    cached: RwLock<Option<String>>,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>, default_model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_model: default_model.into(),
            cached: RwLock::new(None),
        }
    }

    /// The last successfully loaded model, or the default when no valid
    /// record exists. Never fails.
    pub fn load(&self) -> String {
        {
            let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
            if let Some(model) = cached.as_ref() {
                return model.clone();
            }
        }

        let model = self.read_file().unwrap_or_else(|| self.default_model.clone());
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        cached.get_or_insert_with(|| model.clone()).clone()
    }

    /// Persist `model` as the last successfully loaded identifier.
    /// Best-effort: failures are logged and otherwise ignored.
    pub fn save(&self, model: &str) {
        {
            let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
            *cached = Some(model.to_string());
        }

        let settings = Settings {
            last_model: model.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create settings directory {:?}: {}", parent, e);
                    return;
                }
            }
        }
        match serde_json::to_string_pretty(&settings)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(&self.path, json).map_err(anyhow::Error::from))
        {
            Ok(()) => info!("Settings saved: last_model = {}", model),
            Err(e) => warn!("Failed to save settings to {:?}: {}", self.path, e),
        }
    }

    fn read_file(&self) -> Option<String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read settings from {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => Some(settings.last_model),
            Err(e) => {
                warn!("Settings file {:?} is corrupt, using default: {}", self.path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "whisper-stt-prefs-{}-{}.json",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn test_missing_file_yields_default() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        let store = PreferenceStore::new(&path, "base");
        assert_eq!(store.load(), "base");
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let store = PreferenceStore::new(&path, "base");
        store.save("small");
        assert_eq!(store.load(), "small");

        // A fresh store re-reads from disk
        let fresh = PreferenceStore::new(&path, "base");
        assert_eq!(fresh.load(), "small");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_degrades_to_default() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{not json at all").unwrap();

        let store = PreferenceStore::new(&path, "base");
        assert_eq!(store.load(), "base");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_to_unwritable_path_does_not_panic() {
        let store = PreferenceStore::new("/proc/definitely/not/writable.json", "base");
        store.save("medium");
        // Cache still reflects the save even though persistence failed
        assert_eq!(store.load(), "medium");
    }
}
