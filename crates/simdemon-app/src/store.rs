//! Workspace-scoped key/value state in `.simdemon/state.json`
//!
//! Holds the cached build records and small preferences. Values are kept in
//! memory and written through on every change.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use simdemon_core::prelude::*;

use crate::config::simdemon_dir;

const STATE_FILENAME: &str = "state.json";

pub const LAST_SELECTED_DEVICE_KEY: &str = "last_selected_device";
pub const DEVICE_SETTINGS_KEY: &str = "device_settings_v2";
pub const PREVIEW_ZOOM_KEY: &str = "preview_zoom";

/// JSON document of workspace state
#[derive(Debug)]
pub struct WorkspaceStore {
    /// `None` keeps state in memory only
    path: Option<PathBuf>,
    values: Mutex<BTreeMap<String, Value>>,
}

impl WorkspaceStore {
    /// Open the store of a workspace. An unreadable file starts empty.
    pub fn open(workspace_root: &Path) -> Self {
        let path = simdemon_dir(workspace_root).join(STATE_FILENAME);
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt workspace state {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read workspace state {:?}: {}", path, e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            values: Mutex::new(values),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read a value. Values that no longer deserialize are treated as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable state for '{}': {}", key, e);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut values = self.lock();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.lock();
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&values)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::config(format!("Failed to create .simdemon dir: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(values)?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::config(format!("Failed to open state.json: {}", e)))?;

        // Released when the file is dropped
        file.lock_exclusive()
            .map_err(|e| Error::config(format!("Failed to lock state.json: {}", e)))?;

        file.write_all(content.as_bytes())
            .map_err(|e| Error::config(format!("Failed to write state.json: {}", e)))?;
        file.flush()
            .map_err(|e| Error::config(format!("Failed to flush state.json: {}", e)))?;

        trace!("Saved workspace state to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdemon_core::{DeviceSettings, ZoomLevel};
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let temp = tempdir().unwrap();

        let store = WorkspaceStore::open(temp.path());
        store.set(LAST_SELECTED_DEVICE_KEY, &"AAA").unwrap();
        store.set(PREVIEW_ZOOM_KEY, &ZoomLevel::Scale(0.5)).unwrap();

        let reopened = WorkspaceStore::open(temp.path());
        assert_eq!(
            reopened.get::<String>(LAST_SELECTED_DEVICE_KEY).as_deref(),
            Some("AAA")
        );
        assert_eq!(reopened.get(PREVIEW_ZOOM_KEY), Some(ZoomLevel::Scale(0.5)));
    }

    #[test]
    fn test_remove() {
        let temp = tempdir().unwrap();
        let store = WorkspaceStore::open(temp.path());
        store.set("key", &1).unwrap();
        store.remove("key").unwrap();
        store.remove("key").unwrap();

        assert_eq!(store.get::<i32>("key"), None);
        assert_eq!(WorkspaceStore::open(temp.path()).get::<i32>("key"), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join(".simdemon");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("state.json"), "{ not json").unwrap();

        let store = WorkspaceStore::open(temp.path());
        assert_eq!(store.get::<String>(LAST_SELECTED_DEVICE_KEY), None);
        store.set(LAST_SELECTED_DEVICE_KEY, &"BBB").unwrap();
    }

    #[test]
    fn test_mismatched_type_reads_as_absent() {
        let store = WorkspaceStore::in_memory();
        store.set(DEVICE_SETTINGS_KEY, &"not settings").unwrap();
        assert_eq!(store.get::<DeviceSettings>(DEVICE_SETTINGS_KEY), None);
    }
}
