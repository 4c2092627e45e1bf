//! Small persisted key-value store shared between update attempts.

use crate::error::Result;
use crate::manifest::MASTER_MANIFEST_FILE;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key recording a fully downloaded session directory.
pub const DOWNLOADED_UPDATE_DIR: &str = "downloaded_update_dir";

/// String key-value storage that survives between update attempts.
pub trait SettingsStore: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Forget `key`; removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| crate::UpdaterError::validation("settings lock poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| crate::UpdaterError::validation("settings lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Store persisted as a flat JSON object; rewritten on every change.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileSettings {
    /// Open the store, starting empty when the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(values)?)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| crate::UpdaterError::validation("settings lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| crate::UpdaterError::validation("settings lock poisoned"))?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Lifecycle of the "a download is ready to install" record.
pub struct DownloadSessionRecord<'a> {
    store: &'a dyn SettingsStore,
}

impl<'a> DownloadSessionRecord<'a> {
    pub fn new(store: &'a dyn SettingsStore) -> Self {
        Self { store }
    }

    /// Remember a completed session directory.
    pub fn init(&self, session_dir: &Path) -> Result<()> {
        self.store
            .set(DOWNLOADED_UPDATE_DIR, &session_dir.to_string_lossy())
    }

    /// Forget the session, once it has been handed to the applier.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(DOWNLOADED_UPDATE_DIR)
    }

    /// Recorded session directory, if it still holds a master manifest.
    pub fn existing_download(&self) -> Option<PathBuf> {
        let dir = PathBuf::from(self.store.get(DOWNLOADED_UPDATE_DIR)?);
        dir.join(MASTER_MANIFEST_FILE).is_file().then_some(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let store = JsonFileSettings::open(&path);
            store.set("a", "1").unwrap();
            store.set("b", "2").unwrap();
            store.remove("a").unwrap();
        }
        let store = JsonFileSettings::open(&path);
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn session_record_requires_manifest_on_disk() {
        let dir = tempdir().unwrap();
        let session = dir.path().join("update_package");
        fs::create_dir_all(&session).unwrap();

        let store = MemorySettings::default();
        let record = DownloadSessionRecord::new(&store);
        record.init(&session).unwrap();
        assert_eq!(record.existing_download(), None);

        fs::write(session.join(MASTER_MANIFEST_FILE), b"{}").unwrap();
        assert_eq!(record.existing_download(), Some(session.clone()));

        record.clear().unwrap();
        assert_eq!(record.existing_download(), None);
    }

    #[test]
    fn poisoned_memory_store_reports_write_failures() {
        let store = std::sync::Arc::new(MemorySettings::default());
        let holder = std::sync::Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = holder.values.lock().unwrap();
            panic!("panicking while holding the settings lock");
        })
        .join();

        assert!(store.set("k", "v").is_err());
        assert!(store.remove("k").is_err());
        assert_eq!(store.get("k"), None);
    }
}
