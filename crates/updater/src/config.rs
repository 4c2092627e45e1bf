use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.github.com/";
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com/";
pub const DEFAULT_MAIN_EXECUTABLE: &str = "main.exe";
pub const DEFAULT_APPLIER_EXECUTABLE: &str = "updater/Updater.exe";
pub const DEFAULT_VERSION_FILE: &str = "APPVERSION";
pub const DEFAULT_EXCLUDE_PREFIX: &str = "torch/";
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Runtime configuration of the in-process updater and the applier.
///
/// Every field has a default so a partial JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Release repository, `owner/name`.
    pub repo: String,
    pub api_base: String,
    pub download_base: String,
    /// Directory the application is installed in.
    pub install_dir: PathBuf,
    /// Session directory packages are downloaded into.
    pub session_dir: PathBuf,
    pub main_executable: String,
    /// Applier executable, relative to `install_dir`.
    pub applier_executable: String,
    pub version_file: String,
    /// Write size while streaming packages to disk.
    pub chunk_size: usize,
    pub check_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            install_dir: PathBuf::from("."),
            session_dir: std::env::temp_dir().join("update_package"),
            main_executable: DEFAULT_MAIN_EXECUTABLE.to_string(),
            applier_executable: DEFAULT_APPLIER_EXECUTABLE.to_string(),
            version_file: DEFAULT_VERSION_FILE.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            check_timeout_secs: 15,
            download_timeout_secs: 30,
        }
    }
}

impl UpdaterConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: UpdaterConfig = serde_json::from_slice(&bytes)?;
        if config.chunk_size == 0 {
            return Err(UpdaterError::validation("chunk_size must be positive"));
        }
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.session_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn applier_path(&self) -> PathBuf {
        self.install_dir.join(&self.applier_executable)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
