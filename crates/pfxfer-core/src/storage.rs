//! Storage layer for persistent data (settings as JSON in the data directory)

use crate::error::TransferError;
use pfxfer_types::TransferSettings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for pfxfer data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, TransferError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings, falling back to defaults if none were saved yet
    pub async fn load_settings(&self) -> Result<TransferSettings, TransferError> {
        let path = self.settings_path();
        if !path.exists() {
            debug!("No settings at {:?}, using defaults", path);
            return Ok(TransferSettings::default());
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring unreadable settings {:?}: {}", path, e);
                Ok(TransferSettings::default())
            }
        }
    }

    /// Save settings to storage
    pub async fn save_settings(&self, settings: &TransferSettings) -> Result<(), TransferError> {
        let content = serde_json::to_string_pretty(settings)?;
        // Replaced atomically through a rename
        let tmp = self.data_dir.join(format!("{}.tmp", SETTINGS_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.settings_path()).await?;
        Ok(())
    }

    /// Delete saved settings, returning to defaults
    pub async fn reset_settings(&self) -> Result<TransferSettings, TransferError> {
        let path = self.settings_path();
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(TransferSettings::default())
    }
}
