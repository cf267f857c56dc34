//! pfxfer Core - Transfer Engine
//!
//! This crate provides bandwidth-limited, resumable file downloads between
//! folder partners. It handles rate limiting per traffic class, chunk
//! ordering, staging files and download health.

pub mod engine;
mod error;
mod folder;
mod partner;
mod storage;
pub mod util;

#[cfg(test)]
mod test_support;

pub use engine::*;
pub use error::*;
pub use folder::*;
pub use partner::*;
pub use storage::*;

use pfxfer_types::TransferSettings;
use std::path::PathBuf;
use std::sync::Arc;

/// The main pfxfer core instance
pub struct TransferCore {
    /// Settings storage
    pub storage: Storage,
    /// Folders known locally
    pub folders: Arc<LocalFolderRepository>,
    /// Transfer manager
    pub manager: Arc<TransferManager>,
}

impl TransferCore {
    /// Create a new TransferCore instance from the settings in `data_dir`
    pub async fn new(data_dir: PathBuf) -> Result<Self, TransferError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;

        let folders = Arc::new(LocalFolderRepository::new());
        let manager = TransferManager::new(settings, folders.clone());

        Ok(Self {
            storage,
            folders,
            manager,
        })
    }

    pub fn settings(&self) -> TransferSettings {
        self.manager.settings()
    }

    /// Persist new settings and apply them to the running manager
    pub async fn update_settings(&self, settings: TransferSettings) -> Result<(), TransferError> {
        self.storage.save_settings(&settings).await?;
        self.manager.set_settings(settings);
        Ok(())
    }
}
