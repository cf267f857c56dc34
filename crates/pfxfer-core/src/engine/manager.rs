//! Transfer Manager - owns all downloads and the bandwidth limiters
//!
//! This is the top-level coordinator that:
//! - Creates downloads and requests them from partners
//! - Routes incoming chunks to their download
//! - Moves completed staging files into place
//! - Removes broken downloads on a periodic health check
//! - Keeps the shared limiters in sync with the settings

use crate::engine::{
    BandwidthLimiter, BandwidthProvider, Download, DownloadHost, Health, SharedLimiters,
};
use crate::engine::download::file_time_of;
use crate::error::TransferError;
use crate::folder::FolderRepository;
use crate::partner::Partner;
use parking_lot::{Mutex, RwLock};
use pfxfer_types::{FileChunk, FileInfo, TrafficClass, TransferEvent, TransferSettings};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Completed and aborted downloads kept for inspection, oldest dropped first
pub const DOWNLOAD_HISTORY_LIMIT: usize = 500;

/// Transfer manager that coordinates all downloads
pub struct TransferManager {
    settings: RwLock<TransferSettings>,
    repository: Arc<dyn FolderRepository>,
    limiters: SharedLimiters,
    provider: BandwidthProvider,
    /// Downloads not yet completed or aborted
    downloads: RwLock<HashMap<FileInfo, Arc<Download>>>,
    completed: RwLock<Vec<Arc<Download>>>,
    aborted: RwLock<Vec<Arc<Download>>>,
    event_tx: broadcast::Sender<TransferEvent>,
    cancel: CancellationToken,
    check_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferManager {
    /// Create a manager. Nothing runs until [`TransferManager::start`].
    pub fn new(settings: TransferSettings, repository: Arc<dyn FolderRepository>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1000);
        let provider = BandwidthProvider::new(Duration::from_millis(
            settings.bandwidth.provider_interval_ms,
        ));
        Arc::new(Self {
            settings: RwLock::new(settings),
            repository,
            limiters: SharedLimiters::new(),
            provider,
            downloads: RwLock::new(HashMap::new()),
            completed: RwLock::new(Vec::new()),
            aborted: RwLock::new(Vec::new()),
            event_tx,
            cancel: CancellationToken::new(),
            check_task: Mutex::new(None),
        })
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Apply the speed limits, start the bandwidth provider and the periodic
    /// health check. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let settings = self.settings();
        self.limiters
            .apply_settings(&settings.bandwidth, &self.provider);
        self.provider.start();

        let mut task = self.check_task.lock();
        if task.is_some() {
            warn!("Transfer manager already running");
            return;
        }

        let period = Duration::from_secs(settings.transfer_check_interval_secs.max(1));
        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        info!("Starting transfer manager (health check every {:?})", period);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.check_active_downloads();
                    }
                }
            }
            debug!("Health check stopped");
        }));
    }

    /// Stop the health check and the provider. Opens all limiters.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.check_task.lock().take() {
            task.abort();
        }
        self.provider.shutdown();
        info!("Transfer manager shut down");
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn settings(&self) -> TransferSettings {
        self.settings.read().clone()
    }

    /// Replace the settings and re-apply the speed limits.
    ///
    /// The provider window is fixed at construction; a changed
    /// `provider_interval_ms` takes effect with the next manager.
    pub fn set_settings(&self, settings: TransferSettings) {
        let previous = std::mem::replace(&mut *self.settings.write(), settings.clone());
        self.limiters
            .apply_settings(&settings.bandwidth, &self.provider);

        for class in TrafficClass::ALL {
            let limit = settings.bandwidth.limit_for(class);
            if limit != previous.bandwidth.limit_for(class) {
                info!("Bandwidth limit for {} set to {} bytes/s", class, limit);
                self.emit(TransferEvent::BandwidthLimitChanged {
                    class,
                    bytes_per_second: limit,
                });
            }
        }
    }

    pub fn limiters(&self) -> &SharedLimiters {
        &self.limiters
    }

    /// Limiter for data sent to a peer
    pub fn output_limiter(&self, on_lan: bool) -> Arc<BandwidthLimiter> {
        self.limiters.output_limiter(on_lan)
    }

    /// Limiter for data received from a peer
    pub fn input_limiter(&self, on_lan: bool) -> Arc<BandwidthLimiter> {
        self.limiters.input_limiter(on_lan)
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Start downloading a file.
    ///
    /// Without a partner the download stays pending until
    /// [`TransferManager::request_download`] is called for it.
    pub fn download_file(
        self: &Arc<Self>,
        file: FileInfo,
        automatic: bool,
        partner: Option<Arc<dyn Partner>>,
    ) -> Result<Arc<Download>, TransferError> {
        if self.is_downloading(&file) {
            return Err(TransferError::AlreadyDownloading(file));
        }
        if automatic && self.repository.is_in_blacklist(&file) {
            return Err(TransferError::InvalidOperation(format!(
                "{} is blacklisted for automatic download",
                file
            )));
        }

        let host: Arc<dyn DownloadHost> = self.clone();
        let timeout = Duration::from_secs(self.settings.read().download_request_timeout_secs);
        // Completes synchronously for zero-length files
        let download = Download::new(&host, Arc::clone(&self.repository), file, automatic, timeout);

        if download.is_completed() {
            self.store_completed(Arc::clone(&download));
            return Ok(download);
        }

        {
            let mut downloads = self.downloads.write();
            if downloads.contains_key(download.file()) {
                return Err(TransferError::AlreadyDownloading(download.file().clone()));
            }
            downloads.insert(download.file().clone(), Arc::clone(&download));
        }

        match partner {
            Some(partner) => self.send_request(&download, partner),
            None => debug!("No partner for {} yet, download pending", download.file()),
        }
        Ok(download)
    }

    /// Request an active download from a (new) partner
    pub fn request_download(
        &self,
        file: &FileInfo,
        partner: Arc<dyn Partner>,
    ) -> Result<(), TransferError> {
        let download = self
            .download(file)
            .ok_or_else(|| TransferError::NotFound(file.clone()))?;
        self.send_request(&download, partner);
        Ok(())
    }

    fn send_request(&self, download: &Download, partner: Arc<dyn Partner>) {
        download.request(partner);
        self.emit(TransferEvent::DownloadRequested {
            file: download.file().clone(),
            start_offset: download.start_offset(),
        });
    }

    /// Route a chunk to its download. Chunks of unknown files are dropped.
    pub fn chunk_received(&self, chunk: FileChunk) {
        match self.download(&chunk.file) {
            Some(download) => download.add_chunk(Some(&chunk)),
            None => debug!("Received chunk for unknown download: {}", chunk),
        }
    }

    /// The partner put a download into its upload queue
    pub fn set_queued(&self, file: &FileInfo) {
        match self.download(file) {
            Some(download) => download.set_queued(),
            None => debug!("Queue acknowledgement for unknown download: {}", file),
        }
    }

    /// Abort every broken download. Returns how many were removed.
    pub fn check_active_downloads(&self) -> usize {
        let mut removed = 0;
        for download in self.active_downloads() {
            let health = download.health();
            if let Health::Healthy = health {
                continue;
            }
            warn!("Download broken ({}): {}", health, download);
            self.emit(TransferEvent::DownloadBroken {
                file: download.file().clone(),
                reason: health.to_string(),
            });
            download.abort();
            removed += 1;
        }
        if removed > 0 {
            debug!("Health check removed {} broken downloads", removed);
        }
        removed
    }

    pub fn download(&self, file: &FileInfo) -> Option<Arc<Download>> {
        self.downloads.read().get(file).cloned()
    }

    pub fn is_downloading(&self, file: &FileInfo) -> bool {
        self.downloads.read().contains_key(file)
    }

    pub fn active_downloads(&self) -> Vec<Arc<Download>> {
        self.downloads.read().values().cloned().collect()
    }

    pub fn completed_downloads(&self) -> Vec<Arc<Download>> {
        self.completed.read().clone()
    }

    pub fn aborted_downloads(&self) -> Vec<Arc<Download>> {
        self.aborted.read().clone()
    }

    /// Forget all completed downloads. Returns how many were dropped.
    pub fn clear_completed_downloads(&self) -> usize {
        let cleared = std::mem::take(&mut *self.completed.write()).len();
        debug!("Cleared {} completed downloads", cleared);
        cleared
    }

    /// Forget all aborted downloads. Returns how many were dropped.
    pub fn clear_aborted_downloads(&self) -> usize {
        let cleared = std::mem::take(&mut *self.aborted.write()).len();
        debug!("Cleared {} aborted downloads", cleared);
        cleared
    }

    /// Move the staging file of a finished download to its target and
    /// record the outcome.
    fn store_completed(&self, download: Arc<Download>) {
        match self.move_into_place(&download) {
            Ok(target) => {
                info!("Stored {} at {:?}", download.file(), target);
                push_bounded(&mut self.completed.write(), Arc::clone(&download));
                self.emit(TransferEvent::DownloadCompleted {
                    file: download.file().clone(),
                });
            }
            Err(e) => {
                error!("Unable to store {}: {}", download.file(), e);
                self.emit(TransferEvent::DownloadBroken {
                    file: download.file().clone(),
                    reason: format!("unable to store file: {}", e),
                });
                push_bounded(&mut self.aborted.write(), Arc::clone(&download));
                self.emit(TransferEvent::DownloadAborted {
                    file: download.file().clone(),
                });
            }
        }
    }

    fn move_into_place(&self, download: &Download) -> Result<PathBuf, TransferError> {
        if let Some(e) = download.temp_file_error() {
            return Err(TransferError::InvalidOperation(e.to_string()));
        }
        let target = self
            .repository
            .disk_file(download.file())
            .ok_or_else(|| TransferError::NotFound(download.file().clone()))?;
        let temp_file = download
            .temp_file()
            .ok_or_else(|| TransferError::NotFound(download.file().clone()))?;

        fs::rename(&temp_file, &target)?;
        filetime::set_file_mtime(&target, file_time_of(download.file()))?;
        Ok(target)
    }
}

fn push_bounded(history: &mut Vec<Arc<Download>>, download: Arc<Download>) {
    history.push(download);
    if history.len() > DOWNLOAD_HISTORY_LIMIT {
        let excess = history.len() - DOWNLOAD_HISTORY_LIMIT;
        history.drain(..excess);
    }
}

impl DownloadHost for TransferManager {
    fn set_started(&self, download: &Download) {
        info!("Download started: {}", download);
        self.emit(TransferEvent::DownloadStarted {
            file: download.file().clone(),
        });
    }

    fn set_completed(&self, download: &Download) {
        let removed = self.downloads.write().remove(download.file());
        match removed {
            Some(download) => self.store_completed(download),
            // Zero-length files complete before they are registered, see
            // download_file
            None => debug!("Completed download not active: {}", download.file()),
        }
    }

    fn abort_download(&self, download: &Download) {
        let removed = self.downloads.write().remove(download.file());
        if let Some(download) = removed {
            info!("Download aborted: {}", download);
            push_bounded(&mut self.aborted.write(), Arc::clone(&download));
            self.emit(TransferEvent::DownloadAborted {
                file: download.file().clone(),
            });
        }
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
