//! Download - receives the chunks of one file from one partner
//!
//! A download owns the staging file `(incomplete) <name>` next to the target.
//! Chunks must arrive strictly in order; each one is appended to the staging
//! file, whose modification date is kept equal to the remote file's so an
//! interrupted download can be resumed after a restart. Completion and abort
//! are reported to the owning [`DownloadHost`], which moves the staging file
//! into place or discards the download.

use crate::engine::transfer_counter::TransferCounter;
use crate::folder::{placeholder_file_for, temp_file_for, FolderRepository};
use crate::partner::Partner;
use crate::util::{same_file_date, system_time_millis};
use filetime::FileTime;
use parking_lot::Mutex;
use pfxfer_types::{FileChunk, FileInfo, RequestDownload};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Time without any activity after which an unqueued download is broken
pub const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Owner of downloads, notified about their lifecycle.
///
/// Callbacks are made without any lock of the download held, so the host may
/// call back into the download, including [`Download::add_chunk`].
pub trait DownloadHost: Send + Sync {
    /// First chunk arrived
    fn set_started(&self, download: &Download);

    /// Last byte written, the staging file is complete
    fn set_completed(&self, download: &Download);

    /// The download gave up and should be dropped
    fn abort_download(&self, download: &Download);
}

/// Why the staging file could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempFileError {
    /// The folder of the file is not known locally
    Unresolvable,
    DeleteFailed,
    CreateFailed,
    NotWritable,
    WriteFailed,
}

impl fmt::Display for TempFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TempFileError::Unresolvable => "staging file location unknown",
            TempFileError::DeleteFailed => "unable to delete staging file",
            TempFileError::CreateFailed => "unable to create staging file",
            TempFileError::NotWritable => "staging file not writable",
            TempFileError::WriteFailed => "unable to write staging file",
        };
        f.write_str(text)
    }
}

/// Health of a download. Everything but `Healthy` means broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    NoPartner,
    Disconnected,
    PartnerLeftFolder,
    TimedOut,
    NotQueuedAtPartner,
    TempFile(TempFileError),
    Blacklisted,
}

impl Health {
    pub fn is_broken(&self) -> bool {
        *self != Health::Healthy
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => f.write_str("healthy"),
            Health::NoPartner => f.write_str("no partner"),
            Health::Disconnected => f.write_str("partner not connected"),
            Health::PartnerLeftFolder => f.write_str("partner left the folder"),
            Health::TimedOut => f.write_str("request timed out"),
            Health::NotQueuedAtPartner => f.write_str("no longer queued at partner"),
            Health::TempFile(e) => write!(f, "{}", e),
            Health::Blacklisted => f.write_str("file is blacklisted"),
        }
    }
}

/// Reason a chunk was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRejection {
    IllegalOffset { offset: i64, size: u64 },
    MissingData,
    ExceedsFileSize { end: u64, size: u64 },
    OffsetMismatch { offset: u64, staged: u64 },
}

impl fmt::Display for ChunkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkRejection::IllegalOffset { offset, size } => {
                write!(f, "illegal offset {} for file of {} bytes", offset, size)
            }
            ChunkRejection::MissingData => f.write_str("chunk carries no data"),
            ChunkRejection::ExceedsFileSize { end, size } => {
                write!(f, "chunk ends at {} beyond file size {}", end, size)
            }
            ChunkRejection::OffsetMismatch { offset, staged } => write!(
                f,
                "offset {} does not continue staging file of {} bytes",
                offset, staged
            ),
        }
    }
}

/// Check a chunk against the file size and the bytes already staged.
/// Returns the payload to append.
pub fn validate_chunk(chunk: &FileChunk, size: u64, staged: u64) -> Result<&[u8], ChunkRejection> {
    let offset = u64::try_from(chunk.offset)
        .ok()
        .filter(|&offset| offset <= size)
        .ok_or(ChunkRejection::IllegalOffset {
            offset: chunk.offset,
            size,
        })?;
    let data = chunk.data.as_deref().ok_or(ChunkRejection::MissingData)?;
    let end = offset.saturating_add(data.len() as u64);
    if end > size {
        return Err(ChunkRejection::ExceedsFileSize { end, size });
    }
    if offset != staged {
        return Err(ChunkRejection::OffsetMismatch { offset, staged });
    }
    Ok(data)
}

/// What processing a chunk led to
enum ChunkOutcome {
    Appended,
    Completed,
    /// Ignored, or failed on the staging file
    Dropped,
    /// Protocol violation, the download is aborted
    Rejected,
}

struct DownloadState {
    partner: Option<Arc<dyn Partner>>,
    last_touch: Instant,
    queued: bool,
    started: bool,
    completed: bool,
    temp_file_error: Option<TempFileError>,
}

/// One file being fetched from one partner
pub struct Download {
    file: FileInfo,
    automatic: bool,
    request_timeout: Duration,
    start_offset: u64,
    counter: TransferCounter,
    host: Weak<dyn DownloadHost>,
    repository: Arc<dyn FolderRepository>,
    state: Mutex<DownloadState>,
    /// Serializes chunk processing
    chunk_lock: Mutex<()>,
}

impl Download {
    /// Create a download and inspect an existing staging file.
    ///
    /// A staging file shorter than the remote file and carrying its
    /// modification date is resumed, any other one is deleted. Zero-length
    /// files complete right away.
    pub fn new(
        host: &Arc<dyn DownloadHost>,
        repository: Arc<dyn FolderRepository>,
        file: FileInfo,
        automatic: bool,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let start_offset = repository
            .disk_file(&file)
            .and_then(|disk_file| temp_file_for(&disk_file))
            .map(|temp_file| resume_offset(&file, &temp_file))
            .unwrap_or(0);

        let download = Arc::new(Self {
            counter: TransferCounter::new(start_offset, file.size),
            file,
            automatic,
            request_timeout,
            start_offset,
            host: Arc::downgrade(host),
            repository,
            state: Mutex::new(DownloadState {
                partner: None,
                last_touch: Instant::now(),
                queued: false,
                started: false,
                completed: false,
                temp_file_error: None,
            }),
            chunk_lock: Mutex::new(()),
        });

        if download.file.size == 0 {
            download.complete_empty_file();
        }
        download
    }

    /// Ask `partner` for the file, starting at the resume offset
    pub fn request(&self, partner: Arc<dyn Partner>) {
        info!(
            "Requesting {} from '{}' at offset {}",
            self.file.to_detail_string(),
            partner.nick(),
            self.start_offset
        );
        {
            let mut state = self.state.lock();
            state.partner = Some(Arc::clone(&partner));
            state.last_touch = Instant::now();
        }
        partner.send_request_async(RequestDownload {
            file: self.file.clone(),
            start_offset: self.start_offset,
        });
    }

    /// Process a chunk received from the partner. `None` is ignored.
    ///
    /// Chunks are processed one at a time. The host is notified after the
    /// chunk is fully processed.
    pub fn add_chunk(&self, chunk: Option<&FileChunk>) {
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => return,
        };

        let (first_chunk, outcome) = {
            let _serial = self.chunk_lock.lock();
            let first_chunk = {
                let mut state = self.state.lock();
                state.last_touch = Instant::now();
                !std::mem::replace(&mut state.started, true)
            };
            if first_chunk {
                self.remove_placeholder();
            }
            (first_chunk, self.write_chunk(chunk))
        };

        if first_chunk {
            if let Some(host) = self.host.upgrade() {
                host.set_started(self);
            }
        }
        match outcome {
            ChunkOutcome::Completed => self.finish(),
            ChunkOutcome::Rejected => self.abort(),
            ChunkOutcome::Appended | ChunkOutcome::Dropped => {}
        }
    }

    /// Append one chunk to the staging file. Caller holds `chunk_lock`.
    fn write_chunk(&self, chunk: &FileChunk) -> ChunkOutcome {
        if self.is_completed() {
            debug!("Ignoring chunk for completed download: {}", chunk);
            return ChunkOutcome::Dropped;
        }
        // Only the partner state counts here, timeouts and staging file
        // problems are left to the health check
        if self.base_health().is_broken() {
            trace!("Download broken, dropping {}", chunk);
            return ChunkOutcome::Dropped;
        }

        let temp_file = match self.temp_file() {
            Some(temp_file) => temp_file,
            None => {
                self.fail_temp_file(TempFileError::Unresolvable, "no local folder");
                return ChunkOutcome::Dropped;
            }
        };

        if let Some(parent) = temp_file.parent() {
            if !parent.exists() {
                match fs::create_dir_all(parent) {
                    Ok(()) => debug!("Subdirectory created: {:?}", parent),
                    Err(e) => warn!("Failed to create subdirectory {:?}: {}", parent, e),
                }
            }
        }

        if chunk.offset == 0 && temp_file.exists() {
            if let Err(e) = fs::remove_file(&temp_file) {
                self.fail_temp_file(TempFileError::DeleteFailed, &e.to_string());
                return ChunkOutcome::Dropped;
            }
        }
        if !temp_file.exists() {
            if let Err(e) = OpenOptions::new().write(true).create(true).open(&temp_file) {
                self.fail_temp_file(TempFileError::CreateFailed, &e.to_string());
                return ChunkOutcome::Dropped;
            }
        }

        let metadata = match fs::metadata(&temp_file) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail_temp_file(TempFileError::CreateFailed, &e.to_string());
                return ChunkOutcome::Dropped;
            }
        };
        if metadata.permissions().readonly() {
            self.fail_temp_file(TempFileError::NotWritable, "read-only");
            return ChunkOutcome::Dropped;
        }

        let data = match validate_chunk(chunk, self.file.size, metadata.len()) {
            Ok(data) => data,
            Err(rejection) => {
                error!("Received illegal chunk. {}. Reason: {}", chunk, rejection);
                return ChunkOutcome::Rejected;
            }
        };

        self.counter.chunk_transferred(data.len() as u64);
        if let Err(e) = self.append_to_temp_file(&temp_file, data) {
            self.fail_temp_file(TempFileError::WriteFailed, &e.to_string());
            return ChunkOutcome::Dropped;
        }
        trace!("Wrote {} bytes to {:?}", data.len(), temp_file);

        let end = chunk.offset as u64 + data.len() as u64;
        let mut state = self.state.lock();
        state.completed = end == self.file.size;
        if state.completed {
            ChunkOutcome::Completed
        } else {
            ChunkOutcome::Appended
        }
    }

    /// Report completion to the host
    pub fn finish(&self) {
        info!("Download completed: {}", self.file.to_detail_string());
        match self.host.upgrade() {
            Some(host) => host.set_completed(self),
            None => warn!("Download host gone, completion of {} not reported", self.file),
        }
    }

    /// Ask the host to drop this download. The staging file is kept.
    pub fn abort(&self) {
        debug!("Aborting download: {}", self.file);
        if let Some(host) = self.host.upgrade() {
            host.abort_download(self);
        }
    }

    /// Abort and delete the staging file
    pub fn abort_and_cleanup(&self) {
        self.abort();
        if let Some(temp_file) = self.temp_file() {
            match fs::remove_file(&temp_file) {
                Ok(()) => debug!("Removed staging file {:?}", temp_file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!("Unable to remove staging file {:?}: {}", temp_file, e),
            }
        }
    }

    /// Full health check including timeout, partner queue state, staging
    /// file problems and the blacklist.
    pub fn health(&self) -> Health {
        let base = self.base_health();
        if base.is_broken() {
            return base;
        }

        let (last_touch, queued, temp_file_error) = {
            let state = self.state.lock();
            (state.last_touch, state.queued, state.temp_file_error)
        };
        let timed_out = last_touch.elapsed() > self.request_timeout && !queued;
        // The partner is only consulted when the timeout has not fired or the
        // staging file failed
        let queued_at_partner = if !timed_out || temp_file_error.is_some() {
            self.still_queued_at_partner()
        } else {
            true
        };

        if timed_out {
            Health::TimedOut
        } else if !queued_at_partner {
            Health::NotQueuedAtPartner
        } else if let Some(e) = temp_file_error {
            Health::TempFile(e)
        } else if self.automatic && self.repository.is_in_blacklist(&self.file) {
            Health::Blacklisted
        } else {
            Health::Healthy
        }
    }

    pub fn is_broken(&self) -> bool {
        self.health().is_broken()
    }

    /// Waiting for a partner: no partner assigned or the download is broken
    pub fn is_pending(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        self.partner().is_none() || self.is_broken()
    }

    /// The partner accepted the request into its upload queue
    pub fn set_queued(&self) {
        debug!("Download queued at partner: {}", self.file);
        self.state.lock().queued = true;
    }

    pub fn is_queued(&self) -> bool {
        let queued = self.state.lock().queued;
        queued && !self.is_broken()
    }

    pub fn is_started(&self) -> bool {
        let started = self.state.lock().started;
        started && !self.is_pending()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn is_requested_automatic(&self) -> bool {
        self.automatic
    }

    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    /// Byte offset the partner was asked to start from
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn partner(&self) -> Option<Arc<dyn Partner>> {
        self.state.lock().partner.clone()
    }

    pub fn counter(&self) -> &TransferCounter {
        &self.counter
    }

    pub fn temp_file_error(&self) -> Option<TempFileError> {
        self.state.lock().temp_file_error
    }

    /// Time since the last request or chunk
    pub fn idle_time(&self) -> Duration {
        self.state.lock().last_touch.elapsed()
    }

    /// Location of the staging file, `None` if the folder is unknown
    pub fn temp_file(&self) -> Option<PathBuf> {
        self.repository
            .disk_file(&self.file)
            .and_then(|disk_file| temp_file_for(&disk_file))
    }

    fn base_health(&self) -> Health {
        let partner = {
            let state = self.state.lock();
            if state.completed {
                return Health::Healthy;
            }
            match &state.partner {
                Some(partner) => Arc::clone(partner),
                None => return Health::NoPartner,
            }
        };
        if !partner.is_completely_connected() {
            Health::Disconnected
        } else if !partner.has_folder(&self.file.folder) {
            Health::PartnerLeftFolder
        } else {
            Health::Healthy
        }
    }

    fn still_queued_at_partner(&self) -> bool {
        self.partner()
            .map(|partner| partner.is_connected())
            .unwrap_or(false)
    }

    fn remove_placeholder(&self) {
        if let Some(placeholder) = self
            .repository
            .disk_file(&self.file)
            .and_then(|disk_file| placeholder_file_for(&disk_file))
        {
            if placeholder.exists() {
                if let Err(e) = fs::remove_file(&placeholder) {
                    warn!("Unable to remove placeholder {:?}: {}", placeholder, e);
                }
            }
        }
    }

    fn fail_temp_file(&self, kind: TempFileError, detail: &str) {
        error!("{} for {}: {}", kind, self.file, detail);
        self.state.lock().temp_file_error = Some(kind);
    }

    fn append_to_temp_file(&self, temp_file: &Path, data: &[u8]) -> io::Result<()> {
        {
            let mut out = OpenOptions::new().append(true).open(temp_file)?;
            out.write_all(data)?;
        }
        filetime::set_file_mtime(temp_file, file_time_of(&self.file))
    }

    fn complete_empty_file(&self) {
        debug!("Completing zero length file: {}", self.file);
        self.state.lock().completed = true;

        match self.temp_file() {
            Some(temp_file) => {
                if let Some(parent) = temp_file.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&temp_file)
                {
                    self.fail_temp_file(TempFileError::CreateFailed, &e.to_string());
                }
            }
            None => self.fail_temp_file(TempFileError::Unresolvable, "no local folder"),
        }
        self.finish();
    }
}

/// Offset to resume from. Deletes a staging file that cannot be resumed.
fn resume_offset(file: &FileInfo, temp_file: &Path) -> u64 {
    let metadata = match fs::metadata(temp_file) {
        Ok(metadata) => metadata,
        Err(_) => return 0,
    };
    let staged = metadata.len();
    let date_matches = metadata
        .modified()
        .map(|modified| same_file_date(file.modified_millis(), system_time_millis(modified)))
        .unwrap_or(false);

    if file.size > staged && date_matches {
        debug!("Resuming {} at {} bytes", file, staged);
        return staged;
    }
    if !date_matches {
        debug!("Modified date of {:?} does not match {}", temp_file, file);
    }
    match fs::remove_file(temp_file) {
        Ok(()) => debug!("Discarded staging file {:?}", temp_file),
        Err(e) => warn!("Unable to discard staging file {:?}: {}", temp_file, e),
    }
    0
}

pub(crate) fn file_time_of(file: &FileInfo) -> FileTime {
    FileTime::from_unix_time(
        file.modified_date.timestamp(),
        file.modified_date.timestamp_subsec_nanos(),
    )
}

impl PartialEq for Download {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file
    }
}

impl Eq for Download {}

impl Hash for Download {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file.hash(state);
    }
}

impl fmt::Display for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partner() {
            Some(partner) => write!(
                f,
                "{} from '{}'{}",
                self.file.to_detail_string(),
                partner.nick(),
                if partner.is_on_lan() { " (local-net)" } else { "" }
            ),
            None => write!(f, "{} (pending)", self.file.to_detail_string()),
        }
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("file", &self.file)
            .field("start_offset", &self.start_offset)
            .field("automatic", &self.automatic)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::LocalFolderRepository;
    use crate::test_support::{aligned_date, MockPartner, RecordingHost, TestDir};
    use chrono::Duration as ChronoDuration;
    use pfxfer_types::FolderInfo;
    use std::sync::atomic::Ordering;

    struct Fixture {
        dir: TestDir,
        host: Arc<RecordingHost>,
        repo: Arc<LocalFolderRepository>,
        folder: FolderInfo,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TestDir::new();
            let repo = Arc::new(LocalFolderRepository::new());
            let folder = FolderInfo::new("shared");
            repo.add_folder(folder.clone(), dir.path());
            Self {
                dir,
                host: Arc::new(RecordingHost::default()),
                repo,
                folder,
            }
        }

        fn file(&self, size: u64) -> FileInfo {
            FileInfo::new(self.folder.clone(), "docs/report.bin", size, aligned_date())
        }

        fn download(&self, file: FileInfo, automatic: bool, timeout: Duration) -> Arc<Download> {
            let host: Arc<dyn DownloadHost> = self.host.clone();
            Download::new(&host, self.repo.clone(), file, automatic, timeout)
        }

        fn temp_path(&self) -> PathBuf {
            self.dir.path().join("docs").join("(incomplete) report.bin")
        }

        fn stage(&self, bytes: &[u8], mtime: FileTime) {
            let path = self.temp_path();
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, bytes).unwrap();
            filetime::set_file_mtime(&path, mtime).unwrap();
        }
    }

    fn chunk(file: &FileInfo, offset: i64, len: usize, fill: u8) -> FileChunk {
        FileChunk::new(file.clone(), offset, vec![fill; len])
    }

    fn connected_partner() -> Arc<MockPartner> {
        Arc::new(MockPartner::new())
    }

    #[test]
    fn test_validate_chunk() {
        let folder = FolderInfo::new("f");
        let file = FileInfo::new(folder, "a", 100, aligned_date());

        assert_eq!(validate_chunk(&chunk(&file, 0, 10, 1), 100, 0).unwrap().len(), 10);
        assert_eq!(
            validate_chunk(&chunk(&file, -1, 10, 1), 100, 0),
            Err(ChunkRejection::IllegalOffset { offset: -1, size: 100 })
        );
        assert_eq!(
            validate_chunk(&chunk(&file, 101, 0, 1), 100, 101),
            Err(ChunkRejection::IllegalOffset { offset: 101, size: 100 })
        );
        let empty = FileChunk {
            file: file.clone(),
            offset: 0,
            data: None,
        };
        assert_eq!(validate_chunk(&empty, 100, 0), Err(ChunkRejection::MissingData));
        assert_eq!(
            validate_chunk(&chunk(&file, 90, 20, 1), 100, 90),
            Err(ChunkRejection::ExceedsFileSize { end: 110, size: 100 })
        );
        assert_eq!(
            validate_chunk(&chunk(&file, 50, 10, 1), 100, 40),
            Err(ChunkRejection::OffsetMismatch { offset: 50, staged: 40 })
        );
    }

    #[test]
    fn test_two_chunks_complete_the_download() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        let partner = connected_partner();
        download.request(partner.clone());

        assert_eq!(
            partner.requests(),
            vec![RequestDownload {
                file: file.clone(),
                start_offset: 0
            }]
        );

        download.add_chunk(Some(&chunk(&file, 0, 500, 1)));
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 500);
        assert!(!download.is_completed());
        assert!(download.is_started());
        assert_eq!(fx.host.started(), 1);

        download.add_chunk(Some(&chunk(&file, 500, 500, 2)));
        assert!(download.is_completed());
        assert_eq!(fx.host.completed(), 1);
        assert_eq!(download.counter().bytes_done(), 1000);

        let content = fs::read(fx.temp_path()).unwrap();
        assert_eq!(content.len(), 1000);
        assert!(content[..500].iter().all(|&b| b == 1));
        assert!(content[500..].iter().all(|&b| b == 2));

        let mtime = FileTime::from_last_modification_time(&fs::metadata(fx.temp_path()).unwrap());
        assert_eq!(mtime.unix_seconds(), aligned_date().timestamp());

        // Further chunks change nothing and never finish twice
        download.add_chunk(Some(&chunk(&file, 1000, 0, 3)));
        download.add_chunk(None);
        assert_eq!(fx.host.completed(), 1);
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 1000);
        assert_eq!(fx.host.started(), 1);
    }

    #[test]
    fn test_out_of_order_chunk_aborts() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());

        download.add_chunk(Some(&chunk(&file, 100, 50, 1)));

        assert_eq!(fx.host.aborted(), 1);
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 0);
        assert!(!download.is_completed());
    }

    #[test]
    fn test_oversized_and_empty_chunks_abort() {
        let fx = Fixture::new();
        let file = fx.file(100);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());

        download.add_chunk(Some(&chunk(&file, 0, 150, 1)));
        download.add_chunk(Some(&FileChunk {
            file: file.clone(),
            offset: 0,
            data: None,
        }));
        download.add_chunk(Some(&chunk(&file, -5, 10, 1)));

        assert_eq!(fx.host.aborted(), 3);
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 0);
    }

    #[test]
    fn test_resume_from_matching_staging_file() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        // Same 2s window as the remote date
        fx.stage(&[7u8; 400], FileTime::from_unix_time(aligned_date().timestamp(), 700_000_000));

        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        assert_eq!(download.start_offset(), 400);
        assert!(fx.temp_path().exists());

        let partner = connected_partner();
        download.request(partner.clone());
        assert_eq!(partner.requests()[0].start_offset, 400);

        download.add_chunk(Some(&chunk(&file, 400, 600, 8)));
        assert!(download.is_completed());
        let content = fs::read(fx.temp_path()).unwrap();
        assert!(content[..400].iter().all(|&b| b == 7));
        assert!(content[400..].iter().all(|&b| b == 8));
    }

    #[test]
    fn test_mismatched_staging_file_is_discarded() {
        let fx = Fixture::new();
        let later = aligned_date() + ChronoDuration::seconds(10);
        fx.stage(&[7u8; 400], FileTime::from_unix_time(later.timestamp(), 0));

        let download = fx.download(fx.file(1000), false, DOWNLOAD_REQUEST_TIMEOUT);
        assert_eq!(download.start_offset(), 0);
        assert!(!fx.temp_path().exists());
    }

    #[test]
    fn test_staging_file_not_shorter_is_discarded() {
        let fx = Fixture::new();
        fx.stage(&[7u8; 100], FileTime::from_unix_time(aligned_date().timestamp(), 0));

        let download = fx.download(fx.file(100), false, DOWNLOAD_REQUEST_TIMEOUT);
        assert_eq!(download.start_offset(), 0);
        assert!(!fx.temp_path().exists());
    }

    #[test]
    fn test_chunk_at_zero_restarts_staging_file() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        fx.stage(&[7u8; 300], FileTime::from_unix_time(aligned_date().timestamp(), 0));
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        assert_eq!(download.start_offset(), 300);
        download.request(connected_partner());

        download.add_chunk(Some(&chunk(&file, 0, 200, 9)));

        let content = fs::read(fx.temp_path()).unwrap();
        assert_eq!(content, vec![9u8; 200]);
        assert_eq!(fx.host.aborted(), 0);
    }

    #[test]
    fn test_zero_length_file_completes_immediately() {
        let fx = Fixture::new();
        let file = fx.file(0);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);

        assert!(download.is_completed());
        assert!(!download.is_pending());
        assert_eq!(fx.host.completed(), 1);
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 0);

        download.add_chunk(Some(&chunk(&file, 0, 0, 0)));
        assert_eq!(fx.host.completed(), 1);
    }

    #[test]
    fn test_partner_state_drives_health() {
        let fx = Fixture::new();
        let file = fx.file(100);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        let partner = connected_partner();
        download.request(partner.clone());
        assert_eq!(download.health(), Health::Healthy);
        assert!(!download.is_pending());
        assert!(download.to_string().contains("from 'mock' (local-net)"));

        partner.on_folder.store(false, Ordering::SeqCst);
        assert_eq!(download.health(), Health::PartnerLeftFolder);

        partner.completely_connected.store(false, Ordering::SeqCst);
        assert_eq!(download.health(), Health::Disconnected);
        assert!(download.is_pending());

        // Chunks from a partner that is gone are dropped without touching disk
        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));
        assert!(!fx.temp_path().exists());
        assert_eq!(fx.host.aborted(), 0);
    }

    #[test]
    fn test_timeout_unless_queued() {
        let fx = Fixture::new();
        let download = fx.download(fx.file(100), false, Duration::ZERO);
        let partner = connected_partner();
        download.request(partner.clone());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(download.health(), Health::TimedOut);
        assert!(!download.is_queued());

        download.set_queued();
        assert_eq!(download.health(), Health::Healthy);
        assert!(download.is_queued());
    }

    #[test]
    fn test_dropped_from_partner_queue() {
        let fx = Fixture::new();
        let download = fx.download(fx.file(100), false, DOWNLOAD_REQUEST_TIMEOUT);
        let partner = connected_partner();
        download.request(partner.clone());

        partner.connected.store(false, Ordering::SeqCst);
        assert_eq!(download.health(), Health::NotQueuedAtPartner);
    }

    #[test]
    fn test_blacklist_breaks_automatic_downloads_only() {
        let fx = Fixture::new();
        let file = fx.file(100);
        fx.repo.add_to_blacklist(&file);

        let automatic = fx.download(file.clone(), true, DOWNLOAD_REQUEST_TIMEOUT);
        automatic.request(connected_partner());
        assert_eq!(automatic.health(), Health::Blacklisted);

        let manual = fx.download(file, false, DOWNLOAD_REQUEST_TIMEOUT);
        manual.request(connected_partner());
        assert_eq!(manual.health(), Health::Healthy);
    }

    #[test]
    fn test_unknown_folder_is_temp_file_error() {
        let fx = Fixture::new();
        let file = FileInfo::new(FolderInfo::new("elsewhere"), "x.bin", 10, aligned_date());
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());

        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));

        assert_eq!(download.temp_file_error(), Some(TempFileError::Unresolvable));
        assert_eq!(
            download.health(),
            Health::TempFile(TempFileError::Unresolvable)
        );
        assert!(download.is_broken());
    }

    #[test]
    fn test_read_only_staging_file() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        fx.stage(&[1u8; 100], FileTime::from_unix_time(aligned_date().timestamp(), 0));
        let mut permissions = fs::metadata(fx.temp_path()).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(fx.temp_path(), permissions).unwrap();

        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        download.add_chunk(Some(&chunk(&file, 100, 10, 1)));

        assert_eq!(download.temp_file_error(), Some(TempFileError::NotWritable));
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 100);

        // Once writable again the next chunk goes through
        let mut permissions = fs::metadata(fx.temp_path()).unwrap().permissions();
        permissions.set_readonly(false);
        fs::set_permissions(fx.temp_path(), permissions).unwrap();
        download.add_chunk(Some(&chunk(&file, 100, 10, 1)));
        assert_eq!(fs::metadata(fx.temp_path()).unwrap().len(), 110);
    }

    #[test]
    fn test_first_chunk_removes_placeholder() {
        let fx = Fixture::new();
        let file = fx.file(10);
        let placeholder = fx.dir.path().join("docs").join("(placeholder) report.bin");
        fs::create_dir_all(placeholder.parent().unwrap()).unwrap();
        fs::write(&placeholder, b"").unwrap();

        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        download.add_chunk(Some(&chunk(&file, 0, 5, 1)));

        assert!(!placeholder.exists());
    }

    #[test]
    fn test_abort_and_cleanup_removes_staging_file() {
        let fx = Fixture::new();
        let file = fx.file(100);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));
        assert!(fx.temp_path().exists());

        download.abort_and_cleanup();
        assert_eq!(fx.host.aborted(), 1);
        assert!(!fx.temp_path().exists());
    }

    #[test]
    fn test_pending_until_requested() {
        let fx = Fixture::new();
        let download = fx.download(fx.file(10), false, DOWNLOAD_REQUEST_TIMEOUT);
        assert_eq!(download.health(), Health::NoPartner);
        assert!(download.is_pending());
        assert!(download.to_string().ends_with("(pending)"));

        download.request(connected_partner());
        assert!(!download.is_pending());
    }

    #[test]
    fn test_blacklisting_does_not_drop_chunks() {
        let fx = Fixture::new();
        let file = fx.file(10);
        let download = fx.download(file.clone(), true, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        fx.repo.add_to_blacklist(&file);
        assert_eq!(download.health(), Health::Blacklisted);

        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));

        assert!(download.is_completed());
        assert_eq!(fs::read(fx.temp_path()).unwrap(), vec![1u8; 10]);
        assert_eq!(fx.host.completed(), 1);
    }

    #[test]
    fn test_restart_with_undeletable_staging_file() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        // A directory cannot be removed like a file
        fs::create_dir_all(fx.temp_path().join("inner")).unwrap();

        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));

        assert_eq!(download.temp_file_error(), Some(TempFileError::DeleteFailed));
        assert!(fx.temp_path().join("inner").is_dir());
        assert_eq!(download.counter().bytes_transferred(), 0);
        assert_eq!(fx.host.aborted(), 0);
    }

    #[test]
    fn test_staging_file_cannot_be_created() {
        let fx = Fixture::new();
        let file = fx.file(1000);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        // The target directory is taken by a file
        fs::write(fx.dir.path().join("docs"), b"not a directory").unwrap();

        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));

        assert_eq!(download.temp_file_error(), Some(TempFileError::CreateFailed));
        assert_eq!(
            fs::read(fx.dir.path().join("docs")).unwrap(),
            b"not a directory"
        );
        assert!(download.is_broken());
        assert_eq!(fx.host.aborted(), 0);
    }

    #[test]
    fn test_failed_append_keeps_staging_file() {
        let fx = Fixture::new();
        // A directory passes the existence and permission checks but cannot
        // be opened for appending
        fs::create_dir_all(fx.temp_path().join("inner")).unwrap();
        let staged = fs::metadata(fx.temp_path()).unwrap().len();
        assert!(staged > 0);

        let file = fx.file(staged + 10);
        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);
        download.request(connected_partner());
        download.add_chunk(Some(&chunk(&file, staged as i64, 10, 1)));

        assert_eq!(download.temp_file_error(), Some(TempFileError::WriteFailed));
        assert!(fx.temp_path().join("inner").is_dir());
        assert!(!download.is_completed());
        assert_eq!(fx.host.aborted(), 0);
        assert_eq!(fx.host.completed(), 0);
    }

    #[test]
    fn test_zero_length_file_that_cannot_be_created() {
        let fx = Fixture::new();
        fs::write(fx.dir.path().join("docs"), b"not a directory").unwrap();
        let file = fx.file(0);

        let download = fx.download(file.clone(), false, DOWNLOAD_REQUEST_TIMEOUT);

        assert!(download.is_completed());
        assert_eq!(download.temp_file_error(), Some(TempFileError::CreateFailed));
        assert_eq!(fx.host.completed(), 1);

        download.add_chunk(Some(&chunk(&file, 0, 0, 0)));
        assert_eq!(fx.host.completed(), 1);
    }

    #[test]
    fn test_timed_out_download_consults_partner_only_after_temp_file_error() {
        let fx = Fixture::new();
        let file = fx.file(100);
        let download = fx.download(file.clone(), false, Duration::ZERO);
        let partner = connected_partner();
        download.request(partner.clone());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(download.health(), Health::TimedOut);
        assert_eq!(partner.queue_checks(), 0);

        fs::write(fx.dir.path().join("docs"), b"not a directory").unwrap();
        download.add_chunk(Some(&chunk(&file, 0, 10, 1)));
        assert_eq!(download.temp_file_error(), Some(TempFileError::CreateFailed));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(download.health(), Health::TimedOut);
        assert_eq!(partner.queue_checks(), 1);
    }

    /// Host that delivers the next chunk from within its start callback
    struct FeedingHost {
        next: Mutex<Option<FileChunk>>,
        completed: std::sync::atomic::AtomicUsize,
    }

    impl DownloadHost for FeedingHost {
        fn set_started(&self, download: &Download) {
            let next = self.next.lock().take();
            download.add_chunk(next.as_ref());
        }

        fn set_completed(&self, _download: &Download) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn abort_download(&self, _download: &Download) {}
    }

    #[test]
    fn test_host_may_add_chunks_from_callbacks() {
        let fx = Fixture::new();
        let file = fx.file(10);
        let feeding = Arc::new(FeedingHost {
            next: Mutex::new(Some(chunk(&file, 5, 5, 2))),
            completed: Default::default(),
        });
        let host: Arc<dyn DownloadHost> = feeding.clone();
        let download = Download::new(
            &host,
            fx.repo.clone(),
            file.clone(),
            false,
            DOWNLOAD_REQUEST_TIMEOUT,
        );
        download.request(connected_partner());

        download.add_chunk(Some(&chunk(&file, 0, 5, 1)));

        assert!(download.is_completed());
        assert_eq!(feeding.completed.load(Ordering::SeqCst), 1);
        assert_eq!(
            fs::read(fx.temp_path()).unwrap(),
            vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]
        );
    }
}
