//! Helpers shared by the unit tests of this crate

use crate::engine::{Download, DownloadHost};
use crate::partner::Partner;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use pfxfer_types::{FolderInfo, RequestDownload};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// Unique directory below the system temp dir, removed on drop
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("pfxfer-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A modification date aligned to the start of a 2s precision window
pub fn aligned_date() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
}

/// Host that only counts callbacks
#[derive(Default)]
pub struct RecordingHost {
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    pub aborted: AtomicUsize,
}

impl RecordingHost {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl DownloadHost for RecordingHost {
    fn set_started(&self, _download: &Download) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn set_completed(&self, _download: &Download) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_download(&self, _download: &Download) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Partner with switchable connection state that records requests
#[derive(Debug)]
pub struct MockPartner {
    pub connected: AtomicBool,
    pub completely_connected: AtomicBool,
    pub on_folder: AtomicBool,
    pub requests: Mutex<Vec<RequestDownload>>,
    /// Number of upload queue lookups
    queue_checks: AtomicUsize,
}

impl MockPartner {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            completely_connected: AtomicBool::new(true),
            on_folder: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            queue_checks: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> Vec<RequestDownload> {
        self.requests.lock().clone()
    }

    pub fn queue_checks(&self) -> usize {
        self.queue_checks.load(Ordering::SeqCst)
    }
}

impl Partner for MockPartner {
    fn nick(&self) -> String {
        "mock".to_string()
    }

    fn is_on_lan(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.queue_checks.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst)
    }

    fn is_completely_connected(&self) -> bool {
        self.completely_connected.load(Ordering::SeqCst)
    }

    fn has_folder(&self, _folder: &FolderInfo) -> bool {
        self.on_folder.load(Ordering::SeqCst)
    }

    fn send_request_async(&self, request: RequestDownload) {
        self.requests.lock().push(request);
    }
}
