//! Shared types for pfxfer
//!
//! This crate contains the data structures exchanged between the
//! transfer engine, its peers and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ============================================================================
// File Identity
// ============================================================================

/// A synchronized folder, identified by its id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderInfo {
    pub id: Uuid,
    pub name: String,
}

impl FolderInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Metadata of one version of a file inside a folder.
///
/// Two `FileInfo`s are equal when they name the same version of the same
/// file in the same folder. Size and modification date are carried along
/// but are not part of the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub folder: FolderInfo,
    /// Path relative to the folder base, `/` separated
    pub name: String,
    pub size: u64,
    pub modified_date: DateTime<Utc>,
    #[serde(default)]
    pub version: u32,
}

impl FileInfo {
    pub fn new(
        folder: FolderInfo,
        name: impl Into<String>,
        size: u64,
        modified_date: DateTime<Utc>,
    ) -> Self {
        Self {
            folder,
            name: name.into(),
            size,
            modified_date,
            version: 0,
        }
    }

    /// Resolve the on-disk location of this file below a folder base directory
    pub fn disk_file(&self, base_dir: &Path) -> PathBuf {
        self.name
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(base_dir.to_path_buf(), |path, part| path.join(part))
    }

    /// The bare filename (last path component)
    pub fn filename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Modification date in milliseconds since the epoch
    pub fn modified_millis(&self) -> i64 {
        self.modified_date.timestamp_millis()
    }

    /// Detailed description for log output
    pub fn to_detail_string(&self) -> String {
        format!(
            "{}/{} (v{}, {} bytes, modified {})",
            self.folder.name,
            self.name,
            self.version,
            self.size,
            self.modified_date.to_rfc3339()
        )
    }
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.folder == other.folder && self.name == other.name && self.version == other.version
    }
}

impl Eq for FileInfo {}

impl Hash for FileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folder.hash(state);
        self.name.hash(state);
        self.version.hash(state);
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder.name, self.name)
    }
}

// ============================================================================
// Peer Messages
// ============================================================================

/// A contiguous byte range of a file, sent by the partner.
///
/// `offset` is signed and `data` optional because both come off the wire
/// unchecked; the receiving download validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file: FileInfo,
    pub offset: i64,
    pub data: Option<Vec<u8>>,
}

impl FileChunk {
    pub fn new(file: FileInfo, offset: i64, data: Vec<u8>) -> Self {
        Self {
            file,
            offset,
            data: Some(data),
        }
    }

    /// Number of payload bytes, 0 if the chunk carries no data
    pub fn len(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(
                f,
                "FileChunk {} offset {} ({} bytes)",
                self.file,
                self.offset,
                data.len()
            ),
            None => write!(f, "FileChunk {} offset {} (no data)", self.file, self.offset),
        }
    }
}

/// Asks a partner to send a file starting at `start_offset`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDownload {
    pub file: FileInfo,
    pub start_offset: u64,
}

// ============================================================================
// Bandwidth Types
// ============================================================================

/// Logical traffic category sharing one bandwidth limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    LanInput,
    LanOutput,
    WanInput,
    WanOutput,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::LanInput,
        TrafficClass::LanOutput,
        TrafficClass::WanInput,
        TrafficClass::WanOutput,
    ];

    pub fn output(on_lan: bool) -> Self {
        if on_lan {
            TrafficClass::LanOutput
        } else {
            TrafficClass::WanOutput
        }
    }

    pub fn input(on_lan: bool) -> Self {
        if on_lan {
            TrafficClass::LanInput
        } else {
            TrafficClass::WanInput
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrafficClass::LanInput => "lan-input",
            TrafficClass::LanOutput => "lan-output",
            TrafficClass::WanInput => "wan-input",
            TrafficClass::WanOutput => "wan-output",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Bandwidth limits in bytes per second, 0 = unlimited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSettings {
    pub upload_limit_wan: u64,
    pub upload_limit_lan: u64,
    pub download_limit_wan: u64,
    pub download_limit_lan: u64,
    /// Length of one accounting window of the bandwidth provider
    #[serde(default = "default_provider_interval_ms")]
    pub provider_interval_ms: u64,
}

fn default_provider_interval_ms() -> u64 {
    1000
}

impl BandwidthSettings {
    /// The configured limit for a traffic class
    pub fn limit_for(&self, class: TrafficClass) -> u64 {
        match class {
            TrafficClass::LanInput => self.download_limit_lan,
            TrafficClass::LanOutput => self.upload_limit_lan,
            TrafficClass::WanInput => self.download_limit_wan,
            TrafficClass::WanOutput => self.upload_limit_wan,
        }
    }
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            upload_limit_wan: 0,
            upload_limit_lan: 0,
            download_limit_wan: 0,
            download_limit_lan: 0,
            provider_interval_ms: default_provider_interval_ms(),
        }
    }
}

/// Application settings for the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub bandwidth: BandwidthSettings,
    /// A download not touched for this long, and not queued remotely, is broken
    #[serde(default = "default_download_request_timeout_secs")]
    pub download_request_timeout_secs: u64,
    /// Interval of the periodic broken-download check
    #[serde(default = "default_transfer_check_interval_secs")]
    pub transfer_check_interval_secs: u64,
}

fn default_download_request_timeout_secs() -> u64 {
    3 * 60
}

fn default_transfer_check_interval_secs() -> u64 {
    10
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            bandwidth: BandwidthSettings::default(),
            download_request_timeout_secs: default_download_request_timeout_secs(),
            transfer_check_interval_secs: default_transfer_check_interval_secs(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the transfer manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    DownloadRequested {
        file: FileInfo,
        start_offset: u64,
    },
    DownloadStarted {
        file: FileInfo,
    },
    DownloadCompleted {
        file: FileInfo,
    },
    DownloadAborted {
        file: FileInfo,
    },
    DownloadBroken {
        file: FileInfo,
        reason: String,
    },
    BandwidthLimitChanged {
        class: TrafficClass,
        bytes_per_second: u64,
    },
}
