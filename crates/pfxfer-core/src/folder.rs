//! Local folder layout and per-folder download blacklists

use parking_lot::RwLock;
use pfxfer_types::{FileInfo, FolderInfo};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Resolves files to local paths and answers blacklist queries
pub trait FolderRepository: Send + Sync {
    /// Local path of a file, `None` if its folder is not known here
    fn disk_file(&self, file: &FileInfo) -> Option<PathBuf>;

    /// True if automatic downloads of this file are forbidden in its folder
    fn is_in_blacklist(&self, file: &FileInfo) -> bool;
}

#[derive(Debug)]
struct LocalFolder {
    info: FolderInfo,
    base_dir: PathBuf,
    blacklist: HashSet<String>,
}

/// Folders mapped to base directories on the local disk
#[derive(Debug, Default)]
pub struct LocalFolderRepository {
    folders: RwLock<HashMap<Uuid, LocalFolder>>,
}

impl LocalFolderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a folder, storing its files below `base_dir`
    pub fn add_folder(&self, info: FolderInfo, base_dir: impl Into<PathBuf>) {
        let base_dir = base_dir.into();
        info!("Folder {} mapped to {:?}", info.name, base_dir);
        self.folders.write().insert(
            info.id,
            LocalFolder {
                info,
                base_dir,
                blacklist: HashSet::new(),
            },
        );
    }

    pub fn remove_folder(&self, folder: &FolderInfo) -> bool {
        self.folders.write().remove(&folder.id).is_some()
    }

    pub fn base_dir(&self, folder: &FolderInfo) -> Option<PathBuf> {
        self.folders
            .read()
            .get(&folder.id)
            .map(|f| f.base_dir.clone())
    }

    pub fn folders(&self) -> Vec<FolderInfo> {
        self.folders.read().values().map(|f| f.info.clone()).collect()
    }

    /// Exclude a file from automatic downloads. Returns false for unknown folders.
    pub fn add_to_blacklist(&self, file: &FileInfo) -> bool {
        match self.folders.write().get_mut(&file.folder.id) {
            Some(folder) => {
                folder.blacklist.insert(file.name.clone());
                true
            }
            None => false,
        }
    }

    pub fn remove_from_blacklist(&self, file: &FileInfo) -> bool {
        self.folders
            .write()
            .get_mut(&file.folder.id)
            .map(|folder| folder.blacklist.remove(&file.name))
            .unwrap_or(false)
    }
}

impl FolderRepository for LocalFolderRepository {
    fn disk_file(&self, file: &FileInfo) -> Option<PathBuf> {
        self.folders
            .read()
            .get(&file.folder.id)
            .map(|folder| file.disk_file(&folder.base_dir))
    }

    fn is_in_blacklist(&self, file: &FileInfo) -> bool {
        self.folders
            .read()
            .get(&file.folder.id)
            .map(|folder| folder.blacklist.contains(&file.name))
            .unwrap_or(false)
    }
}

/// Prefix of the staging file a download writes into
pub const TEMP_FILE_PREFIX: &str = "(incomplete) ";

/// Prefix of the placeholder a folder may show for a not yet downloaded file
pub const PLACEHOLDER_FILE_PREFIX: &str = "(placeholder) ";

/// Staging file for a target path: same directory, `(incomplete) ` prefix.
/// The name must not change between runs, resuming relies on it.
pub fn temp_file_for(disk_file: &Path) -> Option<PathBuf> {
    prefixed_sibling(disk_file, TEMP_FILE_PREFIX)
}

/// Placeholder file for a target path
pub fn placeholder_file_for(disk_file: &Path) -> Option<PathBuf> {
    prefixed_sibling(disk_file, PLACEHOLDER_FILE_PREFIX)
}

fn prefixed_sibling(disk_file: &Path, prefix: &str) -> Option<PathBuf> {
    let name = disk_file.file_name()?.to_string_lossy();
    let sibling = format!("{}{}", prefix, name);
    Some(match disk_file.parent() {
        Some(parent) => parent.join(sibling),
        None => PathBuf::from(sibling),
    })
}
