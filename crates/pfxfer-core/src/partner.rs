//! The remote peer a download is fetched from

use pfxfer_types::{FolderInfo, RequestDownload};
use std::fmt;

/// Connection to a remote peer as seen by the download engine.
///
/// The peer protocol itself lives outside this crate; implementations
/// translate these calls into messages on their connection.
pub trait Partner: Send + Sync + fmt::Debug {
    /// Display name of the peer
    fn nick(&self) -> String;

    /// True if the peer is reached over the local network
    fn is_on_lan(&self) -> bool;

    /// True if the connection exists at all
    fn is_connected(&self) -> bool;

    /// True if the connection is established and the handshake completed
    fn is_completely_connected(&self) -> bool;

    /// True if the peer is still a member of the folder
    fn has_folder(&self, folder: &FolderInfo) -> bool;

    /// Queue a download request for sending. Must not block.
    fn send_request_async(&self, request: RequestDownload);
}
