//! A partner that serves files from the local disk
//!
//! Requests are answered on a dedicated thread: the source is read through
//! the LAN output limiter, every chunk crosses an in-memory "wire" throttled
//! by the LAN input limiter and is then handed to the transfer manager.
//! [`LoopbackPartner::stop`] cancels the uploads of this partner only, other
//! users of the shared limiters keep waiting for their bandwidth.

use anyhow::{anyhow, Result};
use pfxfer_core::{is_interrupted_io, LimitedReader, LimitedWriter, Partner, TransferManager};
use pfxfer_types::{FileChunk, FolderInfo, RequestDownload};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct LoopbackPartner {
    source: PathBuf,
    chunk_size: usize,
    manager: Weak<TransferManager>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LoopbackPartner {
    pub fn new(source: PathBuf, chunk_size: usize, manager: &Arc<TransferManager>) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            manager: Arc::downgrade(manager),
            connected: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort running uploads, including ones blocked on bandwidth
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Partner for LoopbackPartner {
    fn nick(&self) -> String {
        "loopback".to_string()
    }

    fn is_on_lan(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_completely_connected(&self) -> bool {
        self.is_connected()
    }

    fn has_folder(&self, _folder: &FolderInfo) -> bool {
        true
    }

    fn send_request_async(&self, request: RequestDownload) {
        let source = self.source.clone();
        let chunk_size = self.chunk_size;
        let manager = self.manager.clone();
        let connected = Arc::clone(&self.connected);
        let cancel = self.cancel.clone();

        let spawned = std::thread::Builder::new()
            .name("loopback-upload".to_string())
            .spawn(move || {
                let result = serve(&source, chunk_size, &manager, &request, cancel);
                if let Err(e) = result {
                    let stopped = e.downcast_ref::<io::Error>().is_some_and(is_interrupted_io);
                    if stopped {
                        debug!("Upload of {} stopped", request.file);
                        return;
                    }
                    warn!("Upload of {} failed: {}", request.file, e);
                    // The health check picks this up and aborts the download
                    connected.store(false, Ordering::SeqCst);
                }
            });
        if let Err(e) = spawned {
            warn!("Unable to start upload thread: {}", e);
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

fn serve(
    source: &Path,
    chunk_size: usize,
    manager: &Weak<TransferManager>,
    request: &RequestDownload,
    cancel: CancellationToken,
) -> Result<()> {
    let manager = manager
        .upgrade()
        .ok_or_else(|| anyhow!("transfer manager is gone"))?;
    manager.set_queued(&request.file);

    let mut file = File::open(source)?;
    file.seek(SeekFrom::Start(request.start_offset))?;
    let mut reader =
        LimitedReader::new(file, manager.output_limiter(true)).with_cancel_token(cancel.clone());
    let input_limiter = manager.input_limiter(true);

    let mut offset = request.start_offset;
    let mut buf = vec![0u8; chunk_size];
    while manager.is_downloading(&request.file) {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        let mut wire = LimitedWriter::new(Vec::with_capacity(n), Arc::clone(&input_limiter))
            .with_cancel_token(cancel.clone());
        wire.write_all(&buf[..n])?;
        let offset_field = i64::try_from(offset)?;
        manager.chunk_received(FileChunk::new(request.file.clone(), offset_field, wire.into_inner()));
        offset += n as u64;
    }

    debug!("Upload of {} ended at offset {}", request.file, offset);
    Ok(())
}
