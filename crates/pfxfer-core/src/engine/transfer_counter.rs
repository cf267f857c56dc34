//! Progress and rate accounting for a single transfer

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counts the bytes of one transfer. Safe to share between threads.
#[derive(Debug)]
pub struct TransferCounter {
    start_offset: u64,
    size: u64,
    transferred: AtomicU64,
    first_chunk_at: Mutex<Option<Instant>>,
}

impl TransferCounter {
    /// `start_offset` bytes are already present locally, e.g. on resume
    pub fn new(start_offset: u64, size: u64) -> Self {
        Self {
            start_offset,
            size,
            transferred: AtomicU64::new(0),
            first_chunk_at: Mutex::new(None),
        }
    }

    pub fn chunk_transferred(&self, len: u64) {
        self.first_chunk_at.lock().get_or_insert_with(Instant::now);
        self.transferred.fetch_add(len, Ordering::AcqRel);
    }

    /// Bytes moved in this session
    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Bytes present in total, including the resumed start offset
    pub fn bytes_done(&self) -> u64 {
        self.start_offset.saturating_add(self.bytes_transferred())
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fraction done between 0.0 and 1.0
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        (self.bytes_done() as f64 / self.size as f64).min(1.0)
    }

    /// Average bytes per second since the first chunk
    pub fn calculate_rate(&self) -> f64 {
        let started = match *self.first_chunk_at.lock() {
            Some(started) => started,
            None => return 0.0,
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred() as f64 / elapsed
    }
}
