//! Shared bandwidth gate for one traffic class
//!
//! A limiter holds the number of bytes that may still be transferred in the
//! current accounting window. Writers ask for bandwidth before touching the
//! wire and block while the budget is exhausted. The budget itself is reset
//! from outside, usually by the [`BandwidthProvider`](super::BandwidthProvider).

use crate::error::TransferError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `available` value meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// How often a blocked, cancellable request re-checks its token
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Token gate shared by all writers of one traffic class.
///
/// `available < 0` means unlimited, `0` means exhausted and a positive value
/// is the remaining budget of the current window.
pub struct BandwidthLimiter {
    available: Mutex<i64>,
    available_changed: Condvar,
}

impl BandwidthLimiter {
    /// Create an unlimited limiter
    pub fn new() -> Self {
        Self::with_available(UNLIMITED)
    }

    /// Create a limiter with an initial budget
    pub fn with_available(available: i64) -> Self {
        Self {
            available: Mutex::new(available),
            available_changed: Condvar::new(),
        }
    }

    /// Request bandwidth for `size` bytes.
    ///
    /// Blocks while the budget is exhausted. The granted amount may be lower
    /// than `size`; callers loop until they got everything they need.
    pub fn request_bandwidth(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }

        let mut available = self.available.lock();
        while *available == 0 {
            self.available_changed.wait(&mut available);
        }
        Self::grant(&mut available, size)
    }

    /// Like [`request_bandwidth`](Self::request_bandwidth), but gives up with
    /// [`TransferError::Interrupted`] once `cancel` is cancelled.
    ///
    /// Only this caller is affected, other writers blocked on the same
    /// limiter keep waiting.
    pub fn request_bandwidth_until(
        &self,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Interrupted);
        }
        if size == 0 {
            return Ok(0);
        }

        let mut available = self.available.lock();
        while *available == 0 {
            self.available_changed
                .wait_for(&mut available, CANCEL_CHECK_INTERVAL);
            if cancel.is_cancelled() {
                return Err(TransferError::Interrupted);
            }
        }
        Ok(Self::grant(&mut available, size))
    }

    fn grant(available: &mut i64, size: u64) -> u64 {
        if *available < 0 {
            return size;
        }
        let granted = size.min(*available as u64);
        *available -= granted as i64;
        granted
    }

    /// Replace the budget. Any non-zero amount wakes all blocked writers.
    pub fn set_available(&self, amount: i64) {
        let mut available = self.available.lock();
        *available = amount;
        if amount != 0 {
            self.available_changed.notify_all();
        }
    }

    /// Snapshot of the current budget
    pub fn get_available(&self) -> i64 {
        *self.available.lock()
    }

    /// Give back bandwidth that was granted but not used.
    /// Has no effect while unlimited.
    pub fn return_available(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut available = self.available.lock();
        if *available >= 0 {
            let amount = i64::try_from(amount).unwrap_or(i64::MAX);
            *available = available.saturating_add(amount);
            self.available_changed.notify_all();
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.get_available() < 0
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("available", &self.get_available())
            .finish()
    }
}
