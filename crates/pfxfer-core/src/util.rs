//! File date helpers shared by every modified-time comparison

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Coarsest modification-time resolution among supported filesystems (FAT)
pub const GLOBAL_PRECISION_MS: i64 = 2000;

/// Truncate a millisecond timestamp to the global file date precision.
///
/// Both sides of a modified-date comparison must go through this, otherwise
/// filesystems with coarse timestamps never match.
pub fn convert_to_global_precision(millis: i64) -> i64 {
    millis - millis.rem_euclid(GLOBAL_PRECISION_MS)
}

/// Milliseconds since the epoch, negative for pre-epoch times
pub fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Convert a filesystem timestamp into a UTC date
pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// True if both millisecond timestamps fall into the same precision window
pub fn same_file_date(a: i64, b: i64) -> bool {
    convert_to_global_precision(a) == convert_to_global_precision(b)
}
