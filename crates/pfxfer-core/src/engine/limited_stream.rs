//! Rate-limited wrappers around `std::io` streams
//!
//! Every byte passing through a [`LimitedWriter`] or [`LimitedReader`] is
//! paid for at the attached [`BandwidthLimiter`] first. Writes are split into
//! the sub-ranges the limiter grants, so one large buffer never holds the
//! whole budget of a traffic class.
//!
//! A stream given a [`CancellationToken`] stops waiting for bandwidth once
//! the token is cancelled and fails with an error recognized by
//! [`is_interrupted_io`](crate::error::is_interrupted_io).

use crate::engine::bandwidth_limiter::BandwidthLimiter;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn request(
    limiter: &BandwidthLimiter,
    cancel: Option<&CancellationToken>,
    size: u64,
) -> io::Result<u64> {
    match cancel {
        Some(cancel) => Ok(limiter.request_bandwidth_until(size, cancel)?),
        None => Ok(limiter.request_bandwidth(size)),
    }
}

/// Output stream throttled by a shared bandwidth limiter
#[derive(Debug)]
pub struct LimitedWriter<W> {
    inner: W,
    limiter: Arc<BandwidthLimiter>,
    cancel: Option<CancellationToken>,
}

impl<W: Write> LimitedWriter<W> {
    pub fn new(inner: W, limiter: Arc<BandwidthLimiter>) -> Self {
        Self {
            inner,
            limiter,
            cancel: None,
        }
    }

    /// Fail pending and future bandwidth waits once `cancel` is cancelled
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Write the whole buffer, paying bandwidth for every sub-write.
    ///
    /// With `unlimited` set the limiter is bypassed and the buffer is written
    /// in one go. Used for control traffic that must never stall.
    pub fn write_limited(&mut self, buf: &[u8], unlimited: bool) -> io::Result<()> {
        if unlimited {
            return self.inner.write_all(buf);
        }

        let mut offset = 0;
        while offset < buf.len() {
            offset += self.write_granted(&buf[offset..])?;
        }
        Ok(())
    }

    /// Write one byte. Pays for each byte separately, do not use for bulk data.
    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        request(&self.limiter, self.cancel.as_ref(), 1)?;
        self.inner.write_all(&[byte])
    }

    /// Write the prefix of `buf` the limiter grants. Returns its length.
    fn write_granted(&mut self, buf: &[u8]) -> io::Result<usize> {
        let granted = request(&self.limiter, self.cancel.as_ref(), buf.len() as u64)? as usize;
        if let Err(e) = self.inner.write_all(&buf[..granted]) {
            self.limiter.return_available(granted as u64);
            return Err(e);
        }
        Ok(granted)
    }

    pub fn bandwidth_limiter(&self) -> &Arc<BandwidthLimiter> {
        &self.limiter
    }

    /// Swap the governing limiter, e.g. when a peer moves between LAN and WAN
    pub fn set_bandwidth_limiter(&mut self, limiter: Arc<BandwidthLimiter>) {
        self.limiter = limiter;
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    /// Writes granted sub-ranges until the buffer is done. A failure after
    /// some of them reached the sink reports those bytes instead.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write_granted(&buf[written..]) {
                Ok(n) => written += n,
                Err(_) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Input stream throttled by a shared bandwidth limiter
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: R,
    limiter: Arc<BandwidthLimiter>,
    cancel: Option<CancellationToken>,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, limiter: Arc<BandwidthLimiter>) -> Self {
        Self {
            inner,
            limiter,
            cancel: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn bandwidth_limiter(&self) -> &Arc<BandwidthLimiter> {
        &self.limiter
    }

    pub fn set_bandwidth_limiter(&mut self, limiter: Arc<BandwidthLimiter>) {
        self.limiter = limiter;
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let granted = request(&self.limiter, self.cancel.as_ref(), buf.len() as u64)? as usize;
        match self.inner.read(&mut buf[..granted]) {
            Ok(read) => {
                // Short reads hand the unused grant back
                self.limiter.return_available((granted - read) as u64);
                Ok(read)
            }
            Err(e) => {
                self.limiter.return_available(granted as u64);
                Err(e)
            }
        }
    }
}
