//! A byte source that can be continued from a replacement after a failure

use crate::{CryptoError, Result};
use std::io::{self, Read};

/// Wraps a replaceable source and counts confirmed bytes.
///
/// The counter only moves when a read returns successfully. A read that
/// fails after the inner source already copied data into the caller's buffer
/// leaves the counter untouched, so `confirmed_bytes_read` is always the
/// offset at which a replacement source must start.
#[derive(Debug)]
pub struct ContinuableByteSource<R> {
    source: Option<R>,
    confirmed: u64,
    closed: bool,
}

impl<R: Read> ContinuableByteSource<R> {
    /// Create an empty source; attach data with [`continue_with`](Self::continue_with)
    pub fn new() -> Self {
        Self {
            source: None,
            confirmed: 0,
            closed: false,
        }
    }

    /// Create a source with `source` already attached
    pub fn with_source(source: R) -> Self {
        Self {
            source: Some(source),
            confirmed: 0,
            closed: false,
        }
    }

    /// Read into `buf[offset..offset + len]`. Returns 0 at end of stream.
    pub fn read_range(&mut self, buf: &mut [u8], offset: usize, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or(CryptoError::OutOfBounds {
                offset,
                length: len,
                capacity: buf.len(),
            })?;

        if self.closed {
            return Err(CryptoError::IllegalState("source is closed".to_string()));
        }
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| CryptoError::IllegalState("no source attached".to_string()))?;

        let n = source.read(&mut buf[offset..end])?;
        self.confirmed += n as u64;
        Ok(n)
    }

    /// Replace the current source, keeping the confirmed count.
    ///
    /// The previous source is dropped, which closes it.
    pub fn continue_with(&mut self, source: R) -> Result<()> {
        if self.closed {
            return Err(CryptoError::IllegalState(
                "cannot continue a closed source".to_string(),
            ));
        }
        if self.source.replace(source).is_some() {
            tracing::debug!(offset = self.confirmed, "continuing with replacement source");
        }
        Ok(())
    }

    /// Bytes successfully returned to callers so far
    pub fn confirmed_bytes_read(&self) -> u64 {
        self.confirmed
    }

    /// Whether a source is currently attached
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the attached source. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.source = None;
    }
}

impl<R: Read> Default for ContinuableByteSource<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read> Read for ContinuableByteSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        self.read_range(buf, 0, len)
            .map_err(CryptoError::into_io_error)
    }
}
