//! Splice streams: one logical byte stream relayed through per-part endpoints
//!
//! Per-part sinks and sources belong to the caller. Switching with
//! `set_next` hands the previous endpoint back instead of closing it.

use crate::{CryptoError, Result};
use std::io::{self, Read, Write};

fn not_attached(what: &str) -> io::Error {
    CryptoError::IllegalState(format!("no {} attached", what)).into_io_error()
}

/// Output side: buffers writes and forwards them to the current part sink
#[derive(Debug)]
pub struct SpliceWriter<W: Write> {
    buffer: Vec<u8>,
    capacity: usize,
    sink: Option<W>,
}

impl<W: Write> SpliceWriter<W> {
    /// Create a writer with a relay buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CryptoError::InvalidArgument(
                "relay buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            sink: None,
        })
    }

    /// Switch to `sink`. Buffered bytes are flushed to the previous sink
    /// first, which is then returned to the caller unclosed.
    pub fn set_next(&mut self, sink: W) -> Result<Option<W>> {
        let previous = self.detach()?;
        self.sink = Some(sink);
        Ok(previous)
    }

    /// Flush buffered bytes and hand back the current sink
    pub fn detach(&mut self) -> Result<Option<W>> {
        if self.sink.is_some() {
            self.flush()?;
        } else if !self.buffer.is_empty() {
            return Err(CryptoError::IllegalState(format!(
                "{} buffered bytes have no sink",
                self.buffer.len()
            )));
        }
        Ok(self.sink.take())
    }

    /// Drop buffered bytes and the current sink without flushing
    pub fn discard(&mut self) -> Option<W> {
        self.buffer.clear();
        self.sink.take()
    }

    /// Bytes waiting in the relay buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Borrow the current sink
    pub fn get_ref(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    /// Write the buffer to the sink. Bytes the sink accepted before a
    /// failure are dropped from the buffer, so a later flush resumes after
    /// them instead of sending them twice.
    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let sink = self.sink.as_mut().ok_or_else(|| not_attached("sink"))?;
        let mut written = 0;
        let result = loop {
            if written == self.buffer.len() {
                break Ok(());
            }
            match sink.write(&self.buffer[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.buffer.drain(..written);
        result
    }
}

impl<W: Write> Write for SpliceWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sink.is_none() {
            return Err(not_attached("sink"));
        }
        if self.buffer.len() + buf.len() > self.capacity {
            self.flush_buffer()?;
        }
        if buf.len() >= self.capacity {
            // Report partial writes so the caller resends only the rest
            let sink = self.sink.as_mut().ok_or_else(|| not_attached("sink"))?;
            return sink.write(buf);
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

/// Input side: relays reads from the current part source.
///
/// Bytes already pulled into the relay buffer are served before anything
/// from a newly attached source, so switching never drops or repeats data.
#[derive(Debug)]
pub struct SpliceReader<R: Read> {
    buffer: Box<[u8]>,
    pos: usize,
    filled: usize,
    source: Option<R>,
}

impl<R: Read> SpliceReader<R> {
    /// Create a reader with a relay buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CryptoError::InvalidArgument(
                "relay buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
            source: None,
        })
    }

    /// Switch to `source`, returning the previous one unclosed
    pub fn set_next(&mut self, source: R) -> Option<R> {
        self.source.replace(source)
    }

    /// Detach the current source
    pub fn take(&mut self) -> Option<R> {
        self.source.take()
    }

    /// Bytes waiting in the relay buffer
    pub fn buffered(&self) -> usize {
        self.filled - self.pos
    }
}

impl<R: Read> Read for SpliceReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.filled {
            let source = self.source.as_mut().ok_or_else(|| not_attached("source"))?;
            // Large reads skip the relay buffer when it is empty
            if out.len() >= self.buffer.len() {
                return source.read(out);
            }
            self.filled = source.read(&mut self.buffer)?;
            self.pos = 0;
            if self.filled == 0 {
                return Ok(0);
            }
        }
        let n = (self.filled - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
