//! Seams to the storage service and the plaintext
//!
//! [`PartTransport`] carries encrypted parts to the service; [`RangeSource`]
//! reopens plaintext at an absolute offset after a failure. Both are
//! synchronous and report failures as `io::Error`, which
//! [`classify`](crate::classify::classify) sorts into resumable and fatal.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tessera_crypto::CompletedPart;
use uuid::Uuid;

/// Sends encrypted parts of one multipart upload
pub trait PartTransport {
    /// Begin an upload and return its id
    fn initiate(&mut self, object_path: &str, content_type: Option<&str>) -> io::Result<String> {
        let _ = (object_path, content_type);
        Ok(Uuid::new_v4().to_string())
    }

    /// Upload one part and return the service's tag for it
    fn upload_part(&mut self, part_number: u32, ciphertext: &[u8]) -> io::Result<String>;

    /// Assemble the acknowledged parts into the final object
    fn complete(&mut self, parts: &[CompletedPart]) -> io::Result<()> {
        let _ = parts;
        Ok(())
    }

    /// Discard the upload
    fn abort(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: PartTransport + ?Sized> PartTransport for &mut T {
    fn initiate(&mut self, object_path: &str, content_type: Option<&str>) -> io::Result<String> {
        (**self).initiate(object_path, content_type)
    }

    fn upload_part(&mut self, part_number: u32, ciphertext: &[u8]) -> io::Result<String> {
        (**self).upload_part(part_number, ciphertext)
    }

    fn complete(&mut self, parts: &[CompletedPart]) -> io::Result<()> {
        (**self).complete(parts)
    }

    fn abort(&mut self) -> io::Result<()> {
        (**self).abort()
    }
}

/// Plaintext that can be reopened at any offset
pub trait RangeSource {
    /// Total plaintext length
    fn len(&self) -> io::Result<u64>;

    /// Open the plaintext positioned at `offset`
    fn open_at(&self, offset: u64) -> io::Result<Box<dyn Read + Send>>;
}

impl<S: RangeSource + ?Sized> RangeSource for &S {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn open_at(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        (**self).open_at(offset)
    }
}

/// Plaintext held in memory
#[derive(Clone, Debug)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl RangeSource for MemorySource {
    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn open_at(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {} is past the end ({} bytes)", offset, self.data.len()),
                )
            })?;
        Ok(Box::new(Cursor::new(self.data.slice(start..))))
    }
}

/// Plaintext in a file, reopened and seeked for every range
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RangeSource for FileSource {
    fn len(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn open_at(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file))
    }
}

/// In-process stand-in for the storage service.
///
/// Failures queued with [`fail_next`](Self::fail_next) are returned by the
/// following `upload_part` calls, one per call.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    upload_id: Option<String>,
    parts: BTreeMap<u32, Bytes>,
    failures: VecDeque<io::Error>,
    attempts: u32,
    completed: Option<Vec<CompletedPart>>,
    aborted: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `upload_part` call fail with `err`
    pub fn fail_next(&mut self, err: io::Error) {
        self.failures.push_back(err);
    }

    /// Stored parts, concatenated in part order
    pub fn object(&self) -> Vec<u8> {
        self.parts.values().flat_map(|p| p.iter().copied()).collect()
    }

    /// Number of stored parts
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// `upload_part` calls so far, failed ones included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Parts listed when the upload was completed
    pub fn completed(&self) -> Option<&[CompletedPart]> {
        self.completed.as_deref()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }
}

impl PartTransport for MemoryTransport {
    fn initiate(&mut self, object_path: &str, _content_type: Option<&str>) -> io::Result<String> {
        let id = format!("{}-{}", object_path.trim_start_matches('/'), Uuid::new_v4());
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    fn upload_part(&mut self, part_number: u32, ciphertext: &[u8]) -> io::Result<String> {
        self.attempts += 1;
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        // A retried part replaces the earlier copy
        self.parts.insert(part_number, Bytes::copy_from_slice(ciphertext));
        Ok(format!("\"{}-{}\"", part_number, ciphertext.len()))
    }

    fn complete(&mut self, parts: &[CompletedPart]) -> io::Result<()> {
        if parts.len() != self.parts.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} parts listed, {} stored", parts.len(), self.parts.len()),
            ));
        }
        self.completed = Some(parts.to_vec());
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        self.parts.clear();
        self.aborted = true;
        Ok(())
    }
}
