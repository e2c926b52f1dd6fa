//! Encrypted multipart upload with retry and cross-process resume
//!
//! Each part goes through the same steps:
//!
//! 1. record a snapshot of the cipher and MAC state
//! 2. stream up to `part_size` plaintext bytes through the pipeline
//! 3. upload the ciphertext
//!
//! A resumable failure while reading plaintext is absorbed in step 2 by
//! continuing the source from the last confirmed byte, so the cipher never
//! sees a gap. A resumable failure in step 3 rewinds to the snapshot, reopens
//! the plaintext at the part start and repeats the part; the retry produces
//! the same ciphertext.

use crate::{
    classify::{classify, IoDisposition},
    transport::{PartTransport, RangeSource},
    ClientError, Result, UploadConfig,
};
use std::io::{self, Read};
use tessera_crypto::{
    CompletedPart, ContinuableByteSource, CryptoError, CryptoRegistry, EncryptionPipeline,
    EncryptionStateSnapshot, EnvelopeCodec, ResumableUploadState, SecretKey, SharedPipeline,
    StateSnapshotter, UploadMetadata, UploadPhase,
};
use tracing::{debug, info, instrument, warn};

type PlaintextSource = ContinuableByteSource<Box<dyn Read + Send>>;

/// Upload progress information
#[derive(Clone, Debug)]
pub struct UploadProgress {
    /// Plaintext bytes acknowledged by the service
    pub bytes_uploaded: u64,
    /// Total plaintext bytes
    pub total_bytes: u64,
    /// Last acknowledged part
    pub current_part: u32,
    /// Total number of parts
    pub total_parts: u32,
}

impl UploadProgress {
    /// Get percentage complete
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.current_part == self.total_parts { 100.0 } else { 0.0 };
        }
        (self.bytes_uploaded as f64 / self.total_bytes as f64) * 100.0
    }
}

/// One encrypted multipart upload
pub struct EncryptedMultipartUpload<T, S> {
    config: UploadConfig,
    registry: CryptoRegistry,
    pipeline: SharedPipeline,
    metadata: UploadMetadata,
    transport: T,
    ranges: S,
    source: PlaintextSource,
    /// Absolute plaintext offset at which `source` was opened
    base_offset: u64,
    needs_reopen: bool,
    total_size: u64,
}

impl<T: PartTransport, S: RangeSource> EncryptedMultipartUpload<T, S> {
    /// Start a new upload of `ranges` to `object_path`
    #[instrument(skip(config, key, transport, ranges), fields(cipher = %config.cipher_id))]
    pub fn start(
        config: UploadConfig,
        key: &SecretKey,
        object_path: &str,
        mut transport: T,
        ranges: S,
    ) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let total_size = ranges.len()?;

        let pipeline = EncryptionPipeline::initiate(&registry, key, &config.cipher_id)?
            .with_relay_buffer_size(config.relay_buffer_size)?;
        let upload_id = transport.initiate(object_path, config.content_type.as_deref())?;

        let mut metadata = UploadMetadata::new(upload_id, object_path, config.part_size);
        metadata.content_type = config.content_type.clone();
        let source = ContinuableByteSource::with_source(ranges.open_at(0)?);

        info!(
            upload_id = %metadata.upload_id,
            total_size,
            part_size = config.part_size,
            "started encrypted multipart upload"
        );

        Ok(Self {
            config,
            registry,
            pipeline: SharedPipeline::new(pipeline),
            metadata,
            transport,
            ranges,
            source,
            base_offset: 0,
            needs_reopen: false,
            total_size,
        })
    }

    /// Continue an upload from a state envelope written by [`save_state`](Self::save_state)
    #[instrument(skip_all, fields(envelope_len = envelope.len()))]
    pub fn resume(
        config: UploadConfig,
        key: &SecretKey,
        envelope: &[u8],
        transport: T,
        ranges: S,
    ) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let state = EnvelopeCodec::new(&registry).decode(envelope, key, &config.state_cipher_id)?;

        if state.metadata.part_size != config.part_size {
            warn!(
                saved = state.metadata.part_size,
                configured = config.part_size,
                "part size differs from saved state; keeping the saved size"
            );
        }
        let total_size = ranges.len()?;
        let offset = state.snapshot.bytes_encrypted;
        if offset > total_size {
            return Err(ClientError::StateMismatch(format!(
                "saved state is at offset {} but the source has {} bytes",
                offset, total_size
            )));
        }

        let pipeline = state
            .restore(&registry, key)?
            .with_relay_buffer_size(config.relay_buffer_size)?;
        let source = ContinuableByteSource::with_source(ranges.open_at(offset)?);

        info!(
            upload_id = %state.metadata.upload_id,
            last_part = state.snapshot.last_part_number,
            offset,
            "resumed encrypted multipart upload"
        );

        Ok(Self {
            config,
            registry,
            pipeline: SharedPipeline::new(pipeline),
            metadata: state.metadata,
            transport,
            ranges,
            source,
            base_offset: offset,
            needs_reopen: false,
            total_size,
        })
    }

    /// Encrypt and upload the next part.
    ///
    /// Returns `None` once the final part has been acknowledged.
    #[instrument(skip(self), fields(upload_id = %self.metadata.upload_id))]
    pub fn upload_next_part(&mut self) -> Result<Option<CompletedPart>> {
        let shared = self.pipeline.clone();
        let mut pipeline = shared.lock()?;
        match pipeline.phase() {
            UploadPhase::Completed => return Ok(None),
            UploadPhase::Failed { part_number } => {
                return Err(ClientError::PartLost { part_number });
            }
            _ => {}
        }

        let part_number = pipeline.last_part_number() + 1;
        let part_start = pipeline.bytes_encrypted();
        let part_len = self.metadata.part_size.min(self.total_size - part_start);
        let last = part_start + part_len >= self.total_size;

        let snapshot = match StateSnapshotter::record(&pipeline) {
            Ok(snapshot) => Some(snapshot),
            Err(CryptoError::Unsupported(reason)) => {
                debug!(part_number, %reason, "cipher state cannot be snapshotted; part is not retryable");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut attempt = 0u32;
        loop {
            let result = self.run_part(&mut pipeline, part_number, part_start, part_len, last);
            let err = match result {
                Ok(etag) => {
                    let part = CompletedPart { part_number, etag };
                    self.metadata.completed_parts.push(part.clone());
                    debug!(part_number, offset = part_start, len = part_len, last, "part uploaded");
                    return Ok(Some(part));
                }
                Err(err) => err,
            };

            self.needs_reopen = true;
            // Without a rewind the next call would skip this part
            let Some(snapshot) = snapshot.as_ref() else {
                pipeline.mark_failed(part_number);
                return Err(err);
            };
            if let Err(rewind_err) = rewind(&mut pipeline, snapshot) {
                pipeline.mark_failed(part_number);
                return Err(rewind_err);
            }

            let transport_failure = matches!(err, ClientError::Transport { .. });
            if !transport_failure || !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.config.max_part_retries {
                return Err(ClientError::RetriesExhausted {
                    part_number,
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }
            attempt += 1;
            warn!(part_number, offset = part_start, attempt, error = %err, "retrying part");
        }
    }

    /// Upload every remaining part and complete the upload
    pub fn upload_all(&mut self) -> Result<()> {
        while self.upload_next_part()?.is_some() {}
        self.complete()
    }

    /// Tell the service to assemble the parts
    pub fn complete(&mut self) -> Result<()> {
        let phase = self.pipeline.lock()?.phase();
        if let UploadPhase::Failed { part_number } = phase {
            return Err(ClientError::PartLost { part_number });
        }
        if phase != UploadPhase::Completed {
            let progress = self.progress();
            return Err(ClientError::Unfinished {
                parts_sent: progress.current_part,
                total_parts: progress.total_parts,
            });
        }
        self.transport.complete(&self.metadata.completed_parts)?;
        self.source.close();
        info!(
            upload_id = %self.metadata.upload_id,
            parts = self.metadata.completed_parts.len(),
            "completed encrypted multipart upload"
        );
        Ok(())
    }

    /// Abandon the upload
    pub fn abort(&mut self) -> Result<()> {
        self.pipeline.lock()?.abort();
        self.source.close();
        self.transport.abort()?;
        Ok(())
    }

    /// Seal the upload state under `key` so another process can resume it
    pub fn save_state(&self, key: &SecretKey) -> Result<Vec<u8>> {
        let pipeline = self.pipeline.lock()?;
        let state = ResumableUploadState::capture(&pipeline, self.metadata.clone())?;
        let envelope =
            EnvelopeCodec::new(&self.registry).encode(&state, key, &self.config.state_cipher_id)?;
        debug!(
            last_part = state.snapshot.last_part_number,
            len = envelope.len(),
            "saved upload state"
        );
        Ok(envelope)
    }

    /// Progress so far
    pub fn progress(&self) -> UploadProgress {
        let parts = self.total_parts();
        let current_part = self.metadata.completed_parts.last().map_or(0, |p| p.part_number);
        UploadProgress {
            bytes_uploaded: (u64::from(current_part) * self.metadata.part_size).min(self.total_size),
            total_bytes: self.total_size,
            current_part,
            total_parts: parts,
        }
    }

    /// Number of parts the upload will have
    pub fn total_parts(&self) -> u32 {
        let parts = self.total_size.div_ceil(self.metadata.part_size).max(1);
        u32::try_from(parts).unwrap_or(u32::MAX)
    }

    /// Upload bookkeeping
    pub fn metadata(&self) -> &UploadMetadata {
        &self.metadata
    }

    /// Service-assigned upload id
    pub fn upload_id(&self) -> &str {
        &self.metadata.upload_id
    }

    /// Handle to the pipeline; holding its lock blocks part uploads
    pub fn pipeline(&self) -> SharedPipeline {
        self.pipeline.clone()
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Hand back the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn run_part(
        &mut self,
        pipeline: &mut EncryptionPipeline,
        part_number: u32,
        part_start: u64,
        part_len: u64,
        last: bool,
    ) -> Result<String> {
        if self.needs_reopen {
            self.reopen_at(part_number, part_start)?;
        }

        let reader = PartReader {
            source: &mut self.source,
            ranges: &self.ranges,
            base_offset: self.base_offset,
            remaining: part_len,
            reopens_left: self.config.max_source_reopens,
            part_number,
        };
        let ciphertext = if last {
            pipeline.encrypt_final_part(part_number, reader)
        } else {
            pipeline.encrypt_part(part_number, reader)
        }
        .map_err(|e| match e {
            CryptoError::PlaintextRead {
                part_number,
                offset,
                source,
            } => ClientError::Source {
                part_number,
                offset,
                source,
            },
            other => other.into(),
        })?;

        let actual = pipeline.bytes_encrypted() - part_start;
        if actual != part_len {
            return Err(ClientError::SourceTruncated {
                part_number,
                expected: part_len,
                actual,
            });
        }

        self.transport
            .upload_part(part_number, &ciphertext)
            .map_err(|source| ClientError::Transport {
                part_number,
                offset: part_start,
                source,
            })
    }

    fn reopen_at(&mut self, part_number: u32, offset: u64) -> Result<()> {
        let next = self
            .ranges
            .open_at(offset)
            .map_err(|source| ClientError::Source {
                part_number,
                offset,
                source,
            })?;
        self.source.close();
        self.source = ContinuableByteSource::with_source(next);
        self.base_offset = offset;
        self.needs_reopen = false;
        debug!(part_number, offset, "reopened plaintext at part start");
        Ok(())
    }
}

fn rewind(pipeline: &mut EncryptionPipeline, snapshot: &EncryptionStateSnapshot) -> Result<()> {
    StateSnapshotter::rewind(pipeline, snapshot).map_err(ClientError::from)
}

/// Plaintext for one part; continues the source after resumable failures
struct PartReader<'a, S> {
    source: &'a mut PlaintextSource,
    ranges: &'a S,
    base_offset: u64,
    remaining: u64,
    reopens_left: u32,
    part_number: u32,
}

impl<S: RangeSource> Read for PartReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        loop {
            let err = match self.source.read_range(buf, 0, want) {
                Ok(n) => {
                    self.remaining -= n as u64;
                    return Ok(n);
                }
                Err(e) => e.into_io_error(),
            };
            if self.reopens_left == 0 || classify(&err) == IoDisposition::Fatal {
                return Err(err);
            }
            self.reopens_left -= 1;

            let offset = self.base_offset + self.source.confirmed_bytes_read();
            warn!(
                part_number = self.part_number,
                offset,
                error = %err,
                "plaintext read failed; continuing from confirmed offset"
            );
            let next = self.ranges.open_at(offset)?;
            self.source
                .continue_with(next)
                .map_err(CryptoError::into_io_error)?;
        }
    }
}
