//! Snapshot and rewind of a pipeline's cipher and MAC state
//!
//! Record a snapshot before each part. If the part fails anywhere between
//! reading plaintext and the server acknowledging it, rewind to the snapshot
//! and encrypt the part again: the retry produces byte-identical ciphertext.

use crate::{
    engine::{EngineState, MacState, ResumableHmac},
    pipeline::{EncryptionPipeline, UploadPhase},
    CryptoError, Result,
};
use tracing::info;

/// Independent copy of a pipeline's resumable state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionStateSnapshot {
    /// Cipher engine identity and encoded position
    pub engine: EngineState,
    /// HMAC inner/outer pad states, absent for AEAD ciphers
    pub mac: Option<MacState>,
    /// Last part encrypted when the snapshot was taken
    pub last_part_number: u32,
    /// Plaintext bytes encrypted when the snapshot was taken
    pub bytes_encrypted: u64,
    /// The final part and its trailer had already been emitted
    pub completed: bool,
}

/// Records and restores [`EncryptionStateSnapshot`]s
pub struct StateSnapshotter;

impl StateSnapshotter {
    /// Capture the pipeline's current state without mutating it.
    ///
    /// Fails with [`CryptoError::Unsupported`] for engines that cannot export
    /// their state, and with [`CryptoError::IllegalState`] while a failed part
    /// is pending.
    pub fn record(pipeline: &EncryptionPipeline) -> Result<EncryptionStateSnapshot> {
        if let UploadPhase::Failed { part_number } = pipeline.phase {
            return Err(CryptoError::IllegalState(format!(
                "part {} failed; its cipher position is not a part boundary",
                part_number
            )));
        }
        let engine = pipeline.engine.export_state()?;
        let mac = pipeline.mac.as_ref().map(ResumableHmac::export_state);
        Ok(EncryptionStateSnapshot {
            engine,
            mac,
            last_part_number: pipeline.last_part_number,
            bytes_encrypted: pipeline.bytes_encrypted,
            completed: pipeline.phase == UploadPhase::Completed,
        })
    }

    /// Replace the pipeline's engine and MAC with ones rebuilt from `snapshot`
    pub fn rewind(pipeline: &mut EncryptionPipeline, snapshot: &EncryptionStateSnapshot) -> Result<()> {
        if pipeline.phase == UploadPhase::Aborted {
            return Err(CryptoError::IllegalState(
                "cannot rewind an aborted upload".to_string(),
            ));
        }
        let expected = pipeline.descriptor().engine;
        if snapshot.engine.kind != expected {
            return Err(CryptoError::InvalidState(format!(
                "snapshot is for {} but the pipeline runs {}",
                snapshot.engine.kind, expected
            )));
        }
        if let Some(iv) = snapshot.engine.iv() {
            if iv != pipeline.iv() {
                return Err(CryptoError::InvalidState(
                    "snapshot belongs to a different cipher stream".to_string(),
                ));
            }
        }
        match (&snapshot.mac, &pipeline.mac) {
            (Some(state), Some(live)) if state.algorithm != live.algorithm() => {
                return Err(CryptoError::InvalidState(format!(
                    "snapshot MAC {} does not match pipeline MAC {}",
                    state.algorithm.id(),
                    live.algorithm().id()
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(CryptoError::InvalidState(
                    "snapshot and pipeline disagree on MAC presence".to_string(),
                ));
            }
            _ => {}
        }

        let engine = snapshot.engine.import(pipeline.cipher_key())?;
        let mac = snapshot.mac.as_ref().map(ResumableHmac::import).transpose()?;

        pipeline.engine = engine;
        pipeline.mac = mac;
        pipeline.last_part_number = snapshot.last_part_number;
        pipeline.bytes_encrypted = snapshot.bytes_encrypted;
        pipeline.phase = match snapshot.last_part_number {
            _ if snapshot.completed => UploadPhase::Completed,
            0 => UploadPhase::Created,
            part_number => UploadPhase::Encrypting { part_number },
        };

        info!(
            last_part = snapshot.last_part_number,
            offset = snapshot.bytes_encrypted,
            "rewound encryption state"
        );
        Ok(())
    }
}
