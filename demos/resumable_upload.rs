//! Resumable encrypted upload walkthrough
//!
//! Uploads a random payload in parts through an in-memory transport that
//! drops some requests, saves the upload state halfway, "restarts", resumes
//! from the saved envelope and finally decrypts the stored object.
//!
//! Run with `RUST_LOG=tessera_client=debug cargo run --example resumable_upload`.

use anyhow::{ensure, Context};
use std::io;
use tessera_client::{EncryptedMultipartUpload, MemorySource, MemoryTransport, UploadConfig};
use tessera_crypto::{decrypt_object, SecretKey};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PAYLOAD_SIZE: usize = 5 * 1024 * 1024 + 123;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resumable_upload=info,tessera_client=info,tessera_crypto=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut payload = vec![0u8; PAYLOAD_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut payload);
    let payload = bytes::Bytes::from(payload);

    let key = SecretKey::generate();
    let config = UploadConfig::default()
        .with_part_size(1024 * 1024)
        .with_content_type("application/octet-stream");

    let mut transport = MemoryTransport::new();
    transport.fail_next(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));

    // First run: upload half the parts, then persist state
    let envelope = {
        let mut upload = EncryptedMultipartUpload::start(
            config.clone(),
            &key,
            "/demo/payload.bin",
            &mut transport,
            MemorySource::new(payload.clone()),
        )
        .context("starting upload")?;

        let half = upload.total_parts() / 2;
        for _ in 0..half {
            if let Some(part) = upload.upload_next_part()? {
                tracing::info!(part = part.part_number, etag = %part.etag, "part stored");
            }
        }
        let progress = upload.progress();
        tracing::info!(
            "paused at {:.1}% ({} of {} parts)",
            progress.percentage(),
            progress.current_part,
            progress.total_parts
        );
        upload.save_state(&key)?
    };
    tracing::info!(bytes = envelope.len(), "saved upload state");

    // Second run: only the key and the envelope survive
    let mut upload = EncryptedMultipartUpload::resume(
        config.clone(),
        &key,
        &envelope,
        &mut transport,
        MemorySource::new(payload.clone()),
    )
    .context("resuming upload")?;
    let iv = upload.pipeline().lock()?.iv().to_vec();
    upload.upload_all()?;
    drop(upload);

    let registry = config.registry()?;
    let plaintext = decrypt_object(&registry, &key, &config.cipher_id, &iv, &transport.object())?;
    ensure!(plaintext.as_slice() == &payload[..], "decrypted object does not match the payload");

    tracing::info!(
        parts = transport.part_count(),
        attempts = transport.attempts(),
        "object verified"
    );
    Ok(())
}
