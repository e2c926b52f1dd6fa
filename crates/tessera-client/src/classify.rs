//! Resumable vs fatal I/O failures
//!
//! A failure is fatal when retrying cannot help: the operation was
//! interrupted on purpose, the host does not exist or refuses connections, or
//! TLS negotiation failed. Everything else (resets, timeouts, broken pipes,
//! short reads) is worth another attempt.

use std::error::Error as StdError;
use std::io;
use tessera_crypto::CryptoError;
use thiserror::Error;

/// What to do about an I/O failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDisposition {
    /// Reopen or retry
    Resumable,
    /// Give up and report
    Fatal,
}

/// Marker for fatal causes that have no `io::ErrorKind` of their own.
///
/// Transports wrap it in an `io::Error` so [`classify`] can find it.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalCause {
    #[error("unknown host")]
    UnknownHost,
    #[error("TLS negotiation failed")]
    Tls,
}

impl From<FatalCause> for io::Error {
    fn from(cause: FatalCause) -> Self {
        io::Error::new(io::ErrorKind::Other, cause)
    }
}

/// Resolver messages for hosts that do not exist
const NAME_RESOLUTION_MARKERS: &[&str] = &[
    "failed to lookup address",
    "Name or service not known",
    "nodename nor servname provided",
    "No such host is known",
];

/// Classify an I/O failure
pub fn classify(err: &io::Error) -> IoDisposition {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused => {
            return IoDisposition::Fatal;
        }
        _ => {}
    }

    let mut cause = err.get_ref().map(|e| e as &(dyn StdError + 'static));
    while let Some(e) = cause {
        if e.is::<FatalCause>() {
            return IoDisposition::Fatal;
        }
        // Programming and state errors surfaced through a Read impl
        if let Some(crypto) = e.downcast_ref::<CryptoError>() {
            if crypto.io_error().is_none() {
                return IoDisposition::Fatal;
            }
        }
        if let Some(inner) = e.downcast_ref::<io::Error>() {
            if classify(inner) == IoDisposition::Fatal {
                return IoDisposition::Fatal;
            }
        }
        cause = e.source();
    }

    let message = err.to_string();
    if NAME_RESOLUTION_MARKERS.iter().any(|m| message.contains(m)) {
        return IoDisposition::Fatal;
    }
    IoDisposition::Resumable
}
