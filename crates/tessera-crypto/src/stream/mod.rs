//! Byte streams that survive failures and part boundaries
//!
//! - [`ContinuableByteSource`] counts exactly the bytes it has delivered and
//!   can be spliced onto a replacement source after an I/O failure.
//! - [`SpliceWriter`] / [`SpliceReader`] relay one logical stream through a
//!   sequence of per-part sinks or sources.

mod continuable;
mod splice;

pub use continuable::ContinuableByteSource;
pub use splice::{SpliceReader, SpliceWriter};

/// Default relay buffer size for splice streams (8 KB)
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 8 * 1024;
