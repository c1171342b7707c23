//! Remote chunk store adapters for ChunkIO
//!
//! The volume engine talks to its backing store through the narrow
//! [`RemoteChunkStore`] capability. Two adapters live here:
//! - [`HelperStore`]: drives an external helper program over a
//!   bidirectional pipe with a line-oriented protocol
//! - [`MemoryStore`]: keeps chunks in process memory; the reference
//!   adapter used by the engine test suite

pub mod helper;
pub mod memory;

use chunkio_common::Result;
use std::collections::BTreeMap;

// Re-exports
pub use helper::{DEFAULT_PROGRAM_TIMEOUT, HelperStore};
pub use memory::MemoryStore;

/// Size metadata for one chunk on the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    pub size: u64,
}

/// The blob backend of one volume namespace.
///
/// All operations are synchronous and may be called from multiple worker
/// threads concurrently on distinct chunks. An adapter may block for
/// arbitrarily long and applies its own timeouts; the engine imposes
/// none.
pub trait RemoteChunkStore: Send + Sync {
    /// Probe the backend; invoked at most once per engine setup.
    fn check_connection(&self) -> Result<()>;

    /// Size of one chunk, or `Error::NotFound`.
    fn stat_chunk(&self, volume: &str, chunk: u16) -> Result<ChunkStat>;

    /// All blobs under the volume namespace with their sizes. May
    /// include non-chunk names; callers filter by the four-digit chunk
    /// name form.
    fn list_chunks(&self, volume: &str) -> Result<BTreeMap<String, u64>>;

    /// Store one chunk. Atomic from a reader's perspective: either the
    /// old or the new blob is visible, never a torn body.
    fn put_chunk(&self, volume: &str, chunk: u16, data: &[u8]) -> Result<()>;

    /// Fetch one chunk into `dest`, which must be exactly the size the
    /// backend reports for it; fails with `Error::SizeMismatch`
    /// otherwise. Returns the number of bytes written.
    fn get_chunk(&self, volume: &str, chunk: u16, dest: &mut [u8]) -> Result<usize>;

    /// Remove one blob by name; used by volume truncate over listed
    /// names.
    fn remove_chunk(&self, volume: &str, chunk_name: &str) -> Result<()>;
}
