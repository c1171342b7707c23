//! Inflight chunk registry
//!
//! A process-wide set of `(volume, chunk)` pairs whose upload is
//! currently in progress at the backend adapter. Workers acquire a
//! lease before uploading so the same chunk is never uploaded twice
//! concurrently; readers and size queries consult the registry before
//! trusting the backend as the source of truth.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Registry of chunks inflight to the backing store.
#[derive(Default)]
pub struct InflightRegistry {
    chunks: Mutex<HashMap<String, HashSet<u16>>>,
}

impl InflightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the upload lease for one chunk. Returns `None` when
    /// another worker already holds it.
    pub fn acquire(&self, volume: &str, chunk: u16) -> Option<InflightLease<'_>> {
        let mut chunks = self.chunks.lock();
        if !chunks.entry(volume.to_string()).or_default().insert(chunk) {
            return None;
        }
        debug!(volume, chunk, "chunk marked inflight");
        Some(InflightLease {
            registry: self,
            volume: volume.to_string(),
            chunk,
        })
    }

    /// Is this chunk currently being uploaded?
    #[must_use]
    pub fn is_inflight(&self, volume: &str, chunk: u16) -> bool {
        self.chunks
            .lock()
            .get(volume)
            .is_some_and(|set| set.contains(&chunk))
    }

    /// Number of chunks of one volume currently inflight.
    #[must_use]
    pub fn count_for(&self, volume: &str) -> usize {
        self.chunks.lock().get(volume).map_or(0, HashSet::len)
    }

    /// Drop a stale entry whose wait budget was exceeded.
    pub fn clear(&self, volume: &str, chunk: u16) {
        warn!(volume, chunk, "clearing stale inflight entry");
        let mut chunks = self.chunks.lock();
        if let Some(set) = chunks.get_mut(volume) {
            set.remove(&chunk);
            if set.is_empty() {
                chunks.remove(volume);
            }
        }
    }

    /// Drop all entries of one volume (stale after an exceeded wait).
    pub fn clear_volume(&self, volume: &str) {
        warn!(volume, "clearing stale inflight entries");
        self.chunks.lock().remove(volume);
    }

    fn release(&self, volume: &str, chunk: u16) {
        debug!(volume, chunk, "chunk no longer inflight");
        let mut chunks = self.chunks.lock();
        if let Some(set) = chunks.get_mut(volume) {
            set.remove(&chunk);
            if set.is_empty() {
                chunks.remove(volume);
            }
        }
    }
}

/// Holds the inflight entry for one chunk; dropping it releases the
/// entry.
pub struct InflightLease<'a> {
    registry: &'a InflightRegistry,
    volume: String,
    chunk: u16,
}

impl Drop for InflightLease<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.volume, self.chunk);
    }
}
