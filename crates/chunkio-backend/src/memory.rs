//! In-memory chunk store
//!
//! Keeps every volume's chunks in a process-local map. This is the
//! reference adapter the engine test suite runs against; the fault
//! knobs let tests script upload failures and slow backends.

use crate::{ChunkStat, RemoteChunkStore};
use bytes::Bytes;
use chunkio_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Chunk store over process memory.
#[derive(Default)]
pub struct MemoryStore {
    volumes: Mutex<HashMap<String, BTreeMap<String, Bytes>>>,
    /// Number of upcoming `put_chunk` calls that fail with a transient
    /// error.
    fail_puts: AtomicU32,
    /// Artificial latency applied to every `put_chunk` call.
    put_delay: Mutex<Duration>,
    /// When set, `check_connection` reports the backend unreachable.
    unreachable: AtomicBool,
    put_attempts: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` uploads with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Delay every upload by `delay`.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Total `put_chunk` calls observed, failed ones included.
    #[must_use]
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Direct view of one chunk, for assertions.
    #[must_use]
    pub fn chunk(&self, volume: &str, chunk_name: &str) -> Option<Bytes> {
        self.volumes
            .lock()
            .get(volume)
            .and_then(|chunks| chunks.get(chunk_name))
            .cloned()
    }

    /// Plant a blob directly, bypassing the fault knobs.
    pub fn insert_blob(&self, volume: &str, name: &str, data: impl Into<Bytes>) {
        self.volumes
            .lock()
            .entry(volume.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }
}

impl RemoteChunkStore for MemoryStore {
    fn check_connection(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::transient("memory store marked unreachable"));
        }
        Ok(())
    }

    fn stat_chunk(&self, volume: &str, chunk: u16) -> Result<ChunkStat> {
        let name = chunkio_common::chunk_name(chunk);
        self.chunk(volume, &name)
            .map(|data| ChunkStat {
                size: data.len() as u64,
            })
            .ok_or_else(|| Error::not_found(volume, name))
    }

    fn list_chunks(&self, volume: &str) -> Result<BTreeMap<String, u64>> {
        Ok(self
            .volumes
            .lock()
            .get(volume)
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|(name, data)| (name.clone(), data.len() as u64))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn put_chunk(&self, volume: &str, chunk: u16, data: &[u8]) -> Result<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient("scripted upload failure"));
        }

        self.insert_blob(volume, &chunkio_common::chunk_name(chunk), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get_chunk(&self, volume: &str, chunk: u16, dest: &mut [u8]) -> Result<usize> {
        let name = chunkio_common::chunk_name(chunk);
        let data = self
            .chunk(volume, &name)
            .ok_or_else(|| Error::not_found(volume, name))?;
        if data.len() != dest.len() {
            return Err(Error::SizeMismatch {
                expected: data.len() as u64,
                actual: dest.len() as u64,
            });
        }
        dest.copy_from_slice(&data);
        Ok(dest.len())
    }

    fn remove_chunk(&self, volume: &str, chunk_name: &str) -> Result<()> {
        // Removal of an absent blob is tolerated.
        if let Some(chunks) = self.volumes.lock().get_mut(volume) {
            chunks.remove(chunk_name);
        }
        Ok(())
    }
}
