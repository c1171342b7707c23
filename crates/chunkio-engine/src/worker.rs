//! Upload workers
//!
//! Workers dequeue flush requests and push them to the remote chunk
//! store. A failed upload goes back into the queue through the slot the
//! worker reserved at dequeue time; once the retry budget of a request
//! is exhausted the whole device is fenced read-only so a misconfigured
//! backend cannot wedge flushing forever.

use crate::device::EngineStats;
use crate::inflight::InflightRegistry;
use crate::queue::{FlushQueue, FlushRequest};
use chunkio_backend::RemoteChunkStore;
use chunkio_common::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// State shared between the device and its upload workers.
pub(crate) struct FlushShared {
    pub(crate) store: Arc<dyn RemoteChunkStore>,
    pub(crate) queue: Arc<FlushQueue>,
    pub(crate) inflight: Arc<InflightRegistry>,
    pub(crate) fenced: Arc<AtomicBool>,
    /// Upload attempts per request before fencing; 0 retries forever.
    pub(crate) retries: u8,
    /// How long an idle worker sleeps before rechecking for requeued
    /// work.
    pub(crate) recheck_interval: Duration,
    pub(crate) stats: Arc<EngineStats>,
}

/// Dequeue and upload until the queue shuts down.
pub(crate) fn worker_loop(shared: &FlushShared) {
    let mut requeued = false;
    loop {
        let Some(mut req) = shared
            .queue
            .dequeue(true, requeued, shared.recheck_interval)
        else {
            break;
        };
        requeued = false;

        debug!(volume = %req.volume, chunk = req.chunk, "flushing chunk");
        match flush_remote_chunk(shared, &req) {
            Ok(()) => {
                shared.queue.unreserve_slot();
            }
            Err(e) => {
                req.attempts = req.attempts.saturating_add(1);
                let exhausted = shared.retries > 0 && req.attempts >= shared.retries;
                if exhausted || !e.is_retryable() {
                    error!(
                        volume = %req.volume,
                        chunk = req.chunk,
                        attempts = req.attempts,
                        error = %e,
                        "unable to flush chunk to the backing store, fencing device read-only"
                    );
                    shared.fenced.store(true, Ordering::SeqCst);
                    shared.queue.unreserve_slot();
                    continue;
                }

                // Put the request back through the reserved slot, without
                // waking a sibling that would retry it immediately.
                warn!(
                    volume = %req.volume,
                    chunk = req.chunk,
                    attempts = req.attempts,
                    error = %e,
                    "chunk upload failed, requeueing for retry"
                );
                if shared.queue.enqueue(req, true, true).is_err() {
                    break;
                }
                requeued = true;
            }
        }
    }
    debug!("stopping io-thread");
}

/// Upload one request to the backing store.
///
/// Also used directly by the device when it runs without io-threads:
/// one attempt, errors surface to the caller.
pub(crate) fn flush_remote_chunk(shared: &FlushShared, req: &FlushRequest) -> Result<()> {
    if req.payload.is_empty() {
        debug!(volume = %req.volume, chunk = req.chunk, "not flushing empty chunk");
        return Ok(());
    }

    let Some(_lease) = shared.inflight.acquire(&req.volume, req.chunk) else {
        // Another worker already owns this upload.
        debug!(volume = %req.volume, chunk = req.chunk, "chunk already inflight, dropping request");
        return Ok(());
    };

    // Chunks are append-only: uploading fewer bytes than the backing
    // store already holds would lose the tail, so skip the upload when
    // the remote chunk is strictly bigger.
    if let Ok(stat) = shared.store.stat_chunk(&req.volume, req.chunk) {
        if stat.size > req.payload.len() as u64 {
            debug!(
                volume = %req.volume,
                chunk = req.chunk,
                existing = stat.size,
                len = req.payload.len(),
                "chunk already present with more data, skipping upload"
            );
            shared.stats.uploads_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    }

    match shared.store.put_chunk(&req.volume, req.chunk, &req.payload) {
        Ok(()) => {
            shared.stats.uploads.fetch_add(1, Ordering::Relaxed);
            shared
                .stats
                .bytes_uploaded
                .fetch_add(req.payload.len() as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            shared.stats.upload_failures.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chunkio_backend::MemoryStore;
    use std::thread;
    use std::time::Instant;

    fn shared_over(store: Arc<MemoryStore>, retries: u8) -> FlushShared {
        FlushShared {
            store,
            queue: Arc::new(FlushQueue::new(8)),
            inflight: Arc::new(InflightRegistry::new()),
            fenced: Arc::new(AtomicBool::new(false)),
            retries,
            recheck_interval: Duration::from_millis(10),
            stats: Arc::new(EngineStats::default()),
        }
    }

    fn req(volume: &str, chunk: u16, payload: &[u8]) -> FlushRequest {
        FlushRequest::new(Arc::from(volume), chunk, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_empty_payload_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let shared = shared_over(Arc::clone(&store), 0);

        flush_remote_chunk(&shared, &req("vol", 0, b"")).unwrap();
        assert_eq!(store.put_attempts(), 0);
    }

    #[test]
    fn test_grow_only_skips_shorter_upload() {
        let store = Arc::new(MemoryStore::new());
        store.insert_blob("vol", "0000", &b"longer"[..]);
        let shared = shared_over(Arc::clone(&store), 0);

        flush_remote_chunk(&shared, &req("vol", 0, b"abc")).unwrap();
        assert_eq!(store.put_attempts(), 0);
        assert_eq!(store.chunk("vol", "0000").unwrap(), &b"longer"[..]);
        assert_eq!(shared.stats.uploads_skipped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_equal_size_is_reuploaded() {
        let store = Arc::new(MemoryStore::new());
        store.insert_blob("vol", "0000", &b"old"[..]);
        let shared = shared_over(Arc::clone(&store), 0);

        flush_remote_chunk(&shared, &req("vol", 0, b"new")).unwrap();
        assert_eq!(store.chunk("vol", "0000").unwrap(), &b"new"[..]);
    }

    #[test]
    fn test_inflight_chunk_is_dropped_silently() {
        let store = Arc::new(MemoryStore::new());
        let shared = shared_over(Arc::clone(&store), 0);

        let _lease = shared.inflight.acquire("vol", 0).unwrap();
        flush_remote_chunk(&shared, &req("vol", 0, b"abc")).unwrap();
        assert_eq!(store.put_attempts(), 0);
        assert!(store.chunk("vol", "0000").is_none());
    }

    #[test]
    fn test_worker_retries_then_fences() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_puts(u32::MAX);
        let shared = Arc::new(shared_over(Arc::clone(&store), 3));

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || worker_loop(&shared))
        };

        shared.queue.enqueue(req("vol", 0, b"x"), false, false).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !shared.fenced.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "device never fenced");
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(store.put_attempts(), 3);
        assert!(shared.queue.is_empty());

        shared.queue.flush();
        worker.join().unwrap();
    }
}
