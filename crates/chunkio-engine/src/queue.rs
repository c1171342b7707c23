//! The flush queue
//!
//! An ordered deduplicating bounded buffer of pending chunk uploads.
//! Producers are the chunk windows of open volumes; consumers are the
//! upload workers. At most one request exists per `(volume, chunk)`
//! key: re-submitting a key updates the queued entry in place, which
//! collapses a series of appends to the same open chunk into a single
//! pending upload.
//!
//! Consumers dequeue with a reserved slot so a failed upload can always
//! be put back without the buffer being full, and a requeued entry is
//! not picked up again before the recheck interval elapses.

use bytes::Bytes;
use chunkio_common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// One pending chunk upload.
pub struct FlushRequest {
    pub volume: Arc<str>,
    pub chunk: u16,
    /// The chunk's valid bytes. Moved here from the window (terminal
    /// flush) or copied (the window keeps appending).
    pub payload: Bytes,
    /// Upload attempts so far.
    pub attempts: u8,
}

impl FlushRequest {
    pub fn new(volume: Arc<str>, chunk: u16, payload: Bytes) -> Self {
        Self {
            volume,
            chunk,
            payload,
            attempts: 0,
        }
    }

    fn matches(&self, volume: &str, chunk: u16) -> bool {
        self.chunk == chunk && *self.volume == *volume
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The request was appended as a new entry.
    Queued,
    /// An entry with the same key absorbed the request.
    Merged,
}

/// One entry of a status listing.
#[derive(Debug, Clone, Serialize)]
pub struct PendingFlush {
    pub volume: String,
    pub chunk: u16,
    pub len: u64,
    pub attempts: u8,
}

struct Inner {
    entries: VecDeque<FlushRequest>,
    /// Slots withheld by dequeuers that may need to re-enqueue.
    reserved: usize,
    /// One-way shutdown latch.
    flushing: bool,
}

/// Ordered deduplicating circular buffer of flush requests.
pub struct FlushQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl FlushQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                reserved: 0,
                flushing: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue a request, merging into an existing entry with the same
    /// `(volume, chunk)` key.
    ///
    /// On a merge the queued entry adopts the newcomer's payload iff it
    /// is strictly longer; the entry keeps its queue position and
    /// attempt count either way. `use_reserved_slot` consumes a slot
    /// withheld by `dequeue`; otherwise the call blocks while the
    /// buffer is full. `no_signal` suppresses the consumer wakeup so a
    /// requeued failure is not immediately retried by a sibling worker.
    pub fn enqueue(
        &self,
        req: FlushRequest,
        use_reserved_slot: bool,
        no_signal: bool,
    ) -> Result<Enqueued> {
        let mut inner = self.inner.lock();
        if inner.flushing {
            return Err(Error::permanent("flush queue is shutting down"));
        }

        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|entry| entry.matches(&req.volume, req.chunk))
        {
            if req.payload.len() > entry.payload.len() {
                trace!(
                    volume = %req.volume,
                    chunk = req.chunk,
                    old_len = entry.payload.len(),
                    new_len = req.payload.len(),
                    "updating queued flush request in place"
                );
                entry.payload = req.payload;
            }
            if use_reserved_slot {
                inner.reserved = inner.reserved.saturating_sub(1);
                self.not_full.notify_one();
            }
            if !no_signal {
                self.not_empty.notify_one();
            }
            return Ok(Enqueued::Merged);
        }

        if use_reserved_slot {
            inner.reserved = inner.reserved.saturating_sub(1);
        } else {
            while inner.entries.len() + inner.reserved >= self.capacity {
                self.not_full.wait(&mut inner);
                if inner.flushing {
                    return Err(Error::permanent("flush queue is shutting down"));
                }
            }
        }

        trace!(volume = %req.volume, chunk = req.chunk, len = req.payload.len(), "enqueueing chunk");
        inner.entries.push_back(req);
        if !no_signal {
            self.not_empty.notify_one();
        }
        Ok(Enqueued::Queued)
    }

    /// Take the oldest request, waiting while the buffer is empty.
    ///
    /// Returns `None` once the queue is flushing. `reserve_slot`
    /// withholds a slot for a potential re-enqueue; release it with
    /// [`unreserve_slot`](Self::unreserve_slot) when the request
    /// completes instead. With `requeued_hint` the call waits out the
    /// recheck interval (or a fresh enqueue signal) before picking up
    /// work again, so a just-requeued failure is not retried hot.
    pub fn dequeue(
        &self,
        reserve_slot: bool,
        requeued_hint: bool,
        recheck: Duration,
    ) -> Option<FlushRequest> {
        let mut inner = self.inner.lock();
        let mut damped = requeued_hint && !inner.entries.is_empty();
        loop {
            if inner.flushing {
                return None;
            }
            if !damped {
                if let Some(req) = inner.entries.pop_front() {
                    if reserve_slot {
                        inner.reserved += 1;
                    } else {
                        self.not_full.notify_one();
                    }
                    return Some(req);
                }
            }
            let _ = self.not_empty.wait_for(&mut inner, recheck);
            damped = false;
        }
    }

    /// Release a slot withheld by `dequeue(reserve_slot)`.
    pub fn unreserve_slot(&self) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        self.not_full.notify_one();
    }

    /// The most recently queued request of a volume, as
    /// `(chunk, payload length)`. Size queries use this: the tail entry
    /// is the highest pending chunk.
    #[must_use]
    pub fn last_for_volume(&self, volume: &str) -> Option<(u16, u64)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .rev()
            .find(|req| *req.volume == *volume)
            .map(|req| (req.chunk, req.payload.len() as u64))
    }

    /// Copy a queued chunk's payload into `dest`, letting readers
    /// short-circuit a backend fetch. Returns the payload length.
    #[must_use]
    pub fn clone_chunk(&self, volume: &str, chunk: u16, dest: &mut [u8]) -> Option<usize> {
        let inner = self.inner.lock();
        let req = inner
            .entries
            .iter()
            .find(|req| req.matches(volume, chunk))?;
        let n = req.payload.len();
        dest[..n].copy_from_slice(&req.payload);
        Some(n)
    }

    /// Snapshot of every pending request, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingFlush> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|req| PendingFlush {
                volume: req.volume.to_string(),
                chunk: req.chunk,
                len: req.payload.len() as u64,
                attempts: req.attempts,
            })
            .collect()
    }

    /// Shut the queue down: wake every waiter; subsequent dequeues
    /// return `None`. One-way.
    pub fn flush(&self) {
        debug!("flushing queue, waking all waiters");
        let mut inner = self.inner.lock();
        inner.flushing = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Nothing queued and no consumer holding a reserved slot. A worker
    /// keeps its slot from dequeue until the request completed or was
    /// requeued, so idle means no request is in a worker's hands.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.entries.is_empty() && inner.reserved == 0
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.inner.lock().flushing
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const RECHECK: Duration = Duration::from_millis(50);

    fn req(volume: &str, chunk: u16, payload: &[u8]) -> FlushRequest {
        FlushRequest::new(Arc::from(volume), chunk, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_fifo_across_keys() {
        let queue = FlushQueue::new(8);
        queue.enqueue(req("a", 0, b"1"), false, false).unwrap();
        queue.enqueue(req("b", 0, b"2"), false, false).unwrap();
        queue.enqueue(req("a", 1, b"3"), false, false).unwrap();

        let order: Vec<_> = (0..3)
            .map(|_| {
                let r = queue.dequeue(false, false, RECHECK).unwrap();
                (r.volume.to_string(), r.chunk)
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 0),
                ("a".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_merge_adopts_longer_payload() {
        let queue = FlushQueue::new(8);
        assert_eq!(
            queue.enqueue(req("vol", 0, b"x"), false, false).unwrap(),
            Enqueued::Queued
        );
        assert_eq!(
            queue.enqueue(req("vol", 0, b"xy"), false, false).unwrap(),
            Enqueued::Merged
        );
        assert_eq!(queue.len(), 1);

        let r = queue.dequeue(false, false, RECHECK).unwrap();
        assert_eq!(&r.payload[..], b"xy");
    }

    #[test]
    fn test_merge_ignores_shorter_payload() {
        let queue = FlushQueue::new(8);
        queue.enqueue(req("vol", 0, b"full"), false, false).unwrap();
        assert_eq!(
            queue.enqueue(req("vol", 0, b"f"), false, false).unwrap(),
            Enqueued::Merged
        );

        let r = queue.dequeue(false, false, RECHECK).unwrap();
        assert_eq!(&r.payload[..], b"full");
    }

    #[test]
    fn test_merge_keeps_queue_position_and_attempts() {
        let queue = FlushQueue::new(8);
        let mut first = req("vol", 0, b"a");
        first.attempts = 2;
        queue.enqueue(first, false, false).unwrap();
        queue.enqueue(req("other", 0, b"b"), false, false).unwrap();
        queue.enqueue(req("vol", 0, b"ab"), false, false).unwrap();

        let r = queue.dequeue(false, false, RECHECK).unwrap();
        assert_eq!(&*r.volume, "vol");
        assert_eq!(r.attempts, 2);
        assert_eq!(&r.payload[..], b"ab");
    }

    #[test]
    fn test_reserved_slot_allows_requeue_when_full() {
        let queue = FlushQueue::new(1);
        queue.enqueue(req("vol", 0, b"a"), false, false).unwrap();

        // The only slot is now logically withheld by the dequeuer.
        let r = queue.dequeue(true, false, RECHECK).unwrap();
        assert!(queue.is_empty());

        // Re-enqueueing through the reserved slot must not block.
        queue.enqueue(r, true, true).unwrap();
        assert_eq!(queue.len(), 1);
        queue.dequeue(true, false, RECHECK).unwrap();
        queue.unreserve_slot();
    }

    #[test]
    fn test_enqueue_blocks_while_full() {
        let queue = Arc::new(FlushQueue::new(1));
        queue.enqueue(req("vol", 0, b"a"), false, false).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                queue.enqueue(req("vol", 1, b"b"), false, false).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let r = queue.dequeue(false, false, RECHECK).unwrap();
        assert_eq!(r.chunk, 0);
        producer.join().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeued_hint_damps_dequeue() {
        let queue = FlushQueue::new(4);
        queue.enqueue(req("vol", 0, b"a"), false, true).unwrap();

        let start = Instant::now();
        let r = queue.dequeue(false, true, RECHECK).unwrap();
        assert_eq!(r.chunk, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_flush_wakes_and_stops_consumers() {
        let queue = Arc::new(FlushQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(true, false, Duration::from_secs(60)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.flush();
        assert_eq!(consumer.join().unwrap().map(|r| r.chunk), None);
        assert!(queue.is_flushing());
        assert!(
            queue
                .enqueue(req("vol", 0, b"late"), false, false)
                .is_err()
        );
    }

    #[test]
    fn test_peeks() {
        let queue = FlushQueue::new(8);
        queue.enqueue(req("a", 0, b"one"), false, false).unwrap();
        queue.enqueue(req("b", 4, b"two"), false, false).unwrap();
        queue.enqueue(req("a", 1, b"three"), false, false).unwrap();

        assert_eq!(queue.last_for_volume("a"), Some((1, 5)));
        assert_eq!(queue.last_for_volume("b"), Some((4, 3)));
        assert_eq!(queue.last_for_volume("c"), None);

        let mut buf = [0u8; 16];
        let n = queue.clone_chunk("b", 4, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert!(queue.clone_chunk("b", 5, &mut buf).is_none());

        let pending = queue.pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].volume, "a");
        assert_eq!(pending[2].chunk, 1);
    }
}
