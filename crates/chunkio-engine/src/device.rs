//! The chunked volume device
//!
//! [`ChunkedDevice`] exposes one volume at a time as a random-access
//! byte stream over a [`RemoteChunkStore`]. Reads and writes go through
//! the single in-memory chunk window; crossing a chunk boundary hands
//! the finished chunk to the flush queue and repositions the window.
//! Reads that miss the window consult the queue (clone), then the
//! inflight registry (bounded wait), then the backing store.

use crate::inflight::InflightRegistry;
use crate::queue::{Enqueued, FlushQueue, FlushRequest, PendingFlush};
use crate::window::ChunkWindow;
use crate::worker::{self, FlushShared};
use bytes::Bytes;
use chunkio_backend::RemoteChunkStore;
use chunkio_common::{DEFAULT_CHUNK_SIZE, DeviceOptions, Error, MAX_CHUNKS, Result, is_chunk_name};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Let idle io-threads check for work every 300 seconds; a requeued
/// upload is retried after the same interval.
const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Busy-wait budget for chunks inflight to the backing store:
/// 120 * 5 s = 10 minutes before an entry is considered stale.
const INFLIGHT_RETRIES: u32 = 120;
const INFLIGHT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the write buffer to drain.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue slots per io-thread when `io_slots` is left at zero.
const DEFAULT_QUEUE_SLOTS: u8 = 10;

/// Tunables of one device instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Upload worker threads; 0 flushes synchronously in the caller.
    pub io_threads: u8,
    /// Flush-queue slots per worker thread.
    pub io_slots: u8,
    /// Upload attempts per chunk before fencing; 0 = retry forever.
    pub retries: u8,
    /// Idle/retry recheck interval of the workers.
    pub recheck_interval: Duration,
    /// Bounded busy-wait for inflight chunks.
    pub inflight_retries: u32,
    pub inflight_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_threads: 0,
            io_slots: DEFAULT_QUEUE_SLOTS,
            retries: 0,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            inflight_retries: INFLIGHT_RETRIES,
            inflight_retry_delay: INFLIGHT_RETRY_DELAY,
        }
    }
}

impl From<&DeviceOptions> for EngineConfig {
    fn from(opts: &DeviceOptions) -> Self {
        Self {
            chunk_size: opts.chunk_size,
            io_threads: opts.io_threads,
            io_slots: opts.io_slots,
            retries: opts.retries,
            ..Self::default()
        }
    }
}

/// How a volume is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Device counters, in the spirit of disk statistics: cheap atomics,
/// read-only accessors, no exporter.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub uploads: AtomicU64,
    pub upload_failures: AtomicU64,
    /// Uploads skipped because the remote chunk was already bigger.
    pub uploads_skipped: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub downloads: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    /// Flush requests absorbed by an already-queued entry.
    pub queue_merges: AtomicU64,
    /// Reads served by cloning a pending flush request.
    pub queue_clones: AtomicU64,
}

/// A chunked volume device over a remote chunk store.
pub struct ChunkedDevice {
    config: EngineConfig,
    store: Arc<dyn RemoteChunkStore>,
    shared: Arc<FlushShared>,
    queue: Arc<FlushQueue>,
    inflight: Arc<InflightRegistry>,
    fenced: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    window: ChunkWindow,
    volume: Option<Arc<str>>,
    offset: u64,
    end_of_media: bool,
    workers: Vec<thread::JoinHandle<()>>,
    workers_started: bool,
}

impl std::fmt::Debug for ChunkedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDevice")
            .field("config", &self.config)
            .field("offset", &self.offset)
            .field("end_of_media", &self.end_of_media)
            .field("workers_started", &self.workers_started)
            .finish_non_exhaustive()
    }
}

impl ChunkedDevice {
    #[must_use]
    pub fn new(config: EngineConfig, store: Arc<dyn RemoteChunkStore>) -> Self {
        let slots = if config.io_slots > 0 {
            config.io_slots
        } else {
            DEFAULT_QUEUE_SLOTS
        };
        let capacity = usize::from(config.io_threads) * usize::from(slots);
        let queue = Arc::new(FlushQueue::new(capacity.max(1)));
        let inflight = Arc::new(InflightRegistry::new());
        let fenced = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(EngineStats::default());
        let shared = Arc::new(FlushShared {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            inflight: Arc::clone(&inflight),
            fenced: Arc::clone(&fenced),
            retries: config.retries,
            recheck_interval: config.recheck_interval,
            stats: Arc::clone(&stats),
        });
        let window = ChunkWindow::new(config.chunk_size as usize);

        Self {
            config,
            store,
            shared,
            queue,
            inflight,
            fenced,
            stats,
            window,
            volume: None,
            offset: 0,
            end_of_media: false,
            workers: Vec::new(),
            workers_started: false,
        }
    }

    /// Open a volume for reading or writing.
    ///
    /// Fails with [`Error::Fenced`] when writing is requested on a
    /// device that went read-only after exhausted upload retries.
    pub fn open(&mut self, volume: &str, mode: OpenMode) -> Result<()> {
        let writing = mode == OpenMode::ReadWrite;
        if writing && self.is_fenced() {
            return Err(Error::Fenced);
        }

        self.window.open(writing);
        self.offset = 0;
        self.end_of_media = false;
        self.volume = Some(Arc::from(volume));
        debug!(volume, ?mode, "volume opened");
        Ok(())
    }

    /// Read from the current offset. Returns 0 once past the last chunk
    /// (end of media, sticky until reopen).
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        self.require_open()?;
        if self.end_of_media || dest.is_empty() {
            return Ok(0);
        }

        if !self.window.is_setup() && !self.ensure_loaded(self.offset)? {
            self.end_of_media = true;
            return Ok(0);
        }

        let mut copied = 0;
        while copied < dest.len() {
            if !self.window.contains(self.offset)
                && (self.offset >= self.max_volume_size() || !self.ensure_loaded(self.offset)?)
            {
                self.end_of_media = true;
                break;
            }

            let within = (self.offset - self.window.start_offset()) as usize;
            let n = self.window.read_at(within, &mut dest[copied..]);
            if n > 0 {
                trace!(n, within, "reading from chunk buffer");
                self.offset += n as u64;
                copied += n;
                continue;
            }

            // Nothing left in this chunk; the volume continues, if at
            // all, in the next one.
            let next = self.window.start_offset() + self.config.chunk_size;
            if next >= self.max_volume_size() || !self.ensure_loaded(next)? {
                self.end_of_media = true;
                break;
            }
            self.offset = next;
        }
        Ok(copied)
    }

    /// Write at the current offset, flushing and advancing the window
    /// at every chunk boundary.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.require_open()?;
        if self.is_fenced() {
            return Err(Error::Fenced);
        }
        if !self.window.is_writing() {
            return Err(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let max = self.max_volume_size();
        if self.offset + data.len() as u64 > max {
            return Err(Error::VolumeFull { max_bytes: max });
        }

        if !self.window.is_setup() {
            // First write to a fresh volume: declare an empty chunk 0.
            self.window.position(0);
            self.window.mark_setup();
        }
        if !self.window.contains(self.offset) {
            // A chunk missing on the backing store is fine for writers,
            // the window is then a fresh chunk.
            self.ensure_loaded(self.offset)?;
        }

        let mut written = 0;
        while written < data.len() {
            let within = (self.offset - self.window.start_offset()) as usize;
            let room = self.config.chunk_size as usize - within;
            let n = room.min(data.len() - written);
            trace!(n, within, "writing into chunk buffer");
            self.window.write_at(within, &data[written..written + n]);
            self.offset += n as u64;
            written += n;

            if written < data.len() {
                // Crossed the window end: hand the chunk off, move on.
                self.flush_window(true, true)?;
            }
        }
        Ok(written)
    }

    /// Reposition the volume offset and load the matching chunk.
    /// Seeking relative to the end queries the volume size first.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.require_open()?;
        let new_offset = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta).ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seek before start of volume",
                ))
            })?,
            SeekFrom::End(delta) => {
                let size = self.volume_size()?;
                size.checked_add_signed(delta).ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before start of volume",
                    ))
                })?
            }
        };

        self.offset = new_offset;
        self.ensure_loaded(new_offset)?;
        Ok(new_offset)
    }

    /// Remove every chunk blob of the volume and reinitialize the
    /// window as a fresh chunk 0. `volume` is passed anew because the
    /// caller may have relabelled it since open. Blobs not named like
    /// chunks are preserved.
    pub fn truncate(&mut self, volume: &str) -> Result<()> {
        self.require_open()?;
        debug!(volume, "truncating chunked volume");

        let listing = self.store.list_chunks(volume)?;
        for name in listing.keys().filter(|name| is_chunk_name(name)) {
            self.store.remove_chunk(volume, name)?;
        }

        self.volume = Some(Arc::from(volume));
        self.window.reset_to_start();
        Ok(())
    }

    /// Wait until every pending flush request has been processed:
    /// uploaded, or taken off the queue by fencing.
    pub fn flush(&mut self) -> Result<()> {
        let Some(volume) = self.volume.clone() else {
            return Ok(());
        };
        if self.config.io_threads == 0 {
            return Ok(());
        }

        debug!(volume = %volume, "waiting until pending chunks are written");
        while !self.queue.is_idle() || self.inflight.count_for(&volume) > 0 {
            thread::sleep(FLUSH_POLL_INTERVAL);
        }
        Ok(())
    }

    /// Close the volume, handing a dirty window off for flushing. The
    /// workers keep running; they are bound to the device, not the
    /// volume.
    pub fn close(&mut self) -> Result<()> {
        self.require_open()?;
        let result = if self.window.is_dirty() {
            self.flush_window(true, false)
        } else {
            Ok(())
        };
        self.window.close();
        debug!("volume closed");
        result
    }

    /// The logical size of the current volume.
    ///
    /// Three sources of truth are reconciled: the flush queue holds the
    /// most recent un-flushed state; an inflight chunk is about to
    /// reappear on one side or the other; only when both are clear can
    /// the backend listing be trusted as complete.
    pub fn volume_size(&mut self) -> Result<u64> {
        let volume = self.require_volume()?.clone();

        if self.config.io_threads > 0 {
            loop {
                if !self.queue.is_empty() {
                    if let Some((chunk, len)) = self.queue.last_for_volume(&volume) {
                        return Ok(u64::from(chunk) * self.config.chunk_size + len);
                    }
                }
                if self.inflight.count_for(&volume) > 0 {
                    if self.wait_while(|| self.inflight.count_for(&volume) > 0) {
                        // Re-examine the queue: the chunk either got
                        // uploaded or was put back for retry.
                        continue;
                    }
                    self.inflight.clear_volume(&volume);
                    break;
                }
                break;
            }
        }

        self.remote_volume_size(&volume)
    }

    /// Probe the backing store, at most once per setup.
    pub fn check_connection(&self) -> Result<()> {
        self.store.check_connection()
    }

    /// Raw blob listing of a volume on the backing store.
    pub fn list_chunks(&self, volume: &str) -> Result<BTreeMap<String, u64>> {
        self.store.list_chunks(volume)
    }

    /// Has the device gone read-only after exhausted upload retries?
    #[must_use]
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    /// Pending flush requests, oldest first, for status reporting.
    #[must_use]
    pub fn pending_flushes(&self) -> Vec<PendingFlush> {
        self.queue.pending()
    }

    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    /// Largest offset any chunk of a volume can cover.
    #[must_use]
    pub fn max_volume_size(&self) -> u64 {
        u64::from(MAX_CHUNKS) * self.config.chunk_size
    }

    fn require_open(&self) -> Result<()> {
        if self.window.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn require_volume(&self) -> Result<&Arc<str>> {
        self.volume.as_ref().ok_or(Error::NotOpen)
    }

    /// Make sure the window holds the chunk containing `offset`,
    /// flushing a dirty window first.
    ///
    /// Returns `false` when the chunk exists nowhere yet; the window is
    /// then positioned and empty, which is end-of-media for readers and
    /// a fresh chunk for writers.
    fn ensure_loaded(&mut self, offset: u64) -> Result<bool> {
        if offset >= self.max_volume_size() {
            return Ok(false);
        }
        let target = offset / self.config.chunk_size * self.config.chunk_size;
        if self.window.is_setup() && self.window.start_offset() == target {
            return Ok(true);
        }

        if self.window.is_dirty() {
            self.flush_window(true, false)?;
        }
        self.window.position(target);

        let volume = self.require_volume()?.clone();
        let chunk = self.window.chunk_index();

        if self.config.io_threads > 0 {
            loop {
                if !self.queue.is_empty() {
                    // A pending flush request holds newer data than the
                    // backing store; clone it instead of fetching.
                    if let Some(n) = self.queue.clone_chunk(&volume, chunk, self.window.buffer_mut())
                    {
                        trace!(volume = %volume, chunk, len = n, "cloned chunk from flush queue");
                        self.window.set_fill(n);
                        self.window.mark_setup();
                        self.stats.queue_clones.fetch_add(1, Ordering::Relaxed);
                        return Ok(true);
                    }
                }
                if self.inflight.is_inflight(&volume, chunk) {
                    if self.wait_while(|| self.inflight.is_inflight(&volume, chunk)) {
                        // Uploaded, or back on the queue; look again.
                        continue;
                    }
                    self.inflight.clear(&volume, chunk);
                    break;
                }
                break;
            }
        }

        match self.fetch_current_chunk() {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                self.window.set_fill(0);
                self.window.mark_setup();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the window's chunk from the backing store.
    fn fetch_current_chunk(&mut self) -> Result<()> {
        let volume = self.require_volume()?.clone();
        let chunk = self.window.chunk_index();

        let stat = self.store.stat_chunk(&volume, chunk)?;
        if stat.size > self.config.chunk_size {
            return Err(Error::SizeMismatch {
                expected: stat.size,
                actual: self.config.chunk_size,
            });
        }

        let size = stat.size as usize;
        let n = self
            .store
            .get_chunk(&volume, chunk, &mut self.window.buffer_mut()[..size])?;
        self.window.set_fill(n);
        self.window.mark_setup();
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_downloaded
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Hand the window's chunk off for flushing.
    ///
    /// With io-threads the request goes onto the queue; `release` then
    /// moves the buffer into the request and a fresh one is allocated
    /// on the next touch. Without io-threads the chunk gets one
    /// synchronous upload attempt and errors surface to the caller.
    fn flush_window(&mut self, release: bool, advance: bool) -> Result<()> {
        let volume = self.require_volume()?.clone();
        let chunk = self.window.chunk_index();
        let fill = self.window.fill();

        let payload = if release && self.config.io_threads > 0 {
            let mut buf = self.window.take_buffer();
            buf.truncate(fill);
            Bytes::from(buf)
        } else {
            Bytes::copy_from_slice(&self.window.data()[..fill])
        };
        let request = FlushRequest::new(volume, chunk, payload);

        let result = if self.config.io_threads > 0 {
            self.start_io_threads()?;
            match self.queue.enqueue(request, false, false) {
                Ok(Enqueued::Merged) => {
                    self.stats.queue_merges.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Ok(Enqueued::Queued) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            worker::flush_remote_chunk(&self.shared, &request)
        };

        self.window.clear_dirty();
        if advance {
            self.window.advance();
        }
        result
    }

    /// Start the upload workers on first use.
    fn start_io_threads(&mut self) -> Result<()> {
        if self.workers_started {
            return Ok(());
        }
        for n in 0..self.config.io_threads {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("chunkio-io-{n}"))
                .spawn(move || worker::worker_loop(&shared))?;
            self.workers.push(handle);
        }
        self.workers_started = true;
        debug!(count = self.config.io_threads, "started io-threads");
        Ok(())
    }

    /// Busy-wait while `cond` holds, bounded by the inflight retry
    /// budget. Returns `false` when the budget ran out.
    fn wait_while(&self, cond: impl Fn() -> bool) -> bool {
        let mut retries = self.config.inflight_retries;
        while cond() {
            if retries == 0 {
                return false;
            }
            retries -= 1;
            thread::sleep(self.config.inflight_retry_delay);
        }
        true
    }

    fn remote_volume_size(&self, volume: &str) -> Result<u64> {
        let listing = self.store.list_chunks(volume)?;
        if listing.is_empty() {
            return Err(Error::volume_not_found(volume));
        }
        Ok(listing
            .iter()
            .filter(|(name, _)| is_chunk_name(name))
            .map(|(_, size)| size)
            .sum())
    }
}

impl Drop for ChunkedDevice {
    fn drop(&mut self) {
        // Wake the workers with the flush sentinel and wait them out;
        // whatever is still queued is dropped with the queue.
        self.queue.flush();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
