//! The in-memory chunk window
//!
//! One window exists per open volume: the single chunk the device is
//! currently reading from or appending to. The buffer is allocated
//! lazily and handed off wholesale to the flush queue when the window
//! advances past a chunk boundary; a fresh buffer is allocated on the
//! next touch.

/// The byte range `[start_offset, start_offset + chunk_size)` of the
/// volume currently held in memory.
pub(crate) struct ChunkWindow {
    chunk_size: usize,
    /// Lazily allocated; `None` after the buffer moved to the flush
    /// queue.
    buffer: Option<Vec<u8>>,
    /// Valid bytes in `buffer`.
    fill: usize,
    start_offset: u64,
    /// Data was written and not yet handed off for flushing.
    dirty: bool,
    /// The window has been positioned to a definite chunk.
    setup: bool,
    writing: bool,
    opened: bool,
}

impl ChunkWindow {
    pub(crate) fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunk_size,
            buffer: None,
            fill: 0,
            start_offset: 0,
            dirty: false,
            setup: false,
            writing: false,
            opened: false,
        }
    }

    /// Open, or reopen and invalidate.
    pub(crate) fn open(&mut self, writing: bool) {
        if self.opened {
            self.fill = 0;
            self.start_offset = 0;
        }
        self.writing = writing;
        self.opened = true;
        self.setup = false;
        self.dirty = false;
    }

    /// Invalidate on close. The buffer stays allocated for reuse.
    pub(crate) fn close(&mut self) {
        self.writing = false;
        self.opened = false;
        self.setup = false;
        self.dirty = false;
        self.fill = 0;
        self.start_offset = 0;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.opened
    }

    pub(crate) fn is_setup(&self) -> bool {
        self.setup
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.writing
    }

    pub(crate) fn fill(&self) -> usize {
        self.fill
    }

    pub(crate) fn set_fill(&mut self, fill: usize) {
        debug_assert!(fill <= self.chunk_size);
        self.fill = fill;
    }

    pub(crate) fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub(crate) fn end_offset(&self) -> u64 {
        self.start_offset + self.chunk_size as u64 - 1
    }

    pub(crate) fn chunk_index(&self) -> u16 {
        (self.start_offset / self.chunk_size as u64) as u16
    }

    /// Does the loaded chunk cover this volume offset?
    pub(crate) fn contains(&self, offset: u64) -> bool {
        self.setup && self.start_offset <= offset && offset <= self.end_offset()
    }

    /// Point the window at the chunk starting at `start` without
    /// loading anything.
    pub(crate) fn position(&mut self, start: u64) {
        debug_assert_eq!(start % self.chunk_size as u64, 0);
        self.start_offset = start;
        self.fill = 0;
        self.setup = false;
    }

    pub(crate) fn mark_setup(&mut self) {
        self.setup = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Move to the next chunk; the caller has flushed or copied out
    /// whatever it needed.
    pub(crate) fn advance(&mut self) {
        self.start_offset += self.chunk_size as u64;
        self.fill = 0;
    }

    /// Reinitialize as a fresh chunk 0 (volume truncate).
    pub(crate) fn reset_to_start(&mut self) {
        self.start_offset = 0;
        self.fill = 0;
        self.setup = true;
        self.dirty = false;
    }

    /// The valid bytes of the loaded chunk.
    pub(crate) fn data(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    /// The full chunk buffer, allocated on first use.
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.get_or_insert_with(|| vec![0u8; self.chunk_size])
    }

    /// Transfer the buffer out of the window (ownership moves to a
    /// flush request). A fresh zeroed buffer is allocated on the next
    /// `buffer_mut`.
    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        self.buffer
            .take()
            .unwrap_or_else(|| vec![0u8; self.chunk_size])
    }

    /// Copy bytes into the window at a chunk-relative offset.
    pub(crate) fn write_at(&mut self, within: usize, src: &[u8]) {
        debug_assert!(within + src.len() <= self.chunk_size);
        let end = within + src.len();
        self.buffer_mut()[within..end].copy_from_slice(src);
        self.fill = self.fill.max(end);
        self.dirty = true;
        debug_assert!(self.setup && self.fill > 0);
    }

    /// Copy valid bytes out at a chunk-relative offset; returns how
    /// many were available.
    pub(crate) fn read_at(&self, within: usize, dest: &mut [u8]) -> usize {
        let avail = self.fill.saturating_sub(within);
        let n = avail.min(dest.len());
        if n > 0 {
            dest[..n].copy_from_slice(&self.data()[within..within + n]);
        }
        n
    }
}
