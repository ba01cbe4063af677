use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::events::Events;
use crate::session::progress::ChunkProgress;
use crate::storage::ChunkStorage;

/// One contiguous byte range of the remote resource.
///
/// A chunk is logically owned by at most one worker from `Queued` until
/// `Finished`; the merger then owns it until its storage is released.
/// Progress and byte counters are atomics so the registry, the status
/// display and the control writer can scan without locking workers out.
pub struct Chunk {
    pub idx: usize,
    pub size: u64,
    pub range_start: u64,
    pub range_end: u64,
    /// FTP servers under `--allow-ftp-segments` report whole-file sizes
    /// for ranged requests; skip the strict transfer-size check for them.
    pub unsafe_range_size_check: bool,
    progress: AtomicU8,
    size_complete: AtomicU64,
    curr_range_start: AtomicU64,
    pub from_mirror: AtomicBool,
    pub storage: Mutex<ChunkStorage>,
}

impl Chunk {
    pub fn new(
        idx: usize,
        size: u64,
        range_start: u64,
        range_end: u64,
        unsafe_range_size_check: bool,
    ) -> Self {
        Self {
            idx,
            size,
            range_start,
            range_end,
            unsafe_range_size_check,
            progress: AtomicU8::new(ChunkProgress::NotStarted as u8),
            size_complete: AtomicU64::new(0),
            curr_range_start: AtomicU64::new(range_start),
            from_mirror: AtomicBool::new(false),
            storage: Mutex::new(ChunkStorage::Unprepared),
        }
    }

    pub fn progress(&self) -> ChunkProgress {
        // The store is Release-ordered; whoever observed a wakeup sees it.
        ChunkProgress::from_u8(self.progress.load(Ordering::Acquire))
            .expect("progress atomic only ever holds valid states")
    }

    pub(crate) fn store_progress(&self, progress: ChunkProgress) {
        self.progress.store(progress as u8, Ordering::Release);
    }

    pub fn size_complete(&self) -> u64 {
        self.size_complete.load(Ordering::Relaxed)
    }

    pub fn set_size_complete(&self, value: u64) {
        debug_assert!(value <= self.size || self.size == 0);
        self.size_complete.store(value, Ordering::Relaxed);
    }

    pub fn add_size_complete(&self, delta: u64) -> u64 {
        self.size_complete.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn curr_range_start(&self) -> u64 {
        self.curr_range_start.load(Ordering::Relaxed)
    }

    /// Recomputed whenever a retry rewinds the chunk; the strict
    /// transfer-size check is relative to this offset.
    pub fn set_curr_range_start(&self, value: u64) {
        self.curr_range_start.store(value, Ordering::Relaxed)
    }
}

/// Writes the new state, then queues wakeups on the events that react to
/// chunk transitions. The Release store plus the slot mutexes inside
/// `queue_wake` guarantee a callback re-reading the chunk observes the new
/// state.
pub fn set_chunk_progress(chunk: &Chunk, progress: ChunkProgress, events: &Events) {
    chunk.store_progress(progress);
    events.queue_wake(&events.queue);
    events.queue_wake(&events.merge);
    events.queue_wake(&events.ctrl);
    events.queue_wake(&events.status);
}

pub fn set_chunk_merged(chunk: &Chunk, events: &Events) {
    chunk.set_size_complete(chunk.size);
    set_chunk_progress(chunk, ChunkProgress::Merged, events);
}

/// Lays out the chunk array for a sized download. The last chunk absorbs
/// the remainder; in single mode there is exactly one chunk spanning the
/// whole file.
pub fn chunks_init(
    chunk_count: usize,
    chunk_size: u64,
    rem_size: u64,
    file_size: u64,
    unsafe_range_size_check: bool,
) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(chunk_count);

    for idx in 0..chunk_count {
        let range_start = idx as u64 * chunk_size;
        let mut size = chunk_size;
        let mut range_end = (idx as u64 + 1) * chunk_size - 1;

        if idx == chunk_count - 1 && rem_size != 0 {
            size = rem_size;
            range_end = file_size.saturating_sub(1);
        }

        chunks.push(Chunk::new(idx, size, range_start, range_end, unsafe_range_size_check));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_init_even_split() {
        let chunks = chunks_init(4, 1024, 0, 4096, false);
        assert_eq!(chunks.len(), 4);
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.idx, idx);
            assert_eq!(chunk.size, 1024);
            assert_eq!(chunk.range_start, idx as u64 * 1024);
            assert_eq!(chunk.range_end, idx as u64 * 1024 + 1023);
            assert_eq!(chunk.curr_range_start(), chunk.range_start);
        }
    }

    #[test]
    fn test_chunks_init_remainder_shrinks_last() {
        let chunks = chunks_init(5, 1_048_576, 300_000, 4 * 1_048_576 + 300_000, false);
        let last = chunks.last().unwrap();
        assert_eq!(last.size, 300_000);
        assert_eq!(last.range_end, 4 * 1_048_576 + 300_000 - 1);
        assert_eq!(chunks[3].range_end + 1, last.range_start);
    }

    #[test]
    fn test_set_progress_queues_wakeups() {
        let events = Events::new();
        let chunk = Chunk::new(0, 100, 0, 99, false);

        set_chunk_progress(&chunk, ChunkProgress::Started, &events);
        assert_eq!(chunk.progress(), ChunkProgress::Started);

        set_chunk_merged(&chunk, &events);
        assert_eq!(chunk.progress(), ChunkProgress::Merged);
        assert_eq!(chunk.size_complete(), 100);
    }
}
