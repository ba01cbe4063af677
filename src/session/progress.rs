use std::time::Instant;

use crate::session::chunk::Chunk;

/// Per-chunk lifecycle. Normal flow only moves forward; a retrying worker
/// stays in `Started` while it rewinds `size_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChunkProgress {
    NotStarted = 0,
    Queued = 1,
    Started = 2,
    Finished = 3,
    Merged = 4,
}

impl ChunkProgress {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Queued),
            2 => Some(Self::Started),
            3 => Some(Self::Finished),
            4 => Some(Self::Merged),
            _ => None,
        }
    }

    /// Digit encoding used in the control file and the status bar.
    pub fn as_char(self) -> char {
        (b'0' + self as u8) as char
    }

    pub fn from_char(c: char) -> Option<Self> {
        c.to_digit(10).and_then(|d| Self::from_u8(d as u8))
    }
}

/// True iff any chunk's progress equals (`matching`) / differs from
/// (`!matching`) `prg`. Scans backwards; late chunks settle last, so
/// mismatches show up sooner from the tail.
pub fn exist_progress(chunks: &[Chunk], prg: ChunkProgress, matching: bool) -> bool {
    chunks
        .iter()
        .rev()
        .any(|c| (c.progress() == prg) == matching)
}

/// First matching chunk in `[start, end]` (inclusive).
pub fn first_progress_in_range(
    chunks: &[Chunk],
    prg: ChunkProgress,
    matching: bool,
    start: usize,
    end: usize,
) -> Option<&Chunk> {
    debug_assert!(end >= start && end < chunks.len());
    chunks[start..=end]
        .iter()
        .find(|c| (c.progress() == prg) == matching)
}

/// Last matching chunk in `[start, end]` (inclusive).
pub fn last_progress_in_range(
    chunks: &[Chunk],
    prg: ChunkProgress,
    matching: bool,
    start: usize,
    end: usize,
) -> Option<&Chunk> {
    debug_assert!(end >= start && end < chunks.len());
    chunks[start..=end]
        .iter()
        .rev()
        .find(|c| (c.progress() == prg) == matching)
}

pub fn first_progress(chunks: &[Chunk], prg: ChunkProgress, matching: bool) -> Option<&Chunk> {
    if chunks.is_empty() {
        return None;
    }
    first_progress_in_range(chunks, prg, matching, 0, chunks.len() - 1)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkCounts {
    pub merged: usize,
    pub finished: usize,
    pub started: usize,
    pub empty_started: usize,
    pub queued: usize,
    pub not_started: usize,
}

/// Session-wide byte and timing counters behind the status display.
#[derive(Debug)]
pub struct GlobalProgress {
    pub start: Instant,
    pub prev: Instant,
    pub dur: f64,
    pub curr_dur: f64,
    pub rem: f64,
    pub curr_rem: f64,
    pub dlprev: u64,
    pub complete_size: u64,
    /// Bytes already on disk when the session started (resume).
    pub initial_complete_size: u64,
    pub rate: f64,
    pub curr_rate: f64,
    pub counts: ChunkCounts,
    /// Whether the display block has reserved its terminal lines yet.
    pub primed: bool,
}

impl GlobalProgress {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            prev: now,
            dur: 0.0,
            curr_dur: 0.0,
            rem: f64::INFINITY,
            curr_rem: f64::INFINITY,
            dlprev: 0,
            complete_size: 0,
            initial_complete_size: 0,
            rate: 0.0,
            curr_rate: 0.0,
            counts: ChunkCounts::default(),
            primed: false,
        }
    }

    /// Recomputes counts and the aggregate complete size from a consistent
    /// per-chunk snapshot. `init` seeds the resume baselines.
    pub fn update(&mut self, chunks: &[Chunk], init: bool) {
        let mut counts = ChunkCounts::default();
        let mut total_complete: u64 = 0;

        for chunk in chunks {
            // One read each so progress and size agree for this row.
            let progress = chunk.progress();
            let size_complete = chunk.size_complete();
            total_complete += size_complete;

            match progress {
                ChunkProgress::Merged => counts.merged += 1,
                ChunkProgress::Finished | ChunkProgress::Started => {
                    if progress == ChunkProgress::Finished {
                        counts.finished += 1;
                    }
                    counts.started += 1;
                    if size_complete == 0 {
                        counts.empty_started += 1;
                    }
                }
                ChunkProgress::Queued | ChunkProgress::NotStarted => {
                    if progress == ChunkProgress::Queued {
                        counts.queued += 1;
                    }
                    counts.not_started += 1;
                }
            }
        }

        self.complete_size = total_complete;
        self.counts = counts;

        if init {
            self.initial_complete_size = self.complete_size;
            self.dlprev = self.complete_size;
        }
    }
}

impl Default for GlobalProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::chunk::Chunk;

    fn chunks_with(states: &[ChunkProgress]) -> Vec<Chunk> {
        states
            .iter()
            .enumerate()
            .map(|(idx, &prg)| {
                let chunk = Chunk::new(idx, 100, idx as u64 * 100, idx as u64 * 100 + 99, false);
                chunk.store_progress(prg);
                chunk
            })
            .collect()
    }

    #[test]
    fn test_progress_char_roundtrip() {
        for prg in [
            ChunkProgress::NotStarted,
            ChunkProgress::Queued,
            ChunkProgress::Started,
            ChunkProgress::Finished,
            ChunkProgress::Merged,
        ] {
            assert_eq!(ChunkProgress::from_char(prg.as_char()), Some(prg));
        }
        assert_eq!(ChunkProgress::from_char('7'), None);
        assert_eq!(ChunkProgress::from_char('x'), None);
    }

    #[test]
    fn test_exist_progress_matching() {
        use ChunkProgress::*;
        let chunks = chunks_with(&[Merged, Merged, Started]);
        assert!(exist_progress(&chunks, Started, true));
        assert!(!exist_progress(&chunks, Finished, true));
        // "any chunk not yet merged"
        assert!(exist_progress(&chunks, Merged, false));

        let done = chunks_with(&[Merged, Merged]);
        assert!(!exist_progress(&done, Merged, false));
    }

    #[test]
    fn test_first_progress_in_range_picks_earliest() {
        use ChunkProgress::*;
        let chunks = chunks_with(&[Merged, NotStarted, NotStarted, Started]);
        let first = first_progress(&chunks, NotStarted, true).unwrap();
        assert_eq!(first.idx, 1);

        let suffix = first_progress_in_range(&chunks, NotStarted, true, 2, 3).unwrap();
        assert_eq!(suffix.idx, 2);
        assert!(first_progress_in_range(&chunks, Queued, true, 0, 3).is_none());
    }

    #[test]
    fn test_last_progress_in_range() {
        use ChunkProgress::*;
        let chunks = chunks_with(&[NotStarted, NotStarted, Merged]);
        let last = last_progress_in_range(&chunks, NotStarted, true, 0, 2).unwrap();
        assert_eq!(last.idx, 1);
    }

    #[test]
    fn test_global_progress_counts() {
        use ChunkProgress::*;
        let chunks = chunks_with(&[Merged, Finished, Started, Queued, NotStarted]);
        chunks[1].set_size_complete(100);
        chunks[2].set_size_complete(40);

        let mut progress = GlobalProgress::new();
        progress.update(&chunks, true);

        assert_eq!(progress.counts.merged, 1);
        assert_eq!(progress.counts.finished, 1);
        // finished chunks count into started, queued into not_started
        assert_eq!(progress.counts.started, 2);
        assert_eq!(progress.counts.queued, 1);
        assert_eq!(progress.counts.not_started, 2);
        assert_eq!(progress.counts.empty_started, 0);
        assert_eq!(progress.complete_size, 140);
        assert_eq!(progress.initial_complete_size, 140);
    }
}
