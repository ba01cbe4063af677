//! The scheduler: keeps every free connection bound to the next chunk
//! worth downloading.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::session::chunk::{Chunk, set_chunk_progress};
use crate::session::progress::{
    ChunkProgress, exist_progress, first_progress, first_progress_in_range,
};
use crate::session::{Session, SessionStatus};
use crate::storage::prepare_storage;
use crate::transfer::worker::spawn_worker;

/// How many chunks the `--last-size-first` suffix spans.
fn last_chunk_count_from_last_size(session: &Session) -> usize {
    let mut last_size = session.params.last_size_first;

    if last_size >= session.file_size() {
        warn!("last_size_first >= file_size, disabled");
        last_size = 0;
    }

    if last_size <= session.rem_size {
        return usize::from(last_size > 0);
    }

    let chunk_size = session.params.chunk_size;
    let beyond_rem = last_size - session.rem_size;
    (beyond_rem / chunk_size) as usize
        + usize::from(beyond_rem % chunk_size > 0)
        + usize::from(session.rem_size > 0)
}

/// The `--last-*-first` suffix pick, when either bias is configured.
fn pick_next_last_first(session: &Session) -> Option<&Chunk> {
    let params = &session.params;
    if params.last_size_first == 0 && params.last_chunks_first == 0 {
        return None;
    }

    let end_idx = session.chunk_count - 1;
    let last_first = if params.last_size_first > 0 {
        last_chunk_count_from_last_size(session)
    } else if session.rem_size > 0 {
        // The final chunk is smaller, so it doesn't count against N.
        (params.last_chunks_first + 1).min(end_idx)
    } else {
        params.last_chunks_first.min(end_idx)
    };

    let start_idx = if last_first > 0 { session.chunk_count - last_first } else { 0 };
    debug!("last-first suffix: [{start_idx}, {end_idx}]");

    first_progress_in_range(&session.chunks, ChunkProgress::NotStarted, true, start_idx, end_idx)
}

fn pick_next_random(session: &Session) -> Option<&Chunk> {
    let not_started: Vec<&Chunk> = session
        .chunks
        .iter()
        .filter(|c| c.progress() == ChunkProgress::NotStarted)
        .collect();
    if not_started.is_empty() {
        return None;
    }
    let pick = rand::thread_rng().gen_range(0..not_started.len());
    Some(not_started[pick])
}

fn pick_next(session: &Session) -> Option<&Chunk> {
    if let Some(chunk) = pick_next_last_first(session) {
        return Some(chunk);
    }
    if session.params.random_order {
        if let Some(chunk) = pick_next_random(session) {
            return Some(chunk);
        }
    }
    first_progress(&session.chunks, ChunkProgress::NotStarted, true)
}

/// Binds the next chunk to `worker_idx` and launches its transfer thread.
/// `first_round` distinguishes the initial fill, which must find a chunk.
pub fn queue_next_chunk(session: &Arc<Session>, worker_idx: usize, first_round: bool) -> Result<()> {
    let Some(chunk_idx) = pick_next(session).map(|c| c.idx) else {
        debug_assert!(!first_round, "initial fill guarantees a chunk per connection");
        return Ok(());
    };

    let worker = &session.workers[worker_idx];
    let chunk = &session.chunks[chunk_idx];

    prepare_storage(session, chunk)?;

    // Ranges are based on whatever already survived locally.
    chunk.set_curr_range_start(chunk.range_start + chunk.size_complete());
    chunk
        .from_mirror
        .store(worker.use_mirror, std::sync::atomic::Ordering::Relaxed);

    set_chunk_progress(chunk, ChunkProgress::Queued, &session.events);
    *worker.chunk.lock() = Some(chunk_idx);

    spawn_worker(session, worker_idx, chunk_idx)
        .map_err(|e| crate::errors::PargetError::Fatal(format!("spawning worker failed: {e}")))?;
    Ok(())
}

/// One scheduler tick: refill every worker whose chunk is done.
fn queue_tick(session: &Arc<Session>) {
    if session.status() >= SessionStatus::QueueInterrupted
        || !exist_progress(&session.chunks, ChunkProgress::NotStarted, true)
    {
        session.events.queue.deactivate();
    }

    for worker in &session.workers {
        if !exist_progress(&session.chunks, ChunkProgress::NotStarted, true) {
            break;
        }

        let rebind = match *worker.chunk.lock() {
            Some(idx) => session.chunks[idx].progress() >= ChunkProgress::Finished,
            None => false,
        };

        if rebind {
            if let Err(e) = queue_next_chunk(session, worker.idx, false) {
                session.record_fatal(e.to_string());
                return;
            }
        }
    }
}

/// Service thread for the queue event.
pub fn queue_loop(session: Arc<Session>) {
    let ev = &session.events.queue;
    ev.thread_entered();
    ev.init();

    if session.status() < SessionStatus::QueueInterrupted
        && exist_progress(&session.chunks, ChunkProgress::NotStarted, true)
    {
        debug!("start queue event loop");
        let s = &session;
        ev.activate(|| queue_tick(s));
    }

    ev.deinit();
}
