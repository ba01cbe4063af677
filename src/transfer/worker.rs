//! Worker threads: each drives one chunk through a ranged transfer,
//! absorbing transient failures with exponential backoff. Workers are
//! detached; completion is published through the chunk states.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::{RequestBuilder, Response};
use tracing::{info, warn};

use crate::session::chunk::{Chunk, set_chunk_progress};
use crate::session::progress::ChunkProgress;
use crate::session::{Session, SessionStatus, WorkerSlot};
use crate::status;
use crate::storage::{reset_storage, write_to_storage};
use crate::transfer::error::{ErrorClass, TransferError, classify_status};
use crate::transfer::probe::MAX_SEMI_FATAL_RETRIES;

/// Abort a read that produces nothing for this long.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff ladder: 1,2,4,...,32s, then wrap back to 1s.
const INIT_DELAY: u64 = 1;
const MAX_DELAY: u64 = 32;

enum Outcome {
    Done,
    /// The session was interrupted mid-retry; the chunk stays `Started`.
    Abandoned,
}

/// Spawns the detached thread driving `chunk_idx` on worker `worker_idx`.
pub fn spawn_worker(
    session: &Arc<Session>,
    worker_idx: usize,
    chunk_idx: usize,
) -> std::io::Result<()> {
    let session = session.clone();
    std::thread::Builder::new()
        .name(format!("worker-{worker_idx}"))
        .spawn(move || {
            let chunk = &session.chunks[chunk_idx];
            set_chunk_progress(chunk, ChunkProgress::Started, &session.events);

            match perform(&session, worker_idx, chunk) {
                Ok(Outcome::Done) => {
                    set_chunk_progress(chunk, ChunkProgress::Finished, &session.events);
                }
                Ok(Outcome::Abandoned) => {}
                Err(message) => session.record_fatal(message),
            }
        })?;
    Ok(())
}

/// Runs the transfer until the chunk completes, classifying every failure
/// into retry-in-place, bounded semi-fatal retry, or abort.
fn perform(
    session: &Session,
    worker_idx: usize,
    chunk: &Chunk,
) -> std::result::Result<Outcome, String> {
    let worker = &session.workers[worker_idx];
    let mut retries: u64 = 0;
    let mut semi_fatal_retries: u32 = 0;
    let mut delay = INIT_DELAY;

    loop {
        match attempt(session, worker, chunk) {
            Ok(()) => {
                let size_complete = chunk.size_complete();

                if chunk.size == 0 {
                    // Size unknown; the stream end is all we have.
                    return Ok(Outcome::Done);
                }
                if size_complete == chunk.size {
                    return Ok(Outcome::Done);
                }
                if size_complete == 0 {
                    retries += 1;
                    info!(
                        "the stream for chunk {} ended before any data arrived, \
                         restarting (retry {retries}, delay={delay})",
                        chunk.idx
                    );
                } else if worker.single {
                    warn!(
                        "completed size({size_complete}) != requested size({}), \
                         trusting the transfer in single mode",
                        chunk.size
                    );
                    return Ok(Outcome::Done);
                } else {
                    return Err(format!(
                        "chunk {}: completed size({size_complete}) != requested size({})",
                        chunk.idx, chunk.size
                    ));
                }
            }
            Err(e) => match e.class {
                ErrorClass::Fatal => return Err(e.message),
                ErrorClass::SemiFatal => {
                    semi_fatal_retries += 1;
                    retries += 1;
                    if semi_fatal_retries > MAX_SEMI_FATAL_RETRIES {
                        return Err(format!(
                            "semi-fatal error while downloading chunk {}, \
                             max retries {MAX_SEMI_FATAL_RETRIES} exceeded: {e}",
                            chunk.idx
                        ));
                    }
                    warn!(
                        "semi-fatal ({e}) while downloading chunk {}, retry \
                         {semi_fatal_retries}/{MAX_SEMI_FATAL_RETRIES}, delay={delay}",
                        chunk.idx
                    );
                }
                ErrorClass::Retryable => {
                    retries += 1;
                    info!(
                        "({e}) while downloading chunk {}, restarting \
                         (retry {retries}, delay={delay})",
                        chunk.idx
                    );
                }
            },
        }

        if session.status() == SessionStatus::Interrupted {
            return Ok(Outcome::Abandoned);
        }

        std::thread::sleep(Duration::from_secs(delay));
        reset_storage(session, chunk).map_err(|e| e.to_string())?;

        delay *= 2;
        if delay > MAX_DELAY {
            delay = INIT_DELAY;
        }
    }
}

/// One request + stream cycle.
fn attempt(session: &Session, worker: &WorkerSlot, chunk: &Chunk) -> Result<(), TransferError> {
    let request = build_request(session, worker, chunk);

    session.handle.block_on(async {
        let response = request.send().await.map_err(TransferError::from)?;
        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            return Err(TransferError {
                class: classify_status(status),
                message: format!("HTTP error {status} for chunk {}", chunk.idx),
            });
        }

        let dltotal = response.content_length();

        if worker.single {
            // Learn the file size from the transfer when probing left it
            // unknown (or it came from a previous transfer's estimate).
            if let Some(total) = dltotal {
                if session.file_size() == 0
                    || session.file_size_from_dltotal.load(Ordering::SeqCst)
                {
                    session.set_file_size(chunk.curr_range_start() + total);
                    session.file_size_from_dltotal.store(true, Ordering::SeqCst);
                }
            }
        } else if let Some(total) = dltotal {
            let expected = chunk.range_end - chunk.curr_range_start() + 1;
            if total != expected && !chunk.unsafe_range_size_check {
                return Err(TransferError::fatal(format!(
                    "transfer size({total}) does not match requested range({}-{}) \
                     in chunk {}, this is a sign of a bad server, \
                     retry with a single connection",
                    chunk.curr_range_start(),
                    chunk.range_end,
                    chunk.idx
                )));
            }
        }

        stream_body(session, worker, chunk, response).await
    })
}

fn build_request(session: &Session, worker: &WorkerSlot, chunk: &Chunk) -> RequestBuilder {
    let params = &session.params;

    let url: &str = if worker.use_mirror {
        params.mirror_url.as_deref().unwrap_or(&params.start_url)
    } else {
        &params.start_url
    };

    let mut request = if let Some(post) = &params.post {
        session
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(post.clone())
    } else if let Some(raw_post) = &params.raw_post {
        session.client.post(url).body(raw_post.clone())
    } else {
        session.client.get(url)
    };

    // Single mode sends no range on a fresh start so naive servers that
    // report zero sizes still respond; with a resume offset (or after a
    // mid-transfer restart) the range is open-ended from that offset.
    let range = if worker.single {
        let offset = chunk.curr_range_start();
        (offset > 0 || params.resume).then(|| format!("bytes={offset}-"))
    } else {
        Some(format!(
            "bytes={}-{}",
            chunk.curr_range_start(),
            chunk.range_end
        ))
    };
    if let Some(range) = range {
        request = request.header(reqwest::header::RANGE, range);
    }

    request
}

async fn stream_body(
    session: &Session,
    worker: &WorkerSlot,
    chunk: &Chunk,
    mut response: Response,
) -> Result<(), TransferError> {
    let params = &session.params;
    let stall = (!params.no_timeouts).then_some(STALL_TIMEOUT);
    let pace_start = Instant::now();
    let mut paced_bytes: u64 = 0;

    loop {
        let next: Option<Bytes> = match stall {
            Some(window) => match tokio::time::timeout(window, response.chunk()).await {
                Ok(read) => read.map_err(TransferError::from)?,
                Err(_) => return Err(TransferError::stalled(window)),
            },
            None => response.chunk().await.map_err(TransferError::from)?,
        };

        let Some(data) = next else {
            return Ok(());
        };

        write_to_storage(session, chunk, &data)
            .map_err(|e| TransferError::fatal(e.to_string()))?;
        chunk.add_size_complete(data.len() as u64);

        if worker.single {
            status::single_progress(session);
        }

        if params.connection_max_rate > 0 {
            paced_bytes += data.len() as u64;
            let expected = Duration::from_secs_f64(
                paced_bytes as f64 / params.connection_max_rate as f64,
            );
            let elapsed = pace_start.elapsed();
            if elapsed < expected {
                tokio::time::sleep(expected - elapsed).await;
            }
        }
    }
}
