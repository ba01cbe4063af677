//! The merger: stitches finished chunk storage into the part file at the
//! right offsets, strictly in index order when the output is a stream.

use std::sync::Arc;

use tracing::debug;

use crate::errors::Result;
use crate::session::chunk::{Chunk, set_chunk_merged};
use crate::session::progress::{ChunkProgress, exist_progress, first_progress, first_progress_in_range};
use crate::session::{Session, SessionStatus};
use crate::storage::{StorageKind, merge_into_output};

/// Merges one finished chunk and releases its storage.
pub fn merge_finished_chunk(session: &Session, chunk: &Chunk) -> Result<()> {
    match session.storage_kind {
        StorageKind::Null => {}
        _ => merge_into_output(session, chunk)?,
    }
    set_chunk_merged(chunk, &session.events);
    Ok(())
}

/// True when `chunk` may merge now. Streams (and `--merge-in-order`) wait
/// until every earlier chunk has merged; files take any finished chunk.
fn may_merge(session: &Session, chunk: &Chunk) -> bool {
    if !session.params.to_stdout && !session.params.merge_in_order {
        return true;
    }
    if chunk.idx == 0 {
        return true;
    }
    first_progress_in_range(&session.chunks, ChunkProgress::Merged, false, 0, chunk.idx - 1)
        .is_none()
}

fn merge_tick(session: &Session) {
    if !exist_progress(&session.chunks, ChunkProgress::Merged, false)
        || session.status() == SessionStatus::Interrupted
    {
        session.events.merge.deactivate();
    }

    while let Some(chunk) = first_progress(&session.chunks, ChunkProgress::Finished, true) {
        if !may_merge(session, chunk) {
            break;
        }
        if let Err(e) = merge_finished_chunk(session, chunk) {
            session.record_fatal(e.to_string());
            return;
        }
    }
}

/// Service thread for the merge event.
pub fn merge_loop(session: Arc<Session>) {
    let ev = &session.events.merge;
    ev.thread_entered();
    ev.init();

    if exist_progress(&session.chunks, ChunkProgress::Merged, false)
        && session.status() != SessionStatus::Interrupted
    {
        debug!("start merge event loop");
        let s = &session;
        ev.activate(|| merge_tick(s));
    }

    ev.deinit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    use crate::session::Output;
    use crate::session::chunk::chunks_init;
    use crate::session::params::DownloadParams;
    use crate::storage::{ChunkStorage, prepare_storage, write_to_storage};

    fn mem_session(chunk_count: usize, chunk_size: u64) -> Session {
        let params = DownloadParams {
            mem_bufs: true,
            chunk_size,
            num_connections: 2,
            ..Default::default()
        };
        let file_size = chunk_size * chunk_count as u64;
        Session::for_tests(
            params,
            chunks_init(chunk_count, chunk_size, 0, file_size, false),
            file_size,
            0,
        )
    }

    fn fill_chunk(session: &Session, idx: usize, byte: u8) {
        let chunk = &session.chunks[idx];
        prepare_storage(session, chunk).unwrap();
        let data = vec![byte; chunk.size as usize];
        write_to_storage(session, chunk, &data).unwrap();
        chunk.set_size_complete(chunk.size);
        chunk.store_progress(ChunkProgress::Finished);
    }

    #[test]
    fn test_merge_writes_at_chunk_offset() {
        let session = mem_session(3, 8);
        let file = tempfile::tempfile().unwrap();
        *session.out.lock() = Output::File(file);

        fill_chunk(&session, 1, 0xBB);
        let chunk = &session.chunks[1];
        merge_finished_chunk(&session, chunk).unwrap();

        assert_eq!(chunk.progress(), ChunkProgress::Merged);
        assert!(matches!(*chunk.storage.lock(), ChunkStorage::Released));

        let mut out = session.out.lock();
        if let Output::File(f) = &mut *out {
            let mut contents = Vec::new();
            f.seek(SeekFrom::Start(0)).unwrap();
            f.read_to_end(&mut contents).unwrap();
            assert_eq!(contents.len(), 16);
            assert!(contents[8..16].iter().all(|&b| b == 0xBB));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_stream_merge_waits_for_order() {
        let mut session = mem_session(4, 4);
        session.params.to_stdout = true;

        // Finish chunks out of order: 2, 1, 3, 0.
        fill_chunk(&session, 2, 2);
        assert!(!may_merge(&session, &session.chunks[2]));

        fill_chunk(&session, 1, 1);
        assert!(!may_merge(&session, &session.chunks[1]));

        fill_chunk(&session, 0, 0);
        assert!(may_merge(&session, &session.chunks[0]));

        // Drain the way the merge tick does and record the emit order.
        let mut emitted = Vec::new();
        while let Some(chunk) = first_progress(&session.chunks, ChunkProgress::Finished, true) {
            if !may_merge(&session, chunk) {
                break;
            }
            emitted.push(chunk.idx);
            chunk.store_progress(ChunkProgress::Merged);
        }
        assert_eq!(emitted, vec![0, 1, 2]);

        fill_chunk(&session, 3, 3);
        assert!(may_merge(&session, &session.chunks[3]));
    }

    #[test]
    fn test_merge_in_order_applies_to_files() {
        let mut session = mem_session(3, 4);
        session.params.merge_in_order = true;

        fill_chunk(&session, 2, 2);
        assert!(!may_merge(&session, &session.chunks[2]));

        session.chunks[0].store_progress(ChunkProgress::Merged);
        session.chunks[1].store_progress(ChunkProgress::Merged);
        assert!(may_merge(&session, &session.chunks[2]));
    }

    #[test]
    fn test_null_backend_just_marks_merged() {
        let params = DownloadParams {
            read_only: true,
            chunk_size: 8,
            num_connections: 1,
            ..Default::default()
        };
        let session =
            Session::for_tests(params, chunks_init(2, 8, 0, 16, false), 16, 0);
        let chunk = &session.chunks[0];
        chunk.store_progress(ChunkProgress::Finished);
        merge_finished_chunk(&session, chunk).unwrap();
        assert_eq!(chunk.progress(), ChunkProgress::Merged);
    }

    #[test]
    fn test_tmpfile_merge_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let params = DownloadParams {
            chunk_size: 16,
            num_connections: 1,
            ..Default::default()
        };
        let mut session =
            Session::for_tests(params, chunks_init(2, 16, 0, 32, false), 32, 0);
        session.paths.tmp_dir = dir.path().to_path_buf();
        session.paths.part = dir.path().join("out.part.sal");

        let part = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&session.paths.part)
            .unwrap();
        *session.out.lock() = Output::File(part);

        for idx in 0..2 {
            let chunk = &session.chunks[idx];
            prepare_storage(&session, chunk).unwrap();
            let data = vec![idx as u8 + 1; 16];
            write_to_storage(&session, chunk, &data).unwrap();
            chunk.set_size_complete(16);
            chunk.store_progress(ChunkProgress::Finished);
        }

        // Merge out of order; offsets must land each chunk correctly.
        merge_finished_chunk(&session, &session.chunks[1]).unwrap();
        merge_finished_chunk(&session, &session.chunks[0]).unwrap();

        // Temp files removed.
        assert!(!dir.path().join("0").exists());
        assert!(!dir.path().join("1").exists());

        let mut out = session.out.lock();
        if let Output::File(f) = &mut *out {
            f.seek(SeekFrom::Start(0)).unwrap();
            let mut contents = Vec::new();
            f.read_to_end(&mut contents).unwrap();
            assert_eq!(&contents[..16], &[1u8; 16][..]);
            assert_eq!(&contents[16..], &[2u8; 16][..]);
        } else {
            unreachable!();
        }
    }
}
