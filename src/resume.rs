//! Resume reconstruction: turns a control file plus leftover on-disk
//! artifacts back into per-chunk state, so an interrupted session picks up
//! where it stopped.

use tracing::{debug, info, warn};

use crate::common::units::human_size_str;
use crate::ctrl::{CtrlInfo, parse_ctrl_file};
use crate::errors::{PargetError, Result};
use crate::session::Session;
use crate::session::chunk::set_chunk_merged;
use crate::session::progress::ChunkProgress;
use crate::storage::RESUME_REWIND;

/// Recovers partial per-chunk progress beyond the merged prefix, when the
/// chunk layout is unchanged since the previous run.
fn extra_resume(session: &mut Session, progress: &str) -> Result<()> {
    if session.chunk_count != progress.len() {
        return Err(PargetError::CtrlCorrupt(format!(
            "has a progress string of length {} for {} chunks",
            progress.len(),
            session.chunk_count
        )));
    }

    for (idx, c) in progress.chars().enumerate().skip(session.initial_merged_count) {
        match ChunkProgress::from_char(c) {
            Some(ChunkProgress::Merged) => {
                set_chunk_merged(&session.chunks[idx], &session.events);
                session.initial_merged_count += 1;
                debug!("chunk {idx} was merged in a previous run");
            }
            Some(ChunkProgress::Finished) | Some(ChunkProgress::Started) => {
                if session.params.mem_bufs {
                    debug!("can't use an incomplete tmp file for chunk {idx} with memory buffers");
                    continue;
                }

                let tmp_path = session.paths.tmp_dir.join(idx.to_string());
                let tmp_size = match std::fs::metadata(&tmp_path) {
                    Ok(m) => m.len(),
                    Err(_) => {
                        debug!(
                            "{} does not exist, chunk {idx} will be downloaded from scratch",
                            tmp_path.display()
                        );
                        continue;
                    }
                };

                if tmp_size > session.chunks[idx].size {
                    return Err(PargetError::Fatal(format!(
                        "{} size exceeds chunk size ({tmp_size} > {})",
                        tmp_path.display(),
                        session.chunks[idx].size
                    )));
                }

                let size_complete = tmp_size.max(RESUME_REWIND) - RESUME_REWIND;
                session.chunks[idx].set_size_complete(size_complete);
                debug!(
                    "chunk {idx} was incomplete in a previous run ({size_complete}/{})",
                    session.chunks[idx].size
                );
            }
            Some(ChunkProgress::Queued) | Some(ChunkProgress::NotStarted) => {}
            None => {
                return Err(PargetError::CtrlCorrupt(format!(
                    "has an invalid chunk status '{c}'"
                )));
            }
        }
    }

    session.extra_resume_set = true;
    Ok(())
}

/// A previous single-mode run left its progress as the part file's size.
fn resume_was_single(session: &mut Session) -> u64 {
    let done_size = match std::fs::metadata(&session.paths.part) {
        Ok(m) => m.len().max(RESUME_REWIND) - RESUME_REWIND,
        Err(_) => 0,
    };
    session.initial_merged_count = (done_size / session.params.chunk_size.max(1)) as usize;
    info!(
        "done_size: {done_size} (based on the size of {})",
        session.paths.part.display()
    );
    done_size
}

/// A previous segmented run: the leading merged prefix of the progress
/// string is the contiguous finished part of the file.
fn resume_was_segmented(session: &mut Session, ctrl: &CtrlInfo) -> u64 {
    let merged_prefix = ctrl
        .progress
        .chars()
        .take_while(|&c| c == ChunkProgress::Merged.as_char())
        .count();

    if merged_prefix == ctrl.chunk_count() {
        session.initial_merged_count = session.chunk_count;
        ctrl.file_size
    } else {
        let done_size = ctrl.chunk_size * merged_prefix as u64;
        session.initial_merged_count = (done_size / session.params.chunk_size) as usize;
        done_size
    }
}

/// Rebuilds session state from the control file and local artifacts.
pub fn check_resume(session: &mut Session) -> Result<()> {
    if session.params.read_only || session.params.to_stdout {
        warn!("resume does not work if read-only or piping to stdout, disabling");
        session.params.resume = false;
        return Ok(());
    }

    if !session.paths.part.exists() {
        info!("nothing to resume: {} does not exist", session.paths.part.display());
        session.params.resume = false;
        return Ok(());
    }

    if !session.paths.ctrl.exists() {
        warn!(
            "{} does not exist, disabling resume",
            session.paths.ctrl.display()
        );
        session.params.resume = false;
        return Ok(());
    }

    let ctrl = parse_ctrl_file(&session.paths.ctrl)?;

    if session.file_size() != ctrl.file_size {
        if ctrl.file_size != 0 {
            return Err(PargetError::CtrlSizeMismatch {
                server: session.file_size(),
                stored: ctrl.file_size,
            });
        }
        warn!("control filesize is zero, assuming it's the same file");
    }

    let done_size = if ctrl.chunk_size == ctrl.file_size {
        resume_was_single(session)
    } else {
        resume_was_segmented(session, &ctrl)
    };

    if done_size > session.file_size() {
        return Err(PargetError::CtrlCorrupt(format!(
            "claims {done_size} done bytes of a {} byte file",
            session.file_size()
        )));
    }
    info!("done_size: {done_size}");

    for idx in 0..session.initial_merged_count {
        set_chunk_merged(&session.chunks[idx], &session.events);
    }

    if done_size > 0 && done_size == session.file_size() {
        info!("all data was merged in a previous session");
        session.already_finished = true;
    }

    if session.params.single_mode {
        session.chunks[0].set_size_complete(done_size);
        if !session.already_finished {
            info!(
                "resuming using single mode from offset {}",
                human_size_str(done_size)
            );
        }
    } else if !session.already_finished {
        info!(
            "resuming from offset {}*{} ({})",
            session.initial_merged_count,
            human_size_str(session.params.chunk_size),
            human_size_str(session.params.chunk_size * session.initial_merged_count as u64)
        );
    }

    // Partial-chunk recovery only works against an unchanged layout.
    if ctrl.chunk_size == session.params.chunk_size
        && ctrl.rem_size == session.rem_size
        && ctrl.chunk_size != ctrl.file_size
    {
        extra_resume(session, &ctrl.progress)?;
    }

    // No point keeping more connections than remaining chunks.
    let remaining = session.chunk_count - session.initial_merged_count;
    if session.params.num_connections > remaining && remaining > 0 {
        session.params.num_connections = remaining;
        if !session.already_finished {
            info!(
                "remaining data is relatively small, using {} connection(s)",
                session.params.num_connections
            );
        }
    }

    session.global.lock().update(&session.chunks, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::chunk::chunks_init;
    use crate::session::params::DownloadParams;

    const CHUNK: u64 = 1_048_576;
    const FILE: u64 = 5 * CHUNK;

    fn resumable_session(dir: &std::path::Path) -> Session {
        let params = DownloadParams {
            resume: true,
            chunk_size: CHUNK,
            num_connections: 4,
            ..Default::default()
        };
        let mut session = Session::for_tests(
            params,
            chunks_init(5, CHUNK, 0, FILE, false),
            FILE,
            0,
        );
        session.paths.part = dir.join("f.part.sal");
        session.paths.ctrl = dir.join("f.ctrl.sal");
        session.paths.tmp_dir = dir.join("f.tmp.sal");
        session
    }

    fn write_artifacts(session: &Session, ctrl: &str, part_len: u64) {
        std::fs::write(&session.paths.part, vec![0u8; part_len as usize]).unwrap();
        std::fs::write(&session.paths.ctrl, ctrl).unwrap();
        std::fs::create_dir_all(&session.paths.tmp_dir).unwrap();
    }

    #[test]
    fn test_resume_after_kill_scenario() {
        // Chunks 0,1 merged; chunk 2 has 512 KiB on disk; 3,4 untouched.
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, &format!("{FILE}\n{CHUNK}\n0\n44200\n"), FILE);
        std::fs::write(session.paths.tmp_dir.join("2"), vec![0u8; 524_288]).unwrap();

        check_resume(&mut session).unwrap();

        assert_eq!(session.initial_merged_count, 2);
        assert!(session.extra_resume_set);
        assert_eq!(session.chunks[0].progress(), ChunkProgress::Merged);
        assert_eq!(session.chunks[1].progress(), ChunkProgress::Merged);
        // 524288 - 4096 guard
        assert_eq!(session.chunks[2].size_complete(), 520_192);
        assert_eq!(session.chunks[3].progress(), ChunkProgress::NotStarted);
        assert_eq!(session.chunks[4].progress(), ChunkProgress::NotStarted);
        // 3 chunks remain, so 4 connections shrink to 3.
        assert_eq!(session.params.num_connections, 3);
        assert!(!session.already_finished);
        assert_eq!(session.global.lock().initial_complete_size, 2 * CHUNK + 520_192);
    }

    #[test]
    fn test_resume_reconstruction_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = format!("{FILE}\n{CHUNK}\n0\n44300\n");

        let mut first = resumable_session(dir.path());
        write_artifacts(&first, &ctrl, FILE);
        std::fs::write(first.paths.tmp_dir.join("2"), vec![0u8; 100_000]).unwrap();
        check_resume(&mut first).unwrap();

        let mut second = resumable_session(dir.path());
        second.params.num_connections = 4;
        check_resume(&mut second).unwrap();

        assert_eq!(first.initial_merged_count, second.initial_merged_count);
        for idx in 0..5 {
            assert_eq!(
                first.chunks[idx].progress(),
                second.chunks[idx].progress()
            );
            assert_eq!(
                first.chunks[idx].size_complete(),
                second.chunks[idx].size_complete()
            );
        }
    }

    #[test]
    fn test_resume_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, "12345\n1048576\n0\n00000\n", FILE);
        assert!(matches!(
            check_resume(&mut session),
            Err(PargetError::CtrlSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_resume_zero_stored_size_warns_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, &format!("0\n{CHUNK}\n0\n00000\n"), FILE);
        check_resume(&mut session).unwrap();
        assert!(session.params.resume);
    }

    #[test]
    fn test_resume_prior_single_mode_uses_part_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        // Stored chunk_size == stored file_size marks a single-mode run.
        write_artifacts(&session, &format!("{FILE}\n{FILE}\n0\n2\n"), 3 * CHUNK);

        check_resume(&mut session).unwrap();

        // done = 3 MiB - 4096; merged prefix = floor(done / 1 MiB) = 2.
        assert_eq!(session.initial_merged_count, 2);
        assert!(!session.extra_resume_set);
    }

    #[test]
    fn test_resume_all_merged_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, &format!("{FILE}\n{CHUNK}\n0\n44444\n"), FILE);

        check_resume(&mut session).unwrap();

        assert!(session.already_finished);
        assert_eq!(session.initial_merged_count, 5);
        for chunk in &session.chunks {
            assert_eq!(chunk.progress(), ChunkProgress::Merged);
        }
    }

    #[test]
    fn test_resume_invalid_progress_char_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, &format!("{FILE}\n{CHUNK}\n0\n44x00\n"), FILE);
        assert!(check_resume(&mut session).is_err());
    }

    #[test]
    fn test_resume_missing_part_disables_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        check_resume(&mut session).unwrap();
        assert!(!session.params.resume);
    }

    #[test]
    fn test_resume_forced_off_for_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        session.params.to_stdout = true;
        check_resume(&mut session).unwrap();
        assert!(!session.params.resume);
    }

    #[test]
    fn test_resume_oversized_tmp_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = resumable_session(dir.path());
        write_artifacts(&session, &format!("{FILE}\n{CHUNK}\n0\n42000\n"), FILE);
        std::fs::write(
            session.paths.tmp_dir.join("1"),
            vec![0u8; CHUNK as usize + 1],
        )
        .unwrap();
        assert!(check_resume(&mut session).is_err());
    }
}
