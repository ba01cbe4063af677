//! The control file: a textual snapshot of session progress, rewritten in
//! place as chunks advance. Resume trusts it completely, so every write
//! is flushed.
//!
//! Format:
//! ```text
//! <file_size>\n<chunk_size>\n<rem_size>\n<progress_string>\n
//! ```
//! where `progress_string[i]` is the digit encoding of chunk i's state.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::errors::{PargetError, Result};
use crate::events::EventStatus;
use crate::session::progress::{ChunkProgress, exist_progress};
use crate::session::{Session, SessionStatus};

/// Parsed contents of a control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlInfo {
    pub file_size: u64,
    pub chunk_size: u64,
    pub rem_size: u64,
    pub progress: String,
}

impl CtrlInfo {
    pub fn chunk_count(&self) -> usize {
        self.progress.len()
    }
}

pub fn parse_ctrl_file(path: &Path) -> Result<CtrlInfo> {
    let mut contents = String::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|e| PargetError::io(path, e))?;

    if contents.is_empty() {
        return Err(PargetError::CtrlCorrupt("is empty".into()));
    }
    if !contents.ends_with('\n') {
        return Err(PargetError::CtrlCorrupt("is not newline-terminated".into()));
    }

    let mut lines = contents.split('\n');
    let file_size_str = lines.next().unwrap_or_default();
    let chunk_size_str = lines.next().unwrap_or_default();
    let rem_size_str = lines.next().unwrap_or_default();
    let progress = lines.next().unwrap_or_default().to_string();

    // Exactly four lines; anything after the final newline is corruption.
    if lines.next() != Some("") || lines.next().is_some() {
        return Err(PargetError::CtrlCorrupt("has trailing data".into()));
    }

    let parse = |s: &str, what: &str| -> Result<u64> {
        s.parse()
            .map_err(|_| PargetError::CtrlCorrupt(format!("has an unparsable {what} ('{s}')")))
    };

    let info = CtrlInfo {
        file_size: parse(file_size_str, "file size")?,
        chunk_size: parse(chunk_size_str, "chunk size")?,
        rem_size: parse(rem_size_str, "remainder size")?,
        progress,
    };

    if info.progress.is_empty() {
        return Err(PargetError::CtrlCorrupt("has an empty progress string".into()));
    }

    info!(
        "ctrl file parsed: file_size={} chunk_size={} rem_size={} chunk_count={}",
        info.file_size,
        info.chunk_size,
        info.rem_size,
        info.chunk_count()
    );
    Ok(info)
}

fn progress_string(session: &Session) -> String {
    session
        .chunks
        .iter()
        .map(|c| c.progress().as_char())
        .collect()
}

/// One snapshot: rewrite the progress string at `pos` and flush.
fn write_snapshot(session: &Session, pos: u64) -> std::io::Result<()> {
    let snapshot = progress_string(session);

    let mut guard = session.ctrl_file.lock();
    let Some(file) = guard.as_mut() else {
        return Ok(());
    };

    file.seek(SeekFrom::Start(pos))?;
    file.write_all(snapshot.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()
}

fn ctrl_tick(session: &Session, pos: u64) {
    // The part file's own size carries single-mode progress.
    if session.params.single_mode {
        session.events.ctrl.deactivate();
    }

    // Only stop once the merge loop is torn down, so the snapshot keeps
    // the status of every chunk it merged.
    if (session.status() == SessionStatus::Interrupted
        || !exist_progress(&session.chunks, ChunkProgress::Merged, false))
        && session.events.merge.status() < EventStatus::Init
    {
        session.events.ctrl.deactivate();
    }

    if let Err(e) = write_snapshot(session, pos) {
        error!("failed updating control file: {e}");
    }
}

/// Service thread for the control event: writes the header once, then
/// keeps the progress string current.
pub fn ctrl_loop(session: Arc<Session>) {
    let ev = &session.events.ctrl;
    ev.thread_entered();

    let header = format!(
        "{}\n{}\n{}\n",
        session.file_size(),
        session.params.chunk_size,
        session.rem_size
    );
    let pos = header.len() as u64;

    {
        let mut guard = session.ctrl_file.lock();
        if let Some(file) = guard.as_mut() {
            let write_header = file
                .seek(SeekFrom::Start(0))
                .and_then(|_| file.write_all(header.as_bytes()));
            if let Err(e) = write_header {
                error!("failed writing control file header: {e}");
            }
        }
    }

    ev.init();

    if session.status() != SessionStatus::Interrupted
        && exist_progress(&session.chunks, ChunkProgress::Merged, false)
    {
        debug!("start ctrl event loop");
        let s = &session;
        ev.activate(|| ctrl_tick(s, pos));
    }

    ev.deinit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::chunk::chunks_init;
    use crate::session::params::DownloadParams;

    fn write_ctrl(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("x.ctrl.sal");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_valid_ctrl() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ctrl(dir.path(), "5242880\n1048576\n0\n44210\n");
        let info = parse_ctrl_file(&path).unwrap();
        assert_eq!(info.file_size, 5_242_880);
        assert_eq!(info.chunk_size, 1_048_576);
        assert_eq!(info.rem_size, 0);
        assert_eq!(info.progress, "44210");
        assert_eq!(info.chunk_count(), 5);
    }

    #[test]
    fn test_parse_rejects_corruption() {
        let dir = tempfile::tempdir().unwrap();

        let empty = write_ctrl(dir.path(), "");
        assert!(parse_ctrl_file(&empty).is_err());

        let unterminated = write_ctrl(dir.path(), "100\n10\n0\n44");
        assert!(parse_ctrl_file(&unterminated).is_err());

        let trailing = write_ctrl(dir.path(), "100\n10\n0\n44\nextra\n");
        assert!(parse_ctrl_file(&trailing).is_err());

        let bad_number = write_ctrl(dir.path(), "abc\n10\n0\n44\n");
        assert!(parse_ctrl_file(&bad_number).is_err());

        let no_progress = write_ctrl(dir.path(), "100\n10\n0\n\n");
        assert!(parse_ctrl_file(&no_progress).is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        // Writing a header + snapshot, then parsing it back, must yield
        // the same sizes and per-index progress.
        let dir = tempfile::tempdir().unwrap();
        let params = DownloadParams {
            chunk_size: 1024,
            num_connections: 2,
            ..Default::default()
        };
        let mut session = Session::for_tests(
            params,
            chunks_init(4, 1024, 100, 3 * 1024 + 100, false),
            3 * 1024 + 100,
            100,
        );
        session.paths.ctrl = dir.path().join("y.ctrl.sal");

        session.chunks[0].store_progress(ChunkProgress::Merged);
        session.chunks[1].store_progress(ChunkProgress::Finished);
        session.chunks[2].store_progress(ChunkProgress::Started);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&session.paths.ctrl)
            .unwrap();
        *session.ctrl_file.lock() = Some(file);

        let header = format!(
            "{}\n{}\n{}\n",
            session.file_size(),
            session.params.chunk_size,
            session.rem_size
        );
        {
            let mut guard = session.ctrl_file.lock();
            guard.as_mut().unwrap().write_all(header.as_bytes()).unwrap();
        }
        write_snapshot(&session, header.len() as u64).unwrap();

        let info = parse_ctrl_file(&session.paths.ctrl).unwrap();
        assert_eq!(info.file_size, 3 * 1024 + 100);
        assert_eq!(info.chunk_size, 1024);
        assert_eq!(info.rem_size, 100);
        assert_eq!(info.progress, "4320");
    }

    #[test]
    fn test_snapshot_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let params = DownloadParams {
            chunk_size: 512,
            num_connections: 1,
            ..Default::default()
        };
        let mut session = Session::for_tests(
            params,
            chunks_init(3, 512, 0, 1536, false),
            1536,
            0,
        );
        session.paths.ctrl = dir.path().join("z.ctrl.sal");

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&session.paths.ctrl)
            .unwrap();
        *session.ctrl_file.lock() = Some(file);

        let header = format!("{}\n{}\n{}\n", 1536, 512, 0);
        {
            let mut guard = session.ctrl_file.lock();
            guard.as_mut().unwrap().write_all(header.as_bytes()).unwrap();
        }

        write_snapshot(&session, header.len() as u64).unwrap();
        assert_eq!(parse_ctrl_file(&session.paths.ctrl).unwrap().progress, "000");

        session.chunks[0].store_progress(ChunkProgress::Merged);
        session.chunks[1].store_progress(ChunkProgress::Started);
        write_snapshot(&session, header.len() as u64).unwrap();

        let info = parse_ctrl_file(&session.paths.ctrl).unwrap();
        assert_eq!(info.progress, "420");
        assert_eq!(info.file_size, 1536);
    }
}
