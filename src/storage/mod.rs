//! Chunk storage backends.
//!
//! Four interchangeable strategies for where a chunk's bytes live between
//! download and merge: a per-chunk temp file (the default), an in-memory
//! buffer, direct writes into the part file (single mode), and a null sink
//! for read-only runs. Workers call `prepare`/`write`/`reset`; the merger
//! calls `merge_into_output`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::errors::{PargetError, Result};
use crate::session::{Output, Session};
use crate::session::chunk::Chunk;

/// Rewind applied before resuming partially-written storage, in case the
/// tail bytes were torn by a crash or an aborted TLS record.
pub const RESUME_REWIND: u64 = 4096;

/// Backend selected once per session from the write-mode options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    TmpFile,
    Memory,
    Single,
    Null,
}

impl StorageKind {
    pub fn select(read_only: bool, single_mode: bool, mem_bufs: bool) -> Self {
        if read_only {
            StorageKind::Null
        } else if single_mode {
            StorageKind::Single
        } else if mem_bufs {
            StorageKind::Memory
        } else {
            StorageKind::TmpFile
        }
    }
}

/// Per-chunk storage slot, populated by `prepare_storage` when the chunk
/// is handed to a worker and emptied again when the merger releases it.
pub enum ChunkStorage {
    Unprepared,
    TmpFile { path: PathBuf, file: File },
    Memory { buf: Vec<u8> },
    /// Bytes go straight into the session output.
    Single,
    Null,
    Released,
}

/// Opens/allocates the chunk's storage. With a non-zero `size_complete`
/// (resume) the temp file is kept and positioned; otherwise it is
/// truncated.
pub fn prepare_storage(session: &Session, chunk: &Chunk) -> Result<()> {
    let mut slot = chunk.storage.lock();

    match session.storage_kind {
        StorageKind::TmpFile => {
            let path = session.paths.tmp_dir.join(chunk.idx.to_string());
            let size_complete = chunk.size_complete();

            let mut file = if size_complete > 0 {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| PargetError::io(&path, e))?
            } else {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| PargetError::io(&path, e))?
            };

            if size_complete > 0 {
                file.seek(SeekFrom::Start(size_complete))
                    .map_err(|e| PargetError::io(&path, e))?;
            }

            *slot = ChunkStorage::TmpFile { path, file };
        }
        StorageKind::Memory => {
            *slot = ChunkStorage::Memory { buf: Vec::with_capacity(chunk.size as usize) };
        }
        StorageKind::Single => {
            let size_complete = chunk.size_complete();
            if size_complete > 0 {
                let mut out = session.out.lock();
                if let Output::File(file) = &mut *out {
                    file.seek(SeekFrom::Start(size_complete))
                        .map_err(|e| PargetError::io(&session.paths.part, e))?;
                }
            }
            *slot = ChunkStorage::Single;
        }
        StorageKind::Null => {
            *slot = ChunkStorage::Null;
        }
    }

    Ok(())
}

/// Appends one body chunk to storage. Temp files are flushed per write so
/// a `Finished` transition never races ahead of the data.
pub fn write_to_storage(session: &Session, chunk: &Chunk, data: &[u8]) -> Result<()> {
    let mut slot = chunk.storage.lock();

    match &mut *slot {
        ChunkStorage::TmpFile { path, file } => {
            file.write_all(data).map_err(|e| PargetError::io(&*path, e))?;
            file.flush().map_err(|e| PargetError::io(&*path, e))?;
        }
        ChunkStorage::Memory { buf } => {
            buf.extend_from_slice(data);
        }
        ChunkStorage::Single => {
            let mut out = session.out.lock();
            out.write_all(data)
                .map_err(|e| PargetError::io(&session.paths.part, e))?;
        }
        ChunkStorage::Null => {}
        ChunkStorage::Unprepared | ChunkStorage::Released => {
            return Err(PargetError::Fatal(format!(
                "write into unprepared storage for chunk {}",
                chunk.idx
            )));
        }
    }

    Ok(())
}

/// Rewinds storage before a retry: measure what survived, back off
/// `RESUME_REWIND` bytes against torn tails, reposition the cursor and
/// the chunk's resume offset. The worker recomputes its range from
/// `curr_range_start`.
pub fn reset_storage(session: &Session, chunk: &Chunk) -> Result<()> {
    let mut slot = chunk.storage.lock();

    match &mut *slot {
        ChunkStorage::TmpFile { path, file } => {
            file.flush().map_err(|e| PargetError::io(&*path, e))?;
            let len = file.metadata().map_err(|e| PargetError::io(&*path, e))?.len();
            let size_complete = len.max(RESUME_REWIND) - RESUME_REWIND;

            info!(
                "restarting chunk {} from offset {}",
                chunk.idx, size_complete
            );

            file.seek(SeekFrom::Start(size_complete))
                .map_err(|e| PargetError::io(&*path, e))?;
            chunk.set_size_complete(size_complete);
            chunk.set_curr_range_start(chunk.range_start + size_complete);
        }
        ChunkStorage::Memory { buf } => {
            buf.clear();
            chunk.set_size_complete(0);
            chunk.set_curr_range_start(chunk.range_start);
        }
        ChunkStorage::Single => {
            let mut out = session.out.lock();
            match &mut *out {
                Output::File(file) => {
                    let len = file
                        .metadata()
                        .map_err(|e| PargetError::io(&session.paths.part, e))?
                        .len();
                    let offset = len.max(RESUME_REWIND) - RESUME_REWIND;
                    info!("restarting from offset {}", offset);
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| PargetError::io(&session.paths.part, e))?;
                    chunk.set_size_complete(offset);
                    chunk.set_curr_range_start(offset);
                }
                _ => {
                    // A stream cannot be rewound; continue from what was
                    // already emitted.
                    chunk.set_curr_range_start(chunk.range_start + chunk.size_complete());
                }
            }
        }
        ChunkStorage::Null => {
            chunk.set_size_complete(0);
            chunk.set_curr_range_start(chunk.range_start);
        }
        ChunkStorage::Unprepared | ChunkStorage::Released => {
            return Err(PargetError::Fatal(format!(
                "reset of unprepared storage for chunk {}",
                chunk.idx
            )));
        }
    }

    Ok(())
}

/// Copies the chunk's storage into the output at its offset and releases
/// it. Temp files go through a read-only mmap unless `--no-mmap`; short
/// temp files are a hard error because the chunk claimed to be finished.
pub fn merge_into_output(session: &Session, chunk: &Chunk) -> Result<()> {
    let mut slot = chunk.storage.lock();
    let offset = chunk.idx as u64 * session.params.chunk_size;

    match std::mem::replace(&mut *slot, ChunkStorage::Released) {
        ChunkStorage::TmpFile { path, mut file } => {
            file.flush().map_err(|e| PargetError::io(&path, e))?;
            file.seek(SeekFrom::Start(0)).map_err(|e| PargetError::io(&path, e))?;

            let mut wrote_mmap = false;
            if !session.params.no_mmap {
                // Safety: the worker that wrote this file is done with it,
                // and nothing else maps or truncates it before removal.
                match unsafe { memmap2::Mmap::map(&file) } {
                    Ok(map) => {
                        if map.len() as u64 >= chunk.size {
                            let mut out = session.out.lock();
                            out.write_all_at(&map[..chunk.size as usize], offset)
                                .map_err(|e| PargetError::io(&session.paths.part, e))?;
                            wrote_mmap = true;
                        }
                    }
                    Err(e) => {
                        warn!("mmap of chunk file {} failed ({e}), using buffered copy", chunk.idx);
                    }
                }
            }

            if !wrote_mmap {
                let mut buf = vec![0u8; chunk.size as usize];
                file.read_exact(&mut buf).map_err(|e| {
                    PargetError::Fatal(format!(
                        "reading {} back failed, expected {} bytes: {e}",
                        path.display(),
                        chunk.size
                    ))
                })?;
                let mut out = session.out.lock();
                out.write_all_at(&buf, offset)
                    .map_err(|e| PargetError::io(&session.paths.part, e))?;
            }

            drop(file);
            std::fs::remove_file(&path).map_err(|e| PargetError::io(&path, e))?;
        }
        ChunkStorage::Memory { buf } => {
            if (buf.len() as u64) < chunk.size {
                return Err(PargetError::Fatal(format!(
                    "memory buffer for chunk {} holds {} bytes, expected {}",
                    chunk.idx,
                    buf.len(),
                    chunk.size
                )));
            }
            let mut out = session.out.lock();
            out.write_all_at(&buf[..chunk.size as usize], offset)
                .map_err(|e| PargetError::io(&session.paths.part, e))?;
        }
        ChunkStorage::Null | ChunkStorage::Released => {}
        ChunkStorage::Single | ChunkStorage::Unprepared => {
            return Err(PargetError::Fatal(format!(
                "merge requested for chunk {} storage that never buffers",
                chunk.idx
            )));
        }
    }

    Ok(())
}
