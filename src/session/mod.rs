//! The session aggregate and the orchestrator that drives a download from
//! probe to final rename.

pub mod chunk;
pub mod params;
pub mod progress;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::units::human_size_str;
use crate::ctrl;
use crate::session::chunk::Chunk;
use crate::errors::{PargetError, Result};
use crate::events::{EventSlot, EventStatus, Events};
use crate::merge;
use crate::queue;
use crate::resume;
use crate::session::chunk::chunks_init;
use crate::session::params::{DownloadParams, GetInfo};
use crate::session::progress::{ChunkProgress, GlobalProgress, exist_progress};
use crate::status;
use crate::storage::StorageKind;
use crate::transfer::naming::{self, OutputPaths};
use crate::transfer::probe::{self, RemoteInfo};
use crate::transfer::sizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionStatus {
    Init = 0,
    InProgress = 1,
    QueueInterrupted = 2,
    Interrupted = 3,
}

/// Where merged (or single-mode) bytes land.
pub enum Output {
    None,
    File(File),
    Stdout(std::io::Stdout),
}

impl Output {
    /// Sequential write at the current position (single mode, stdout).
    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Output::None => Ok(()),
            Output::File(f) => f.write_all(data),
            Output::Stdout(s) => {
                let mut lock = s.lock();
                lock.write_all(data)?;
                lock.flush()
            }
        }
    }

    /// Positioned write used by the merger. Streams ignore the offset;
    /// the merge loop only hands them chunks in index order.
    pub fn write_all_at(&mut self, data: &[u8], offset: u64) -> std::io::Result<()> {
        match self {
            Output::None => Ok(()),
            Output::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
                f.write_all(data)
            }
            Output::Stdout(s) => {
                let mut lock = s.lock();
                lock.write_all(data)?;
                lock.flush()
            }
        }
    }
}

/// One connection slot. The slot outlives the chunks it carries; after its
/// chunk finishes, the scheduler rebinds it to the next one.
pub struct WorkerSlot {
    pub idx: usize,
    pub chunk: Mutex<Option<usize>>,
    pub single: bool,
    pub use_mirror: bool,
}

/// Join handles for the five service threads, taken by whichever thread
/// runs the exit path first.
#[derive(Default)]
pub struct ServiceThreads {
    pub trigger: Mutex<Option<JoinHandle<()>>>,
    pub queue: Mutex<Option<JoinHandle<()>>>,
    pub merge: Mutex<Option<JoinHandle<()>>>,
    pub ctrl: Mutex<Option<JoinHandle<()>>>,
    pub status: Mutex<Option<JoinHandle<()>>>,
}

/// Everything one download session owns.
pub struct Session {
    pub params: DownloadParams,
    pub remote: RemoteInfo,
    pub mirror: Option<RemoteInfo>,
    pub mirror_valid: bool,

    file_size: AtomicU64,
    pub file_size_from_dltotal: AtomicBool,
    pub rem_size: u64,
    pub chunk_count: usize,
    pub initial_merged_count: usize,
    pub extra_resume_set: bool,
    pub already_finished: bool,

    pub chunks: Vec<Chunk>,
    pub workers: Vec<WorkerSlot>,
    pub events: Events,
    pub threads: ServiceThreads,

    pub storage_kind: StorageKind,
    pub paths: OutputPaths,
    pub out: Mutex<Output>,
    pub ctrl_file: Mutex<Option<File>>,

    pub global: Mutex<GlobalProgress>,

    status: AtomicU8,
    pub events_queue_done: AtomicBool,
    called_exit: AtomicBool,
    pub fatal: Mutex<Option<String>>,

    pub client: reqwest::Client,
    pub handle: tokio::runtime::Handle,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => SessionStatus::Init,
            1 => SessionStatus::InProgress,
            2 => SessionStatus::QueueInterrupted,
            _ => SessionStatus::Interrupted,
        }
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::SeqCst)
    }

    /// Single mode learns the size from the transfer when probing was
    /// skipped or unreliable.
    pub fn set_file_size(&self, size: u64) {
        self.file_size.store(size, Ordering::SeqCst);
    }

    /// Records the first fatal message and runs the exit path. Workers and
    /// service callbacks call this instead of propagating.
    pub fn record_fatal(&self, message: String) {
        error!("{message}");
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(message);
            }
        }
        self.exit_routine();
    }

    /// The single exit path: stop handing out chunks, let in-flight merges
    /// and the control writer finish, then wind every loop down. Runs at
    /// most once; later callers return immediately.
    pub fn exit_routine(&self) {
        if self.called_exit.swap(true, Ordering::SeqCst) {
            debug!("exit routine already ran, skipping");
            return;
        }
        debug!("running exit routine");

        if self.status() >= SessionStatus::InProgress {
            // Stop the scheduler first so no new chunk goes out.
            self.set_status(SessionStatus::QueueInterrupted);
            self.events.queue_wake(&self.events.queue);
            join_service(&self.events.queue, &self.threads.queue);

            // merge & ctrl matter for resume: give them a tick while still
            // merely queue-interrupted, then break all loops.
            self.events.queue_wake(&self.events.merge);
            self.events.queue_wake(&self.events.ctrl);
            self.events.queue_wake(&self.events.status);

            self.set_status(SessionStatus::Interrupted);

            self.events.queue_wake(&self.events.merge);
            self.events.queue_wake(&self.events.ctrl);
            self.events.queue_wake(&self.events.status);

            join_service(&self.events.merge, &self.threads.merge);
            join_service(&self.events.ctrl, &self.threads.ctrl);
            join_service(&self.events.status, &self.threads.status);

            self.events_queue_done.store(true, Ordering::SeqCst);
            self.events.trigger.pulse();
            join_service(&self.events.trigger, &self.threads.trigger);
        }

        debug!("exit routine done");
    }
}

#[cfg(test)]
impl Session {
    /// A minimal session for unit tests that exercise scheduling, merging
    /// and resume logic without a live transfer.
    pub fn for_tests(
        params: DownloadParams,
        chunks: Vec<chunk::Chunk>,
        file_size: u64,
        rem_size: u64,
    ) -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building a test runtime");
        let handle = runtime.handle().clone();
        // Keep the runtime alive for the whole test process.
        std::mem::forget(runtime);

        let chunk_count = chunks.len();
        let storage_kind =
            StorageKind::select(params.read_only, params.single_mode, params.mem_bufs);
        let workers = (0..params.num_connections.max(1))
            .map(|idx| WorkerSlot {
                idx,
                chunk: Mutex::new(None),
                single: params.single_mode,
                use_mirror: false,
            })
            .collect();

        Session {
            params,
            remote: RemoteInfo::default(),
            mirror: None,
            mirror_valid: false,
            file_size: AtomicU64::new(file_size),
            file_size_from_dltotal: AtomicBool::new(false),
            rem_size,
            chunk_count,
            initial_merged_count: 0,
            extra_resume_set: false,
            already_finished: false,
            chunks,
            workers,
            events: Events::new(),
            threads: ServiceThreads::default(),
            storage_kind,
            paths: OutputPaths {
                part: "test.out.part.sal".into(),
                ctrl: "test.out.ctrl.sal".into(),
                tmp_dir: "test.out.tmp.sal".into(),
            },
            out: Mutex::new(Output::None),
            ctrl_file: Mutex::new(None),
            global: Mutex::new(GlobalProgress::new()),
            status: AtomicU8::new(SessionStatus::Init as u8),
            events_queue_done: AtomicBool::new(false),
            called_exit: AtomicBool::new(false),
            fatal: Mutex::new(None),
            client: reqwest::Client::new(),
            handle,
        }
    }
}

/// Joins a service thread, tolerating being called from that very thread
/// (a callback that triggered the exit): the handle is dropped instead.
fn join_service(slot: &EventSlot, handle_slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = handle_slot.lock().take();
    if let Some(handle) = handle {
        if handle.thread().id() == std::thread::current().id() {
            warn!("{} thread tried to join itself, detaching instead", slot.kind().name());
            return;
        }
        if handle.join().is_err() {
            error!("{} thread panicked", slot.kind().name());
        }
    }
}

/// Waits for any stragglers the exit routine could not join (self-joined
/// service threads finishing their last tick).
fn wait_services_settled(session: &Session) {
    let slots = [
        &session.events.queue,
        &session.events.merge,
        &session.events.ctrl,
        &session.events.status,
        &session.events.trigger,
    ];
    let deadline = Instant::now() + Duration::from_secs(5);
    for slot in slots {
        while slot.status() > EventStatus::ThreadStarted && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Runs one download start to finish. This is the whole data flow of the
/// tool: probe, size, (maybe) resume, prepare output, spawn workers and
/// service loops, wait, finalize.
pub fn run(mut params: DownloadParams, handle: tokio::runtime::Handle) -> Result<()> {
    info!("URL: {}", params.start_url);

    let Some(probe_result) = probe::fetch_remote_info(&mut params, &handle)? else {
        // The If-(Un)Modified-Since condition fired; nothing to download.
        return Ok(());
    };
    let file_size = probe_result.remote.file_size;

    naming::set_names(&mut params, &probe_result.remote)?;
    let paths = naming::output_paths(&params);

    let layout = sizing::set_sizes(&mut params, file_size);

    let is_ftp = probe_result.remote.effective_url.starts_with("ftp");
    let chunks = chunks_init(
        layout.chunk_count,
        params.chunk_size,
        layout.rem_size,
        file_size,
        is_ftp && params.allow_ftp_segments,
    );

    let single = params.single_mode;
    let storage_kind = StorageKind::select(params.read_only, single, params.mem_bufs);
    let workers = (0..params.num_connections)
        .map(|idx| WorkerSlot {
            idx,
            chunk: Mutex::new(None),
            single,
            use_mirror: probe_result.mirror_valid && idx % 2 == 1,
        })
        .collect();

    let mut session = Session {
        params,
        remote: probe_result.remote,
        mirror: probe_result.mirror,
        mirror_valid: probe_result.mirror_valid,
        file_size: AtomicU64::new(file_size),
        file_size_from_dltotal: AtomicBool::new(false),
        rem_size: layout.rem_size,
        chunk_count: layout.chunk_count,
        initial_merged_count: 0,
        extra_resume_set: false,
        already_finished: false,
        chunks,
        workers,
        events: Events::new(),
        threads: ServiceThreads::default(),
        storage_kind,
        paths,
        out: Mutex::new(Output::None),
        ctrl_file: Mutex::new(None),
        global: Mutex::new(GlobalProgress::new()),
        status: AtomicU8::new(SessionStatus::Init as u8),
        events_queue_done: AtomicBool::new(false),
        called_exit: AtomicBool::new(false),
        fatal: Mutex::new(None),
        client: probe_result.client,
        handle,
    };

    if session.params.resume {
        resume::check_resume(&mut session)?;
    }

    print_chunk_info(&session);

    if let Some(what) = session.params.get_info {
        print_get_info(&session, what);
        info!("Getting info done.");
        return Ok(());
    }

    if session.params.dry_run {
        info!("Dry-run done.");
        return Ok(());
    }

    prepare_files_and_dirs(&mut session)?;

    if session.already_finished {
        let session = Arc::new(session);
        finalize(&session)?;
        return Ok(());
    }

    // Rebind worker count: resume may have clamped the connections.
    let single = session.params.single_mode;
    if session.workers.len() != session.params.num_connections {
        let mirror_valid = session.mirror_valid;
        session.workers = (0..session.params.num_connections)
            .map(|idx| WorkerSlot {
                idx,
                chunk: Mutex::new(None),
                single,
                use_mirror: mirror_valid && idx % 2 == 1,
            })
            .collect();
    }

    {
        let mut global = session.global.lock();
        let now = Instant::now();
        global.start = now;
        global.prev = now;
    }

    let session = Arc::new(session);
    install_signal_handlers(&session);

    // In progress from here on, so a fatal error or signal during spawn
    // already takes the full staged exit path.
    session.set_status(SessionStatus::InProgress);

    // First iteration: one chunk per connection, then the queue loop keeps
    // the pool fed.
    for worker_idx in 0..session.params.num_connections {
        queue::queue_next_chunk(&session, worker_idx, true)?;
    }

    spawn_service_threads(&session)
        .map_err(|e| PargetError::Fatal(format!("spawning service threads failed: {e}")))?;

    wait_for_terminal_state(&session);

    if session.status() == SessionStatus::Interrupted
        || session.called_exit.load(Ordering::SeqCst)
    {
        session.exit_routine();
        wait_services_settled(&session);
        let fatal = session.fatal.lock().take();
        return Err(PargetError::Fatal(
            fatal.unwrap_or_else(|| "session interrupted".into()),
        ));
    }

    // Normal completion: wind the loops down in dependency order.
    join_service(&session.events.ctrl, &session.threads.ctrl);
    if session.chunk_count != 1 {
        join_service(&session.events.status, &session.threads.status);
        join_service(&session.events.queue, &session.threads.queue);
        join_service(&session.events.merge, &session.threads.merge);
    }
    session.events_queue_done.store(true, Ordering::SeqCst);
    session.events.trigger.pulse();
    join_service(&session.events.trigger, &session.threads.trigger);

    if let Some(fatal) = session.fatal.lock().take() {
        return Err(PargetError::Fatal(fatal));
    }

    finalize(&session)?;
    Ok(())
}

fn print_chunk_info(session: &Session) {
    if session.file_size() == 0 {
        return;
    }
    let chunk_size = session.params.chunk_size;
    if session.rem_size != 0 && !session.params.single_mode {
        info!(
            "Chunks: {}*{} + 1*{}",
            session.chunk_count - 1,
            human_size_str(chunk_size),
            human_size_str(session.rem_size)
        );
    } else {
        info!(
            "Chunks: {}*{}",
            session.chunk_count,
            human_size_str(chunk_size)
        );
    }
}

fn print_get_info(session: &Session, what: GetInfo) {
    match what {
        GetInfo::FileName => {
            if let Some(name) = &session.params.filename {
                println!("{name}");
            }
        }
        GetInfo::FileSize => println!("{}", session.file_size()),
        GetInfo::EffectiveUrl => {
            if session.remote.effective_url.is_empty() {
                println!("{}", session.params.start_url);
            } else {
                println!("{}", session.remote.effective_url);
            }
        }
    }
}

/// Opens the part and control files and creates the temp dir, enforcing
/// the force/resume interactions around leftovers from previous runs.
fn prepare_files_and_dirs(session: &mut Session) -> Result<()> {
    let read_only = session.params.read_only;
    let to_stdout = session.params.to_stdout;
    let resume = session.params.resume;
    let force = session.params.force;
    let buffered = session.params.mem_bufs || session.params.single_mode;

    if read_only {
        return Ok(());
    }

    if to_stdout {
        *session.out.get_mut() = Output::Stdout(std::io::stdout());
    } else if resume {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&session.paths.part)
            .map_err(|e| PargetError::io(&session.paths.part, e))?;
        *session.out.get_mut() = Output::File(file);
    } else {
        if !force && session.paths.part.exists() {
            return Err(PargetError::OutputExists { path: session.paths.part.clone() });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&session.paths.part)
            .map_err(|e| PargetError::io(&session.paths.part, e))?;
        *session.out.get_mut() = Output::File(file);
    }

    if session.paths.tmp_dir.exists() {
        if buffered {
            warn!(
                "{} seems to be left over. You have to delete this dir manually.",
                session.paths.tmp_dir.display()
            );
        } else if !session.extra_resume_set {
            return Err(PargetError::Fatal(format!(
                "{} is left over from a previous run with a different chunk size. \
                 Use the same chunk size or delete it manually.",
                session.paths.tmp_dir.display()
            )));
        }
    } else if !buffered {
        if session.extra_resume_set {
            warn!(
                "{} did not exist. Maybe the previous run used memory buffers or it was deleted.",
                session.paths.tmp_dir.display()
            );
        }
        std::fs::create_dir(&session.paths.tmp_dir)
            .map_err(|e| PargetError::io(&session.paths.tmp_dir, e))?;
    }

    if !to_stdout {
        if !resume && !force && session.paths.ctrl.exists() {
            return Err(PargetError::Fatal(format!(
                "resume disabled and {} exists",
                session.paths.ctrl.display()
            )));
        }
        let ctrl_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&session.paths.ctrl)
            .map_err(|e| PargetError::io(&session.paths.ctrl, e))?;
        *session.ctrl_file.get_mut() = Some(ctrl_file);
    }

    Ok(())
}

fn install_signal_handlers(session: &Arc<Session>) {
    let on_signal = |session: Arc<Session>, name: &'static str| {
        error!("signal {name} was raised");
        tokio::task::spawn_blocking(move || session.exit_routine());
    };

    let s = session.clone();
    session.handle.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal(s, "SIGINT");
        }
    });

    #[cfg(unix)]
    {
        let s = session.clone();
        session.handle.spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                if term.recv().await.is_some() {
                    on_signal(s, "SIGTERM");
                }
            }
        });
    }
}

fn spawn_service_threads(session: &Arc<Session>) -> std::io::Result<()> {
    let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
        std::thread::Builder::new().name(name.to_string()).spawn(f)
    };

    {
        let s = session.clone();
        *session.threads.trigger.lock() =
            Some(spawn("ev-trigger", Box::new(move || crate::events::trigger_loop(s)))?);
    }

    if !session.params.read_only && !session.params.to_stdout {
        let s = session.clone();
        *session.threads.ctrl.lock() =
            Some(spawn("ev-ctrl", Box::new(move || ctrl::ctrl_loop(s)))?);
    }

    if session.chunk_count != 1 {
        let s = session.clone();
        *session.threads.status.lock() =
            Some(spawn("ev-status", Box::new(move || status::status_loop(s)))?);

        let s = session.clone();
        *session.threads.queue.lock() =
            Some(spawn("ev-queue", Box::new(move || queue::queue_loop(s)))?);

        let s = session.clone();
        *session.threads.merge.lock() =
            Some(spawn("ev-merge", Box::new(move || merge::merge_loop(s)))?);
    }

    Ok(())
}

/// 100 ms completion polling; workers are detached, so completion is read
/// off the chunk states rather than joined.
fn wait_for_terminal_state(session: &Session) {
    loop {
        std::thread::sleep(Duration::from_millis(100));

        if session.status() == SessionStatus::Interrupted
            || session.called_exit.load(Ordering::SeqCst)
        {
            return;
        }

        let done = if session.params.single_mode {
            session.chunks[0].progress() >= ChunkProgress::Finished
        } else {
            !exist_progress(&session.chunks, ChunkProgress::Merged, false)
        };
        if done {
            return;
        }
    }
}

/// Cleanup after all data is merged: remove the temp dir, verify the
/// saved size, rename the part file and drop the control file.
fn finalize(session: &Session) -> Result<()> {
    let params = &session.params;

    if !params.read_only && !params.mem_bufs && !params.single_mode && !params.to_stdout {
        if let Err(e) = std::fs::remove_dir(&session.paths.tmp_dir) {
            error!("failed to delete {}: {e}", session.paths.tmp_dir.display());
        }
    }

    let file_size = session.file_size();
    if file_size != 0
        && !params.no_remote_info
        && !params.read_only
        && !params.to_stdout
        && (!session.remote.content_encoded || params.no_decompress)
    {
        let saved = std::fs::metadata(&session.paths.part)
            .map(|m| m.len())
            .map_err(|e| PargetError::io(&session.paths.part, e))?;
        if saved != file_size {
            error!("unexpected saved file size ({saved} != {file_size})");
            error!("this can happen when downloading from a dynamic site");
            return Err(PargetError::Fatal(format!(
                "unexpected saved file size ({saved} != {file_size}), \
                 retry with --no-remote-info if the content is dynamic"
            )));
        }
    } else {
        debug!("strict check for finished file size skipped");
    }

    if !params.read_only && !params.to_stdout {
        // Drop our handle before renaming.
        *session.out.lock() = Output::None;

        let final_name = params
            .filename
            .as_deref()
            .ok_or_else(|| PargetError::Fatal("output filename never derived".into()))?;
        if let Err(e) = std::fs::rename(&session.paths.part, final_name) {
            error!(
                "failed to rename now-complete {} to {final_name}: {e}",
                session.paths.part.display()
            );
        }

        *session.ctrl_file.lock() = None;
        if let Err(e) = std::fs::remove_file(&session.paths.ctrl) {
            error!("failed to remove {}: {e}", session.paths.ctrl.display());
        }
    }

    info!("Download Finished.");
    Ok(())
}
