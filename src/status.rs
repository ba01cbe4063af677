//! The status display: a periodically redrawn block on stderr with
//! aggregate counters, rates, ETAs and a one-cell-per-chunk bar.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::common::tty;
use crate::common::units::{human_rate_str, human_size_str};
use crate::common::vt;
use crate::events::EventStatus;
use crate::session::progress::ChunkProgress;
use crate::session::progress::exist_progress;
use crate::session::{Session, SessionStatus};

/// Rates are meaningless for the first moments of a session.
const INITIAL_INTERVAL: f64 = 0.5;

const SINGLE_MODE_LINES: usize = 5;

fn progress_color(progress: ChunkProgress) -> &'static str {
    match progress {
        ChunkProgress::NotStarted | ChunkProgress::Queued => vt::color(vt::RED),
        ChunkProgress::Started => vt::color(vt::YELLOW),
        ChunkProgress::Finished => vt::color(vt::CYAN),
        ChunkProgress::Merged => vt::color(vt::GREEN),
    }
}

/// One terminal cell per chunk, colored by state, inverted for chunks
/// served by the mirror.
fn chunk_bar(session: &Session) -> String {
    let mut bar = String::with_capacity(session.chunk_count * 12);
    for chunk in &session.chunks {
        let progress = chunk.progress();
        if chunk.from_mirror.load(std::sync::atomic::Ordering::Relaxed) {
            bar.push_str(vt::color(vt::INVERT));
        }
        bar.push_str(progress_color(progress));
        bar.push(progress.as_char());
        bar.push_str(vt::color(vt::END));
    }
    bar
}

/// Status block height, used to rewind the cursor between redraws.
fn block_lines(session: &Session, initial_complete: u64) -> usize {
    let cols = tty::width().max(1);
    let bar_lines = session.chunk_count / cols + usize::from(session.chunk_count % cols > 0);
    bar_lines + 8 + usize::from(initial_complete > 0)
}

fn status_tick(session: &Session) {
    if (session.status() == SessionStatus::Interrupted
        || !exist_progress(&session.chunks, ChunkProgress::Merged, false))
        && session.events.merge.status() < EventStatus::Init
    {
        session.events.status.deactivate();
    }

    let refresh = session.params.status_refresh().as_secs_f64();
    let file_size = session.file_size();

    let mut p = session.global.lock();
    let now = Instant::now();
    p.dur = now.duration_since(p.start).as_secs_f64();
    p.curr_dur = now.duration_since(p.prev).as_secs_f64();
    p.update(&session.chunks, false);

    if session.params.no_status {
        return;
    }

    let session_complete = p.complete_size.saturating_sub(p.initial_complete_size);
    let session_size = file_size.saturating_sub(p.initial_complete_size);
    let rem_size = file_size.saturating_sub(p.complete_size);

    if p.dur >= INITIAL_INTERVAL {
        p.rate = session_complete as f64 / p.dur;
        p.rem = if p.rate > 0.0 { rem_size as f64 / p.rate } else { f64::INFINITY };
    }

    let due = p.curr_dur >= refresh
        || (p.dur >= INITIAL_INTERVAL && p.dur < refresh)
        || p.complete_size == file_size;
    if !due {
        return;
    }

    if p.curr_dur > 0.0 {
        // Don't go negative on reconnects.
        let curr_complete = p.complete_size.saturating_sub(p.dlprev);
        p.curr_rate = curr_complete as f64 / p.curr_dur;
        p.curr_rem =
            if p.curr_rate > 0.0 { rem_size as f64 / p.curr_rate } else { f64::INFINITY };
    }
    p.prev = now;
    p.dlprev = p.complete_size;

    let lines = block_lines(session, p.initial_complete_size);
    let counts = p.counts;

    let mut err = std::io::stderr().lock();
    let bold = vt::color(vt::BOLD);
    let end = vt::color(vt::END);
    let erase = vt::ERASE_AFTER;

    if !p.primed {
        // Reserve the block so the first rewind lands on our own lines.
        let _ = write!(err, "{}", "\n".repeat(lines));
        let _ = write!(err, "{}", vt::UP.repeat(lines));
        p.primed = true;
    }

    let _ = writeln!(err, "{erase}{bold}Chunk progress:{end}");
    let _ = writeln!(
        err,
        "{erase}  {bold}Merged:{end}        \t {} / {} (+{} finished)",
        counts.merged, session.chunk_count, counts.finished
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Started:{end}       \t {} / {} ({} empty)",
        counts.started, session.chunk_count, counts.empty_started
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Not started:{end}   \t {} / {} (+{} queued)",
        counts.not_started, session.chunk_count, counts.queued
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Size complete:{end} \t {} / {} ({:.2}%)",
        human_size_str(p.complete_size),
        human_size_str(file_size),
        percentage(p.complete_size, file_size)
    );
    if p.initial_complete_size > 0 {
        let _ = writeln!(
            err,
            "{erase}  {bold}Session complete:{end} \t {} / {} ({:.2}%)",
            human_size_str(session_complete),
            human_size_str(session_size),
            percentage(session_complete, session_size)
        );
    }
    let _ = writeln!(
        err,
        "{erase}  {bold}Rate:{end}          \t {} : {}",
        human_rate_str(p.rate),
        human_rate_str(p.curr_rate)
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Remaining:{end}     \t {} : {}",
        eta_str(p.rem),
        eta_str(p.curr_rem)
    );
    let _ = writeln!(err, "{erase}  {bold}Duration:{end}      \t {:.1}s", p.dur);
    let _ = writeln!(err, "{}{}{}", vt::ERASE_SCREEN_AFTER, chunk_bar(session), vt::RETURN);

    let _ = write!(err, "{}", vt::UP.repeat(lines));
    let _ = err.flush();
}

/// Service thread for the status event.
pub fn status_loop(session: Arc<Session>) {
    let ev = &session.events.status;
    ev.thread_entered();
    ev.init();

    if session.status() != SessionStatus::Interrupted
        && exist_progress(&session.chunks, ChunkProgress::Merged, false)
    {
        debug!("start status event loop");
        let s = &session;
        ev.activate(|| status_tick(s));
    }

    ev.deinit();

    // Step past the block so later output doesn't overwrite it.
    if !session.params.no_status {
        let lines = block_lines(&session, session.global.lock().initial_complete_size);
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "{}", "\n".repeat(lines));
        let _ = err.flush();
    }
}

/// Single mode has no per-chunk bar and no status thread; the worker's
/// write path drives a compact block instead.
pub fn single_progress(session: &Session) {
    let refresh = session.params.status_refresh().as_secs_f64();
    let file_size = session.file_size();
    let complete = session.chunks[0].size_complete();

    let mut p = session.global.lock();
    p.complete_size = complete;

    if session.params.no_status {
        return;
    }

    let now = Instant::now();
    p.dur = now.duration_since(p.start).as_secs_f64();
    p.curr_dur = now.duration_since(p.prev).as_secs_f64();

    // Redraw on the refresh cadence; always when the size is unknown or
    // the transfer just completed, since either may end the session.
    let due = p.curr_dur >= refresh || file_size == 0 || complete == file_size;
    if !due {
        return;
    }

    if p.curr_dur >= refresh {
        let curr_complete = complete.saturating_sub(p.dlprev);
        p.curr_rate = curr_complete as f64 / p.curr_dur;
        p.curr_rem = if p.curr_rate > 0.0 {
            file_size.saturating_sub(complete) as f64 / p.curr_rate
        } else {
            f64::INFINITY
        };
        p.prev = now;
        p.dlprev = complete;
    }

    if p.dur >= INITIAL_INTERVAL {
        let session_complete = complete.saturating_sub(p.initial_complete_size);
        p.rate = session_complete as f64 / p.dur;
        p.rem = if p.rate > 0.0 {
            file_size.saturating_sub(complete) as f64 / p.rate
        } else {
            f64::INFINITY
        };
    }

    let mut err = std::io::stderr().lock();
    let bold = vt::color(vt::BOLD);
    let end = vt::color(vt::END);
    let erase = vt::ERASE_AFTER;

    if !p.primed {
        let _ = write!(err, "{}", "\n".repeat(SINGLE_MODE_LINES));
        let _ = write!(err, "{}", vt::UP.repeat(SINGLE_MODE_LINES));
        p.primed = true;
    }

    let _ = writeln!(err, "{erase}{bold}Single mode progress:{end}");
    let _ = writeln!(
        err,
        "{erase}  {bold}Progress:{end}  \t {} / {}",
        human_size_str(complete),
        human_size_str(file_size)
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Rate:{end}      \t {} : {}",
        human_rate_str(p.rate),
        human_rate_str(p.curr_rate)
    );
    let _ = writeln!(
        err,
        "{erase}  {bold}Remaining:{end} \t {} : {}",
        eta_str(p.rem),
        eta_str(p.curr_rem)
    );
    let _ = writeln!(err, "{erase}  {bold}Duration:{end}  \t {:.1}s", p.dur);

    let _ = write!(err, "{}", vt::UP.repeat(SINGLE_MODE_LINES));
    let _ = err.flush();
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 * 100.0 / whole as f64 }
}

fn eta_str(seconds: f64) -> String {
    if seconds.is_finite() {
        format!("{seconds:.1}s")
    } else {
        "--".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::chunk::chunks_init;
    use crate::session::params::DownloadParams;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(0, 0), 0.0);
    }

    #[test]
    fn test_eta_str_infinite() {
        assert_eq!(eta_str(f64::INFINITY), "--");
        assert_eq!(eta_str(12.34), "12.3s");
    }

    #[test]
    fn test_chunk_bar_reflects_states() {
        vt::set_no_color(true);
        let params = DownloadParams {
            chunk_size: 4,
            num_connections: 1,
            ..Default::default()
        };
        let session =
            Session::for_tests(params, chunks_init(3, 4, 0, 12, false), 12, 0);
        session.chunks[0].store_progress(ChunkProgress::Merged);
        session.chunks[1].store_progress(ChunkProgress::Started);
        assert_eq!(chunk_bar(&session), "420");
        vt::set_no_color(false);
    }

    #[test]
    fn test_block_lines_accounts_for_bar_wrap() {
        let params = DownloadParams {
            chunk_size: 4,
            num_connections: 1,
            ..Default::default()
        };
        let session =
            Session::for_tests(params, chunks_init(5, 4, 0, 20, false), 20, 0);
        // 5 chunks in a wide terminal: one bar line + 8 fixed lines.
        unsafe { std::env::set_var("COLUMNS", "80") };
        assert_eq!(block_lines(&session, 0), 9);
        assert_eq!(block_lines(&session, 1), 10);
    }
}
