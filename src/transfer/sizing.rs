//! Chunk size and count decisions, made once after probing.

use tracing::{info, warn};

use crate::common::tty;
use crate::common::units::human_size_str;
use crate::session::params::DownloadParams;

/// Smallest chunk, and the boundary sizes are rounded up to.
pub const MIN_CHUNK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub rem_size: u64,
    pub chunk_count: usize,
}

/// Decides the effective chunk size, remainder and chunk count, collapsing
/// to single mode when segmentation buys nothing.
pub fn set_sizes(params: &mut DownloadParams, file_size: u64) -> Layout {
    if !params.single_mode {
        if params.auto_size > 0 {
            auto_size(params, file_size);
        }
        if params.whole_file {
            whole_file(params, file_size);
        }
    }

    // A file barely under one chunk would degenerate into single mode;
    // halving the chunk keeps it segmented.
    let chunk_size = params.chunk_size;
    if file_size <= chunk_size && file_size * 2 > chunk_size {
        info!(
            "file_size({}) > 0.5 * chunk_size({}), halving chunk size to {}",
            human_size_str(file_size),
            human_size_str(chunk_size),
            human_size_str(chunk_size / 2)
        );
        params.chunk_size = chunk_size / 2;
    }

    if params.chunk_size < MIN_CHUNK_SIZE {
        warn!(
            "rounding up chunk_size from {} to {MIN_CHUNK_SIZE}",
            params.chunk_size
        );
        params.chunk_size = MIN_CHUNK_SIZE;
    }

    let rem_size = file_size % params.chunk_size;
    let chunk_count = (file_size / params.chunk_size) as usize + usize::from(rem_size > 0);

    if chunk_count <= 1 || params.single_mode {
        return set_single_mode(params, file_size);
    }

    if chunk_count < params.num_connections {
        info!("file relatively small, using {chunk_count} connection(s)");
        params.num_connections = chunk_count;
    }

    Layout { rem_size, chunk_count }
}

/// One chunk spanning the whole file, one connection.
fn set_single_mode(params: &mut DownloadParams, file_size: u64) -> Layout {
    if !params.single_mode {
        info!("file small, enabling single mode");
        params.single_mode = true;
    }

    params.chunk_size = file_size;
    params.num_connections = 1;
    Layout { rem_size: 0, chunk_count: 1 }
}

/// `--whole-file`: chunk count equals the connection count.
fn whole_file(params: &mut DownloadParams, file_size: u64) {
    if file_size == 0 {
        return;
    }

    let connections = params.num_connections as u64;
    let mut chunk_size = file_size / connections + file_size % connections;
    chunk_size = round_up_4k(chunk_size);

    if chunk_size > params.chunk_size {
        params.chunk_size = chunk_size;
        info!(
            "chunk size set to {} based on file size {} and {} connections",
            human_size_str(params.chunk_size),
            human_size_str(file_size),
            connections
        );
    }
}

/// `--auto-size=N`: fit the chunk bar into N terminal lines.
fn auto_size(params: &mut DownloadParams, file_size: u64) {
    let cols = tty::width();
    if cols <= 2 {
        info!("terminal width ({cols}) too small, chunk size not modified");
        return;
    }
    if file_size == 0 {
        return;
    }

    if params.num_connections > cols {
        params.num_connections = cols;
        info!(
            "connections reduced to {} based on terminal width {cols}",
            params.num_connections
        );
    }

    let fitted = file_size / (cols as u64 * params.auto_size as u64);
    if fitted > params.chunk_size {
        params.chunk_size = round_up_4k(fitted);
        info!(
            "chunk size set to {} to fit {} lines of width {cols}",
            human_size_str(params.chunk_size),
            params.auto_size
        );
    }
}

fn round_up_4k(size: u64) -> u64 {
    (size + MIN_CHUNK_SIZE - 1) / MIN_CHUNK_SIZE * MIN_CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with(chunk_size: u64, connections: usize) -> DownloadParams {
        let mut params = DownloadParams::default();
        params.chunk_size = chunk_size;
        params.num_connections = connections;
        params.apply_defaults();
        params
    }

    #[test]
    fn test_segmented_happy_path_layout() {
        // 5 MiB file, 1 MiB chunks, 4 connections: 5 chunks, no remainder.
        let mut params = params_with(1_048_576, 4);
        let layout = set_sizes(&mut params, 5_242_880);
        assert_eq!(layout.chunk_count, 5);
        assert_eq!(layout.rem_size, 0);
        assert!(!params.single_mode);
        assert_eq!(params.num_connections, 4);
    }

    #[test]
    fn test_remainder_adds_chunk() {
        let mut params = params_with(1_048_576, 4);
        let layout = set_sizes(&mut params, 5_242_880 + 1000);
        assert_eq!(layout.chunk_count, 6);
        assert_eq!(layout.rem_size, 1000);
    }

    #[test]
    fn test_tiny_chunk_size_rounded_up() {
        let mut params = params_with(100, 2);
        set_sizes(&mut params, 50 * 4096);
        assert_eq!(params.chunk_size, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_barely_subchunk_file_halves_chunk_size() {
        // 700 KiB file with 1 MiB chunks: halve instead of going single.
        let mut params = params_with(1_048_576, 4);
        let layout = set_sizes(&mut params, 700 * 1024);
        assert_eq!(params.chunk_size, 524_288);
        assert_eq!(layout.chunk_count, 2);
        assert!(!params.single_mode);
    }

    #[test]
    fn test_half_boundary_does_not_halve() {
        // Exactly 0.5 * chunk_size sits outside the open interval, so the
        // chunk size is untouched and the file collapses to single mode.
        let mut params = params_with(1_048_576, 4);
        let layout = set_sizes(&mut params, 524_288);
        assert!(params.single_mode);
        assert_eq!(layout.chunk_count, 1);
        assert_eq!(params.chunk_size, 524_288);
    }

    #[test]
    fn test_small_file_collapses_to_single() {
        let mut params = params_with(1_048_576, 6);
        let layout = set_sizes(&mut params, 2000);
        assert!(params.single_mode);
        assert_eq!(layout.chunk_count, 1);
        assert_eq!(params.num_connections, 1);
        assert_eq!(params.chunk_size, 2000);
    }

    #[test]
    fn test_explicit_single_mode_collapses() {
        let mut params = params_with(1_048_576, 6);
        params.single_mode = true;
        let layout = set_sizes(&mut params, 50_000_000);
        assert_eq!(layout.chunk_count, 1);
        assert_eq!(params.chunk_size, 50_000_000);
        assert_eq!(params.num_connections, 1);
    }

    #[test]
    fn test_connections_clamped_to_chunk_count() {
        let mut params = params_with(1_048_576, 8);
        let layout = set_sizes(&mut params, 3 * 1_048_576);
        assert_eq!(layout.chunk_count, 3);
        assert_eq!(params.num_connections, 3);
    }

    #[test]
    fn test_whole_file_grows_chunks() {
        let mut params = params_with(1_048_576, 4);
        params.whole_file = true;
        let layout = set_sizes(&mut params, 100 * 1_048_576);
        assert_eq!(layout.chunk_count, 4);
        assert_eq!(params.chunk_size % MIN_CHUNK_SIZE, 0);
    }

    #[test]
    fn test_round_up_4k() {
        assert_eq!(round_up_4k(1), 4096);
        assert_eq!(round_up_4k(4096), 4096);
        assert_eq!(round_up_4k(4097), 8192);
    }
}
