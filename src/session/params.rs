use std::time::Duration;

pub const DEF_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEF_NUM_CONNECTIONS: usize = 6;
pub const DEF_STATUS_REFRESH: Duration = Duration::from_millis(500);

/// Which single fact `--get-info` prints before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetInfo {
    FileName,
    FileSize,
    EffectiveUrl,
}

/// User configuration for one download. Built once from the CLI; a few
/// fields (chunk_size, num_connections, single_mode, resume, filename,
/// no_http2, compress, no_decompress) are adjusted during setup based on
/// what the probe learns.
#[derive(Debug, Clone, Default)]
pub struct DownloadParams {
    pub start_url: String,
    pub mirror_url: Option<String>,
    pub fatal_if_invalid_mirror: bool,

    pub root_dir: Option<String>,
    pub filename: Option<String>,
    pub no_path: bool,
    pub keep_get_attrs: bool,
    pub filename_from_redirect: bool,
    pub auto_trunc: bool,
    pub smart_trunc: bool,
    pub no_attachment_detection: bool,

    pub chunk_size: u64,
    pub num_connections: usize,
    pub last_chunks_first: usize,
    pub last_size_first: u64,
    pub random_order: bool,
    pub merge_in_order: bool,
    pub auto_size: usize,
    pub whole_file: bool,
    pub connection_max_rate: u64,

    pub single_mode: bool,
    pub mem_bufs: bool,
    pub no_mmap: bool,
    pub resume: bool,
    pub force: bool,
    pub dry_run: bool,
    pub get_info: Option<GetInfo>,
    pub read_only: bool,
    pub to_stdout: bool,

    pub no_remote_info: bool,
    pub use_head: bool,
    pub assume_range_support: bool,
    pub allow_ftp_segments: bool,

    pub referer: Option<String>,
    pub auto_referer: bool,
    pub user_agent: Option<String>,
    pub no_user_agent: bool,
    pub post: Option<String>,
    pub raw_post: Option<String>,
    pub cookie_file: Option<String>,
    pub inline_cookies: Option<String>,
    pub custom_headers: Vec<String>,
    pub date_expr: Option<String>,
    pub since_file_mtime: Option<String>,

    pub proxy: Option<String>,
    pub tunnel_proxy: Option<String>,
    pub no_proxy: bool,
    pub forced_ip_protocol: Option<u8>,

    pub tls_no_verify: bool,
    pub no_timeouts: bool,
    pub no_http2: bool,
    pub http2_upgrade: bool,
    pub no_tcp_keep_alive: bool,
    pub compress: bool,
    pub no_decompress: bool,

    pub status_refresh_interval: Option<Duration>,
    pub no_status: bool,
    pub no_color: bool,
    pub verbosity: u8,
}

impl DownloadParams {
    /// Fills the defaults the CLI leaves at zero.
    pub fn apply_defaults(&mut self) {
        if self.chunk_size == 0 {
            self.chunk_size = DEF_CHUNK_SIZE;
        }
        if self.num_connections == 0 {
            self.num_connections = DEF_NUM_CONNECTIONS;
        }
    }

    pub fn status_refresh(&self) -> Duration {
        self.status_refresh_interval.unwrap_or(DEF_STATUS_REFRESH)
    }
}
