use std::time::Duration;

use clap::Parser;

use crate::errors::{PargetError, Result};
use crate::session::params::{DownloadParams, GetInfo};

/// Extra arguments environment variable, split on spaces and appended to
/// the command line before parsing.
pub const EXTRA_ARGS_ENV: &str = "PARGET_EXTRA_ARGS";

#[derive(Debug, Parser)]
#[command(
    name = "parget",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("PARGET_COMMIT"), ")"),
    about = "Segmented file downloader",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// URL to download
    pub url: String,

    /// Mirror URL validated against the primary and used by alternate connections
    #[arg(long)]
    pub mirror_url: Option<String>,

    /// Abort instead of warning when the mirror fails validation
    #[arg(long, requires = "mirror_url")]
    pub fatal_if_invalid_mirror: bool,

    /// Resume a previously interrupted download
    #[arg(short = 'c', long)]
    pub resume: bool,

    /// Overwrite an existing partial download
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Probe the remote file and exit without downloading
    #[arg(short = 'd', long)]
    pub dry_run: bool,

    /// Print one remote fact and exit: file-name, file-size or effective-url
    #[arg(long, value_name = "WHAT")]
    pub get_info: Option<String>,

    /// Chunk size, with optional K/M/G suffix
    #[arg(short = 's', long, value_parser = parse_size)]
    pub chunk_size: Option<u64>,

    /// Number of concurrent connections
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Schedule the last N chunks before the rest
    #[arg(long, value_name = "N", conflicts_with = "last_size_first")]
    pub last_chunks_first: Option<usize>,

    /// Schedule the chunks covering the last SIZE bytes before the rest
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub last_size_first: Option<u64>,

    /// Pick chunks in random order
    #[arg(long)]
    pub random_order: bool,

    /// Merge finished chunks in index order even when saving to a file
    #[arg(long)]
    pub merge_in_order: bool,

    /// Grow the chunk size so the chunk bar fits in N terminal lines
    #[arg(long, value_name = "N")]
    pub auto_size: Option<usize>,

    /// Grow the chunk size so chunk count equals the connection count
    #[arg(short = 'w', long)]
    pub whole_file: bool,

    /// Per-connection download rate cap in bytes/s, with optional suffix
    #[arg(long, value_parser = parse_size)]
    pub connection_max_rate: Option<u64>,

    /// Use one connection writing directly to the output
    #[arg(short = 'S', long)]
    pub single_mode: bool,

    /// Buffer chunks in memory instead of temp files
    #[arg(long)]
    pub mem_bufs: bool,

    /// Disable the mmap fast path when merging temp files
    #[arg(long)]
    pub no_mmap: bool,

    /// Download without writing anything to disk
    #[arg(long)]
    pub read_only: bool,

    /// Write the file to stdout, merging strictly in order
    #[arg(long)]
    pub stdout: bool,

    /// Skip the remote probe; implies single mode and no resume
    #[arg(long)]
    pub no_remote_info: bool,

    /// Probe with HEAD instead of a ranged GET
    #[arg(long)]
    pub use_head: bool,

    /// Trust the server to honor ranges without probing for support
    #[arg(long)]
    pub assume_range_support: bool,

    /// Allow segmented downloads from FTP servers
    #[arg(long)]
    pub allow_ftp_segments: bool,

    /// Replace '/' and ':' in the derived filename with '_'
    #[arg(long)]
    pub no_path: bool,

    /// Keep the query string in the derived filename
    #[arg(long)]
    pub keep_get_attrs: bool,

    /// Derive the filename from the post-redirect URL
    #[arg(long)]
    pub filename_from_redirect: bool,

    /// Truncate long filenames
    #[arg(long)]
    pub auto_trunc: bool,

    /// Truncate long filenames, preserving the extension
    #[arg(long)]
    pub smart_trunc: bool,

    /// Ignore Content-Disposition attachment names
    #[arg(long)]
    pub no_attachment_detection: bool,

    /// Directory to save into
    #[arg(short = 'D', long, value_name = "DIR")]
    pub root_dir: Option<String>,

    /// Output filename, overriding derivation
    #[arg(short = 'o', long, value_name = "NAME")]
    pub output: Option<String>,

    /// Referer header value
    #[arg(long, conflicts_with = "auto_referer")]
    pub referer: Option<String>,

    /// Let redirects set the Referer header
    #[arg(long)]
    pub auto_referer: bool,

    /// User-Agent header value
    #[arg(long, conflicts_with = "no_user_agent")]
    pub user_agent: Option<String>,

    /// Send no User-Agent header
    #[arg(long)]
    pub no_user_agent: bool,

    /// POST form fields
    #[arg(long, conflicts_with = "raw_post")]
    pub post: Option<String>,

    /// POST body sent as-is
    #[arg(long)]
    pub raw_post: Option<String>,

    /// File whose contents are sent as the Cookie header
    #[arg(long)]
    pub cookie_file: Option<String>,

    /// Cookies passed on the command line
    #[arg(long)]
    pub inline_cookies: Option<String>,

    /// Custom header(s); separate multiple headers with \r\n
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub custom_headers: Vec<String>,

    /// If-Modified-Since date expression; prefix with '-' for If-Unmodified-Since
    #[arg(long, value_name = "DATE")]
    pub date_expr: Option<String>,

    /// Use FILE's mtime as the If-Modified-Since condition
    #[arg(long, value_name = "FILE", conflicts_with = "date_expr")]
    pub since_file_mtime: Option<String>,

    /// Proxy URL
    #[arg(long)]
    pub proxy: Option<String>,

    /// Tunneling proxy URL
    #[arg(long, conflicts_with = "proxy")]
    pub tunnel_proxy: Option<String>,

    /// Disable all proxies, including environment ones
    #[arg(long)]
    pub no_proxy: bool,

    /// Force IPv4 or IPv6
    #[arg(long, value_name = "4|6")]
    pub ip_protocol: Option<u8>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    pub tls_no_verify: bool,

    /// Disable stall timeouts
    #[arg(long)]
    pub no_timeouts: bool,

    /// Stick to HTTP/1.1
    #[arg(long)]
    pub no_http2: bool,

    /// Attempt HTTP/2 without TLS
    #[arg(long, conflicts_with = "no_http2")]
    pub http2_upgrade: bool,

    /// Disable TCP keep-alive probes
    #[arg(long)]
    pub no_tcp_keep_alive: bool,

    /// Do not request compressed transfer encodings
    #[arg(long)]
    pub no_compress: bool,

    /// Do not decompress encoded content
    #[arg(long)]
    pub no_decompress: bool,

    /// Status refresh interval in seconds
    #[arg(long, value_name = "SECS")]
    pub status_refresh_interval: Option<f64>,

    /// Disable the status display
    #[arg(long)]
    pub no_status: bool,

    /// Disable colors in the status display
    #[arg(long)]
    pub no_color: bool,

    /// Increase verbosity; repeatable
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parses argv with `PARGET_EXTRA_ARGS` spliced in. Help and version
/// requests exit 0 here; anything malformed is a usage error (exit 1).
pub fn parse_args() -> Cli {
    let mut argv: Vec<String> = std::env::args().collect();

    if let Ok(extra) = std::env::var(EXTRA_ARGS_ENV) {
        argv.extend(extra.split_whitespace().map(str::to_string));
    }

    match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

impl Cli {
    pub fn into_params(self) -> Result<DownloadParams> {
        let get_info = match self.get_info.as_deref() {
            None => None,
            Some("file-name") => Some(GetInfo::FileName),
            Some("file-size") => Some(GetInfo::FileSize),
            Some("effective-url") => Some(GetInfo::EffectiveUrl),
            Some(other) => {
                return Err(PargetError::InvalidInput(format!(
                    "unknown --get-info value '{other}'"
                )));
            }
        };

        if let Some(p) = self.ip_protocol {
            if p != 4 && p != 6 {
                return Err(PargetError::InvalidInput(format!(
                    "--ip-protocol must be 4 or 6, got {p}"
                )));
            }
        }

        if self.url.is_empty() {
            return Err(PargetError::InvalidInput("empty URL".into()));
        }

        let mut params = DownloadParams {
            start_url: self.url,
            mirror_url: self.mirror_url,
            fatal_if_invalid_mirror: self.fatal_if_invalid_mirror,
            root_dir: self.root_dir,
            filename: self.output,
            no_path: self.no_path,
            keep_get_attrs: self.keep_get_attrs,
            filename_from_redirect: self.filename_from_redirect,
            auto_trunc: self.auto_trunc,
            smart_trunc: self.smart_trunc,
            no_attachment_detection: self.no_attachment_detection,
            chunk_size: self.chunk_size.unwrap_or(0),
            num_connections: self.connections.unwrap_or(0),
            last_chunks_first: self.last_chunks_first.unwrap_or(0),
            last_size_first: self.last_size_first.unwrap_or(0),
            random_order: self.random_order,
            merge_in_order: self.merge_in_order,
            auto_size: self.auto_size.unwrap_or(0),
            whole_file: self.whole_file,
            connection_max_rate: self.connection_max_rate.unwrap_or(0),
            single_mode: self.single_mode,
            mem_bufs: self.mem_bufs,
            no_mmap: self.no_mmap,
            resume: self.resume,
            force: self.force,
            dry_run: self.dry_run,
            get_info,
            read_only: self.read_only,
            to_stdout: self.stdout,
            no_remote_info: self.no_remote_info,
            use_head: self.use_head,
            assume_range_support: self.assume_range_support,
            allow_ftp_segments: self.allow_ftp_segments,
            referer: self.referer,
            auto_referer: self.auto_referer,
            user_agent: self.user_agent,
            no_user_agent: self.no_user_agent,
            post: self.post,
            raw_post: self.raw_post,
            cookie_file: self.cookie_file,
            inline_cookies: self.inline_cookies,
            custom_headers: split_custom_headers(&self.custom_headers),
            date_expr: self.date_expr,
            since_file_mtime: self.since_file_mtime,
            proxy: self.proxy,
            tunnel_proxy: self.tunnel_proxy,
            no_proxy: self.no_proxy,
            forced_ip_protocol: self.ip_protocol,
            tls_no_verify: self.tls_no_verify,
            no_timeouts: self.no_timeouts,
            no_http2: self.no_http2,
            http2_upgrade: self.http2_upgrade,
            no_tcp_keep_alive: self.no_tcp_keep_alive,
            compress: !self.no_compress,
            no_decompress: self.no_decompress,
            status_refresh_interval: self
                .status_refresh_interval
                .map(Duration::from_secs_f64),
            no_status: self.no_status,
            no_color: self.no_color,
            verbosity: self.verbose,
        };

        params.apply_defaults();
        Ok(params)
    }
}

/// A single -H argument may carry several headers separated by `\r\n`,
/// either the literal two characters or the escaped form.
fn split_custom_headers(raw: &[String]) -> Vec<String> {
    let mut headers = Vec::new();
    for arg in raw {
        let unescaped = arg.replace("\\r\\n", "\r\n");
        for header in unescaped.split("\r\n") {
            let header = header.trim();
            if !header.is_empty() {
                headers.push(header.to_string());
            }
        }
    }
    headers
}

/// Accepts plain byte counts or K/M/G-suffixed values (binary multiples).
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".into());
    }

    let (digits, multiplier) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[..s.len() - 1], 1024u64),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: f64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    if value < 0.0 {
        return Err(format!("negative size '{s}'"));
    }

    Ok((value * multiplier as f64) as u64)
}
