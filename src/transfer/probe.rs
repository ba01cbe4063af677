//! Remote probing: one ranged request decides range support and reads the
//! file's metadata; a plain request backs it up when the answer is
//! unreliable. What the probe learns flips the session between segmented
//! and single mode.

use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::errors::{PargetError, Result};
use crate::session::params::DownloadParams;
use crate::transfer::client::build_client;
use crate::transfer::error::{ErrorClass, classify};

/// Probe range and the length that proves the server honored it.
const PROBE_RANGE: &str = "bytes=4096-8191";
const PROBE_RANGE_LENGTH: u64 = 4096;

/// Resolving a host for the first time can take a while.
const PROBE_TIMEOUT: Duration = Duration::from_secs(75);

pub const MAX_SEMI_FATAL_RETRIES: u32 = 5;

/// Facts learned about the remote resource.
#[derive(Debug, Default, Clone)]
pub struct RemoteInfo {
    pub effective_url: String,
    pub attachment_filename: Option<String>,
    pub content_type: Option<String>,
    pub content_encoded: bool,
    pub encoding_forced: bool,
    pub gzip_content: bool,
    pub range_support: bool,
    pub possible_upgrade_error: bool,
    pub file_size: u64,
}

pub struct ProbeResult {
    pub remote: RemoteInfo,
    pub mirror: Option<RemoteInfo>,
    pub mirror_valid: bool,
    pub client: Client,
}

enum ProbeOutcome {
    Done,
    /// 400 that may be the server rejecting an HTTP/2 upgrade.
    UpgradeError,
    /// The If-(Un)Modified-Since condition fired.
    NotModified,
}

/// Probes the URL (and mirror), applies the single-mode/resume decisions
/// to `params`, and returns the client the transfer phase will use.
/// `None` means the date condition fired and there is nothing to do.
pub fn fetch_remote_info(
    params: &mut DownloadParams,
    handle: &Handle,
) -> Result<Option<ProbeResult>> {
    if params.no_remote_info {
        warn!("no-remote-info enforces both enabling single mode and disabling resume");
        params.single_mode = true;
        params.resume = false;
        let client = build_client(params)?;
        return Ok(Some(ProbeResult {
            remote: RemoteInfo::default(),
            mirror: None,
            mirror_valid: false,
            client,
        }));
    }

    let mut client = build_client(params)?;
    let mut remote = RemoteInfo::default();
    let url = params.start_url.clone();

    match request_remote_info(&client, params, &url, handle, &mut remote)? {
        ProbeOutcome::NotModified => {
            info!("Skipping download due to date condition.");
            return Ok(None);
        }
        ProbeOutcome::UpgradeError => {
            warn!("got 400 error, retrying without HTTP/2 upgrade request");
            params.no_http2 = true;
            client = build_client(params)?;
            remote = RemoteInfo::default();
            match request_remote_info(&client, params, &url, handle, &mut remote)? {
                ProbeOutcome::NotModified => {
                    info!("Skipping download due to date condition.");
                    return Ok(None);
                }
                _ => {}
            }
        }
        ProbeOutcome::Done => {}
    }

    if !remote.effective_url.is_empty() && remote.effective_url != params.start_url {
        info!("Redirected: {}", remote.effective_url);
    }
    if let Some(content_type) = &remote.content_type {
        info!("Content-Type: {content_type}");
    }

    apply_remote_decisions(params, &remote);

    let mut mirror = None;
    let mut mirror_valid = false;
    if let Some(mirror_url) = params.mirror_url.clone() {
        if params.single_mode {
            info!("mirror URL skipped in single mode");
        } else {
            info!("getting remote info for mirror URL");
            let mut mirror_info = RemoteInfo::default();
            if let ProbeOutcome::Done =
                probe_with_ranges(&client, params, &mirror_url, handle, &mut mirror_info)?
            {
                mirror_valid = mirror_is_valid(&remote, &mirror_info);
            }

            if mirror_valid {
                info!("Mirror: {mirror_url}");
                if mirror_info.effective_url != mirror_url {
                    info!("Mirror-Redirected: {}", mirror_info.effective_url);
                }
            } else if params.fatal_if_invalid_mirror {
                return Err(PargetError::InvalidMirror);
            } else {
                warn!("invalid mirror");
            }
            mirror = Some(mirror_info);
        }
    }

    // The probe may have flipped compression or HTTP version choices;
    // the transfer phase gets a client built from the final parameters.
    let client = build_client(params)?;
    Ok(Some(ProbeResult { remote, mirror, mirror_valid, client }))
}

/// Ranged check first; a second plain request whenever the first answer
/// can't be trusted (no range support, missing size, or the suspicious
/// exact-probe-length size some FTP servers report).
fn request_remote_info(
    client: &Client,
    params: &DownloadParams,
    url: &str,
    handle: &Handle,
    remote: &mut RemoteInfo,
) -> Result<ProbeOutcome> {
    match probe_with_ranges(client, params, url, handle, remote)? {
        ProbeOutcome::Done => {}
        other => return Ok(other),
    }

    if !remote.range_support
        || remote.file_size == 0
        || params.assume_range_support
        || remote.file_size == PROBE_RANGE_LENGTH
    {
        warn!("range support check failed or skipped, or file size not set reliably");
        warn!("making a second check without ranges");
        match probe_simple(client, params, url, handle, remote)? {
            ProbeOutcome::Done => {}
            other => return Ok(other),
        }
    }

    Ok(ProbeOutcome::Done)
}

fn probe_with_ranges(
    client: &Client,
    params: &DownloadParams,
    url: &str,
    handle: &Handle,
    remote: &mut RemoteInfo,
) -> Result<ProbeOutcome> {
    if params.assume_range_support {
        debug!("range support assumed, skipping check");
        remote.range_support = true;
        return Ok(ProbeOutcome::Done);
    }

    debug!("checking server response with range support");
    let response = match probe_request(client, params, url, Some(PROBE_RANGE), handle)? {
        ProbeResponse::Response(r) => r,
        ProbeResponse::UpgradeError => {
            remote.possible_upgrade_error = true;
            return Ok(ProbeOutcome::UpgradeError);
        }
        ProbeResponse::NotModified => return Ok(ProbeOutcome::NotModified),
    };

    let content_length = response.content_length();
    remote_info_from_response(&response, params, remote);

    if content_length == Some(PROBE_RANGE_LENGTH) {
        remote.range_support = true;
    } else {
        debug!(
            "expected length {PROBE_RANGE_LENGTH}, got {:?}",
            content_length
        );
    }

    Ok(ProbeOutcome::Done)
}

fn probe_simple(
    client: &Client,
    params: &DownloadParams,
    url: &str,
    handle: &Handle,
    remote: &mut RemoteInfo,
) -> Result<ProbeOutcome> {
    let response = match probe_request(client, params, url, None, handle)? {
        ProbeResponse::Response(r) => r,
        ProbeResponse::UpgradeError => {
            remote.possible_upgrade_error = true;
            return Ok(ProbeOutcome::UpgradeError);
        }
        ProbeResponse::NotModified => return Ok(ProbeOutcome::NotModified),
    };

    remote_info_from_response(&response, params, remote);
    Ok(ProbeOutcome::Done)
}

enum ProbeResponse {
    Response(Response),
    UpgradeError,
    NotModified,
}

/// One probe request with the semi-fatal retry budget. The body is never
/// read; headers are all the probe needs.
fn probe_request(
    client: &Client,
    params: &DownloadParams,
    url: &str,
    range: Option<&str>,
    handle: &Handle,
) -> Result<ProbeResponse> {
    let mut semi_fatal_retries = 0;

    loop {
        let method = if params.use_head && params.post.is_none() && params.raw_post.is_none() {
            Method::HEAD
        } else if params.post.is_some() || params.raw_post.is_some() {
            Method::POST
        } else {
            Method::GET
        };

        let mut request = client.request(method, url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        if !params.no_timeouts {
            request = request.timeout(PROBE_TIMEOUT);
        }
        if let Some(post) = &params.post {
            request = request
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(post.clone());
        } else if let Some(raw_post) = &params.raw_post {
            request = request.body(raw_post.clone());
        }

        match handle.block_on(request.send()) {
            Ok(response) => {
                let status = response.status();

                if status == StatusCode::NOT_MODIFIED
                    || status == StatusCode::PRECONDITION_FAILED
                {
                    return Ok(ProbeResponse::NotModified);
                }
                if status == StatusCode::BAD_REQUEST && !params.no_http2 {
                    return Ok(ProbeResponse::UpgradeError);
                }
                if status.is_client_error() || status.is_server_error() {
                    return Err(PargetError::Fatal(format!(
                        "HTTP error {status} while probing {url}"
                    )));
                }

                return Ok(ProbeResponse::Response(response));
            }
            Err(e) => match classify(&e) {
                ErrorClass::SemiFatal => {
                    semi_fatal_retries += 1;
                    if semi_fatal_retries > MAX_SEMI_FATAL_RETRIES {
                        return Err(PargetError::SemiFatalExhausted {
                            retries: MAX_SEMI_FATAL_RETRIES,
                            message: e.to_string(),
                        });
                    }
                    warn!(
                        "semi-fatal error while probing ({e}), retry \
                         {semi_fatal_retries}/{MAX_SEMI_FATAL_RETRIES}"
                    );
                }
                _ => return Err(e.into()),
            },
        }
    }
}

/// Harvests the probe headers into `RemoteInfo`.
fn remote_info_from_response(
    response: &Response,
    params: &DownloadParams,
    remote: &mut RemoteInfo,
) {
    remote.effective_url = response.url().to_string();

    let headers = response.headers();

    if let Some(content_range) = header_str(headers, reqwest::header::CONTENT_RANGE) {
        debug!("Content-Range: {content_range}");
        if let Some(total) = parse_content_range(content_range) {
            remote.file_size = total;
            debug!("remote file size from Content-Range: {total}");
        }
    } else if let Some(size) = response.content_length() {
        if size > 0 {
            remote.file_size = size;
            debug!(
                "remote file size from Content-Length: {size}{}",
                if size == PROBE_RANGE_LENGTH { " (unreliable)" } else { "" }
            );
        }
    }

    if let Some(encoding) = header_str(headers, reqwest::header::CONTENT_ENCODING) {
        if !encoding.eq_ignore_ascii_case("none") && !encoding.eq_ignore_ascii_case("identity") {
            debug!("Content-Encoding: {encoding}");
            remote.content_encoded = true;
            if !params.compress {
                info!("compression forced by server");
                remote.encoding_forced = true;
            }
        }
    }

    if let Some(content_type) = header_str(headers, reqwest::header::CONTENT_TYPE) {
        debug!("Content-Type: {content_type}");
        remote.content_type = Some(content_type.to_string());
        if content_type.to_ascii_lowercase().contains("gzip") {
            remote.gzip_content = true;
        }
    }

    if let Some(disposition) = header_str(headers, reqwest::header::CONTENT_DISPOSITION) {
        debug!("Content-Disposition: {disposition}");
        if let Some(name) = parse_content_disposition(disposition) {
            debug!("attachment filename: {name}");
            remote.attachment_filename = Some(name);
        }
    }
}

fn header_str<'a>(headers: &'a reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Total size is whatever follows the '/' in `bytes start-end/total`.
pub fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Pulls a usable filename out of Content-Disposition. The attachment
/// name is assumed to be the last `=` assignment; trailing `;`, outer
/// quotes and a leading `UTF-8''` marker are stripped, and only the last
/// path component survives.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let mut name = value.rsplit('=').next()?.trim();

    name = name.strip_suffix(';').unwrap_or(name);

    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name = &name[1..name.len() - 1];
    }

    if name.len() >= 7 && name[..7].eq_ignore_ascii_case("utf-8''") {
        name = &name[7..];
    }

    let base = name.rsplit('/').next().unwrap_or(name);
    if base.is_empty() { None } else { Some(base.to_string()) }
}

/// Applies what the probe learned: FTP and range-less servers force
/// single mode; compressed content that will be decompressed has an
/// unpredictable length, so it forces single mode too.
fn apply_remote_decisions(params: &mut DownloadParams, remote: &RemoteInfo) {
    if remote.effective_url.starts_with("ftp") && !params.allow_ftp_segments {
        warn!("forcing single mode with FTP, it doesn't cope well with concurrent connections");
        params.single_mode = true;
    }

    if !remote.range_support {
        warn!("server lacks range support, the link is wrong, or the file is too small");
        warn!("single mode force-enabled, resume force-disabled");
        params.single_mode = true;
        params.resume = false;
    }

    if remote.encoding_forced {
        // Pretend we asked for compression so decoding stays consistent.
        params.compress = true;
    }

    if remote.content_encoded {
        if remote.gzip_content {
            info!("skipping decompression, the content is already gzipped");
            params.no_decompress = true;
        } else if !params.no_decompress {
            warn!("content is compressed and will be decompressed, forcing single mode");
            params.single_mode = true;
        }
        if !params.no_decompress {
            debug!("strict downloaded file size checking will be skipped");
        }
    }
}

/// A mirror is only usable if it is a genuinely different URL serving
/// byte-identical content with the same transfer characteristics.
fn mirror_is_valid(remote: &RemoteInfo, mirror: &RemoteInfo) -> bool {
    if remote.effective_url.eq_ignore_ascii_case(&mirror.effective_url) {
        warn!("both primary and mirror URLs point to the same effective URL");
        return false;
    }

    !mirror.effective_url.starts_with("ftp")
        && remote.range_support == mirror.range_support
        && remote.possible_upgrade_error == mirror.possible_upgrade_error
        && remote.content_encoded == mirror.content_encoded
        && remote.encoding_forced == mirror.encoding_forced
        && remote.gzip_content == mirror.gzip_content
        && remote.file_size == mirror.file_size
}
