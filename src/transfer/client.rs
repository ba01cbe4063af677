//! Builds the shared HTTP client from the session parameters. Everything
//! that applies to every request of the run lives here; per-request state
//! (ranges, bodies) is added by the probe and the workers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tracing::{debug, warn};

use crate::errors::{PargetError, Result};
use crate::session::params::DownloadParams;

const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(6);
const MAX_REDIRECTS: usize = 20;

pub fn default_user_agent() -> String {
    format!("parget/{}", env!("CARGO_PKG_VERSION"))
}

pub fn build_client(params: &DownloadParams) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(Policy::limited(MAX_REDIRECTS))
        .referer(params.auto_referer)
        .tcp_nodelay(true)
        .cookie_store(true);

    if !params.no_user_agent {
        let agent = params.user_agent.clone().unwrap_or_else(default_user_agent);
        builder = builder.user_agent(agent);
    }

    // Compression matrix: asking for encodings and decoding them are
    // separate decisions. reqwest couples them, so undecoded-but-encoded
    // transfers advertise the encodings manually.
    let mut headers = HeaderMap::new();
    if !params.compress {
        builder = builder.no_gzip().no_deflate();
    } else if params.no_decompress {
        builder = builder.no_gzip().no_deflate();
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
    }

    if !params.no_tcp_keep_alive {
        builder = builder.tcp_keepalive(TCP_KEEPALIVE_INTERVAL);
    }

    if params.tls_no_verify {
        warn!("TLS certificate verification disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    if params.no_http2 {
        builder = builder.http1_only();
    } else if params.http2_upgrade {
        builder = builder.http2_prior_knowledge();
    }

    if params.no_proxy {
        builder = builder.no_proxy();
    } else if let Some(proxy) = params.proxy.as_deref().or(params.tunnel_proxy.as_deref()) {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    // Binding the unspecified local address of one family forces the
    // protocol without touching the resolver.
    match params.forced_ip_protocol {
        Some(4) => builder = builder.local_address(IpAddr::from(Ipv4Addr::UNSPECIFIED)),
        Some(6) => builder = builder.local_address(IpAddr::from(Ipv6Addr::UNSPECIFIED)),
        _ => {}
    }

    if let Some(referer) = &params.referer {
        headers.insert(
            reqwest::header::REFERER,
            parse_header_value(referer, "referer")?,
        );
    }

    if let Some(cookie_header) = cookie_header(params)? {
        headers.insert(reqwest::header::COOKIE, cookie_header);
    }

    for raw in &params.custom_headers {
        let (name, value) = split_header(raw)?;
        headers.insert(name, value);
    }

    if let Some((name, value)) = date_condition_header(params)? {
        debug!("date condition: {}: {:?}", name, value);
        headers.insert(name, value);
    }

    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }

    Ok(builder.build()?)
}

fn parse_header_value(value: &str, what: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| PargetError::InvalidInput(format!("invalid {what} value '{value}'")))
}

fn split_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| PargetError::InvalidInput(format!("malformed header '{raw}'")))?;
    let name: HeaderName = name
        .trim()
        .parse()
        .map_err(|_| PargetError::InvalidInput(format!("invalid header name in '{raw}'")))?;
    let value = parse_header_value(value.trim(), "header")?;
    Ok((name, value))
}

/// Cookie parsing proper is out of scope; the file contents (one line) or
/// the inline string are forwarded verbatim as the Cookie header.
fn cookie_header(params: &DownloadParams) -> Result<Option<HeaderValue>> {
    let raw = if let Some(path) = &params.cookie_file {
        let contents =
            std::fs::read_to_string(path).map_err(|e| PargetError::io(path.clone(), e))?;
        Some(contents.trim().to_string())
    } else {
        params.inline_cookies.clone()
    };

    match raw {
        Some(cookies) if !cookies.is_empty() => {
            Ok(Some(parse_header_value(&cookies, "cookie")?))
        }
        _ => Ok(None),
    }
}

/// `--date-expr` / `--since-file-mtime` become If-Modified-Since (or, with
/// a leading `-`, If-Unmodified-Since) request headers.
fn date_condition_header(params: &DownloadParams) -> Result<Option<(HeaderName, HeaderValue)>> {
    if let Some(expr) = &params.date_expr {
        let (header, date_str) = if let Some(rest) = expr.strip_prefix('-') {
            (HeaderName::from_static("if-unmodified-since"), rest)
        } else {
            (HeaderName::from_static("if-modified-since"), expr.as_str())
        };

        let date = parse_http_date(date_str).ok_or_else(|| {
            PargetError::InvalidInput(format!("\"{date_str}\" is not a valid date string"))
        })?;
        return Ok(Some((header, parse_header_value(&date, "date")?)));
    }

    if let Some(path) = &params.since_file_mtime {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| PargetError::io(path.clone(), e))?;
        let date = format_http_date(mtime);
        return Ok(Some((
            HeaderName::from_static("if-modified-since"),
            parse_header_value(&date, "date")?,
        )));
    }

    Ok(None)
}

/// Accepts RFC 2822 / RFC 3339 timestamps and re-emits the HTTP form.
fn parse_http_date(s: &str) -> Option<String> {
    use time::OffsetDateTime;
    use time::format_description::well_known::{Rfc2822, Rfc3339};

    let parsed = OffsetDateTime::parse(s, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339))
        .ok()?;
    Some(http_date(parsed))
}

fn format_http_date(t: std::time::SystemTime) -> String {
    http_date(time::OffsetDateTime::from(t))
}

fn http_date(t: time::OffsetDateTime) -> String {
    // IMF-fixdate: "Sun, 06 Nov 1994 08:49:37 GMT"
    let t = t.to_offset(time::UtcOffset::UTC);
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    t.format(&format).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_header() {
        let (name, value) = split_header("X-Token: abc123").unwrap();
        assert_eq!(name.as_str(), "x-token");
        assert_eq!(value.to_str().unwrap(), "abc123");
        assert!(split_header("no-colon-here").is_err());
    }

    #[test]
    fn test_parse_http_date_formats() {
        let fixdate = parse_http_date("Sun, 06 Nov 1994 08:49:37 +0000").unwrap();
        assert_eq!(fixdate, "Sun, 06 Nov 1994 08:49:37 GMT");

        let rfc3339 = parse_http_date("1994-11-06T08:49:37Z").unwrap();
        assert_eq!(rfc3339, "Sun, 06 Nov 1994 08:49:37 GMT");

        assert!(parse_http_date("yesterday-ish").is_none());
    }

    #[test]
    fn test_date_condition_direction() {
        let mut params = DownloadParams {
            date_expr: Some("Sun, 06 Nov 1994 08:49:37 +0000".into()),
            ..Default::default()
        };
        let (name, _) = date_condition_header(&params).unwrap().unwrap();
        assert_eq!(name.as_str(), "if-modified-since");

        params.date_expr = Some("-Sun, 06 Nov 1994 08:49:37 +0000".into());
        let (name, _) = date_condition_header(&params).unwrap().unwrap();
        assert_eq!(name.as_str(), "if-unmodified-since");
    }
}
