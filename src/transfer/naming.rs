//! Output filename derivation and the on-disk sibling paths.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::errors::{PargetError, Result};
use crate::session::params::DownloadParams;
use crate::transfer::probe::RemoteInfo;

/// Byte budget for a basename, leaving room for the longest suffix we
/// append (`.part.sal`).
const NAME_MAX: usize = 255;
const RESERVED_SUFFIX: usize = ".part.sal".len();

/// Files created next to the final output.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub part: PathBuf,
    pub ctrl: PathBuf,
    pub tmp_dir: PathBuf,
}

/// Derives `params.filename` from the attachment name, the effective URL
/// or the start URL, then applies the user's cleanup options.
pub fn set_names(params: &mut DownloadParams, remote: &RemoteInfo) -> Result<()> {
    if params.to_stdout {
        params.filename = Some("STDOUT".to_string());
    }

    if params.filename.is_none() {
        let attachment = if params.no_attachment_detection {
            None
        } else {
            remote.attachment_filename.as_deref()
        };

        let initial = if let Some(name) = attachment {
            name.to_string()
        } else if params.filename_from_redirect && !remote.effective_url.is_empty() {
            remote.effective_url.clone()
        } else {
            params.start_url.clone()
        };

        let unescaped = unescape_fully(&initial);

        // Attachment names are used as-is; URLs keep their last component.
        let mut name = if attachment.is_some() {
            unescaped
        } else {
            basename(&unescaped).to_string()
        };

        if !params.keep_get_attrs {
            let stripped = strip_get_attrs(&name);
            if stripped != name {
                info!("before stripping GET attrs: {name}");
                info!("after  stripping GET attrs: {stripped}");
                name = stripped;
            }
        }

        params.filename = Some(name);
    }

    let filename = params.filename.clone().expect("set above");

    if filename.is_empty() {
        return Err(PargetError::InvalidInput("output filename is empty".into()));
    }
    if filename.ends_with('/') {
        return Err(PargetError::InvalidInput(format!(
            "output filename \"{filename}\" ends with a path separator"
        )));
    }

    let mut filename = filename;

    if params.no_path {
        let cleaned: String = filename
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        if cleaned != filename {
            info!("replacing '/' and ':' with '_' in {filename}");
        }
        filename = cleaned;
    }

    if let Some(root_dir) = &params.root_dir {
        let root = root_dir.trim_end_matches('/');
        info!("prepending root dir ({root}) to filename ({filename})");
        filename = format!("{root}/{filename}");
    }

    if params.auto_trunc || params.smart_trunc {
        let truncated = trunc_filename(&filename, params.smart_trunc);
        if truncated.len() != filename.len() {
            warn!("filename truncated:");
            warn!("  original:  {filename}");
            warn!("  truncated: {truncated}");
            filename = truncated;
        }
    }

    if !params.to_stdout && std::path::Path::new(&filename).exists() {
        return Err(PargetError::Fatal(format!("{filename} exists, quitting")));
    }

    params.filename = Some(filename);
    Ok(())
}

pub fn output_paths(params: &DownloadParams) -> OutputPaths {
    let filename = params.filename.as_deref().unwrap_or("STDOUT");
    OutputPaths {
        part: PathBuf::from(format!("{filename}.part.sal")),
        ctrl: PathBuf::from(format!("{filename}.ctrl.sal")),
        tmp_dir: PathBuf::from(format!("{filename}.tmp.sal")),
    }
}

/// Percent-decoding can itself reveal more escapes; repeat until stable.
fn unescape_fully(s: &str) -> String {
    let mut current = s.to_string();
    loop {
        let next = urlencoding::decode(&current)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| current.clone());
        if next == current {
            return current;
        }
        current = next;
    }
}

fn basename(s: &str) -> &str {
    s.trim_end_matches('/').rsplit('/').next().unwrap_or(s)
}

/// Removes a trailing `?key=value...` query, but never at the cost of an
/// empty filename.
fn strip_get_attrs(name: &str) -> String {
    if let Some(pos) = name.rfind('?') {
        let keeps_name = pos != 0 && !name[..pos].ends_with('/');
        let is_query = name[pos..].contains('=');
        if keeps_name && is_query {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}

/// Shortens the basename to the filesystem budget. `keep_ext` preserves
/// whatever follows the last dot.
fn trunc_filename(filename: &str, keep_ext: bool) -> String {
    let budget = NAME_MAX - RESERVED_SUFFIX;

    let (dir, base) = match filename.rfind('/') {
        Some(pos) => (&filename[..=pos], &filename[pos + 1..]),
        None => ("", filename),
    };

    if base.len() <= budget {
        return filename.to_string();
    }

    let ext = if keep_ext {
        base.rfind('.').map(|pos| &base[pos..]).unwrap_or("")
    } else {
        ""
    };

    let keep = budget.saturating_sub(ext.len());
    let stem = &base[..base.len() - ext.len()];

    // Cut on a char boundary at or below the budget.
    let mut end = keep.min(stem.len());
    while end > 0 && !stem.is_char_boundary(end) {
        end -= 1;
    }

    format!("{dir}{}{ext}", &stem[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_with_attachment(name: Option<&str>) -> RemoteInfo {
        RemoteInfo {
            effective_url: "https://cdn.example/real/path/file.bin".into(),
            attachment_filename: name.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_filename_from_url_basename() {
        let mut params = DownloadParams {
            start_url: "https://example.com/downloads/archive.tar.gz".into(),
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        assert_eq!(params.filename.as_deref(), Some("archive.tar.gz"));
    }

    #[test]
    fn test_filename_unescapes_percent_encoding() {
        let mut params = DownloadParams {
            start_url: "https://example.com/some%20file%2520name.bin".into(),
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        // double-encoded %2520 collapses all the way down to a space
        assert_eq!(params.filename.as_deref(), Some("some file name.bin"));
    }

    #[test]
    fn test_get_attrs_stripped_by_default() {
        let mut params = DownloadParams {
            start_url: "https://example.com/file.iso?token=abc&x=1".into(),
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        assert_eq!(params.filename.as_deref(), Some("file.iso"));

        let mut params = DownloadParams {
            start_url: "https://example.com/file.iso?token=abc".into(),
            keep_get_attrs: true,
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        assert_eq!(params.filename.as_deref(), Some("file.iso?token=abc"));
    }

    #[test]
    fn test_attachment_name_wins() {
        let mut params = DownloadParams {
            start_url: "https://example.com/dl?id=42".into(),
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(Some("report.pdf"))).unwrap();
        assert_eq!(params.filename.as_deref(), Some("report.pdf"));

        let mut params = DownloadParams {
            start_url: "https://example.com/dl/fallback.bin".into(),
            no_attachment_detection: true,
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(Some("report.pdf"))).unwrap();
        assert_eq!(params.filename.as_deref(), Some("fallback.bin"));
    }

    #[test]
    fn test_no_path_substitution() {
        let mut params = DownloadParams {
            start_url: "https://example.com/x".into(),
            filename: Some("a/b:c.bin".into()),
            no_path: true,
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        assert_eq!(params.filename.as_deref(), Some("a_b_c.bin"));
    }

    #[test]
    fn test_root_dir_prepended() {
        let mut params = DownloadParams {
            start_url: "https://example.com/file.bin".into(),
            root_dir: Some("/downloads/".into()),
            ..Default::default()
        };
        set_names(&mut params, &remote_with_attachment(None)).unwrap();
        assert_eq!(params.filename.as_deref(), Some("/downloads/file.bin"));
    }

    #[test]
    fn test_empty_filename_rejected() {
        let mut params = DownloadParams {
            start_url: "https://example.com/".into(),
            ..Default::default()
        };
        // basename of "https://example.com/" is the host, which survives;
        // force the empty case directly.
        params.filename = Some(String::new());
        assert!(set_names(&mut params, &remote_with_attachment(None)).is_err());
    }

    #[test]
    fn test_trailing_separator_rejected() {
        let mut params = DownloadParams {
            start_url: "https://example.com/x".into(),
            filename: Some("dir/".into()),
            ..Default::default()
        };
        assert!(set_names(&mut params, &remote_with_attachment(None)).is_err());
    }

    #[test]
    fn test_smart_trunc_keeps_extension() {
        let long = "x".repeat(300) + ".tar.gz";
        let truncated = trunc_filename(&long, true);
        assert!(truncated.ends_with(".gz"));
        assert!(truncated.len() <= NAME_MAX - RESERVED_SUFFIX);

        let blunt = trunc_filename(&long, false);
        assert!(!blunt.ends_with(".gz"));
        assert_eq!(blunt.len(), NAME_MAX - RESERVED_SUFFIX);
    }

    #[test]
    fn test_trunc_only_touches_basename() {
        let long = format!("some/dir/{}", "y".repeat(300));
        let truncated = trunc_filename(&long, false);
        assert!(truncated.starts_with("some/dir/"));
        assert_eq!(truncated.len(), "some/dir/".len() + NAME_MAX - RESERVED_SUFFIX);
    }

    #[test]
    fn test_output_paths_suffixes() {
        let params = DownloadParams {
            filename: Some("file.bin".into()),
            ..Default::default()
        };
        let paths = output_paths(&params);
        assert_eq!(paths.part.to_str().unwrap(), "file.bin.part.sal");
        assert_eq!(paths.ctrl.to_str().unwrap(), "file.bin.ctrl.sal");
        assert_eq!(paths.tmp_dir.to_str().unwrap(), "file.bin.tmp.sal");
    }

    #[test]
    fn test_strip_get_attrs_guards() {
        // No '=' after '?': not a query, keep as-is.
        assert_eq!(strip_get_attrs("file?raw"), "file?raw");
        // Would leave nothing: keep as-is.
        assert_eq!(strip_get_attrs("?a=1"), "?a=1");
        assert_eq!(strip_get_attrs("file.iso?a=1"), "file.iso");
    }
}
