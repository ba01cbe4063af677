use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions that abort a download. Retryable transport failures
/// never surface here; workers absorb them in place (see `transfer::worker`).
#[derive(Debug, Error)]
pub enum PargetError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} exists, enable 'resume' or 'force' to overwrite")]
    OutputExists { path: PathBuf },

    #[error("control file {0}")]
    CtrlCorrupt(String),

    #[error(
        "server filesize({server}) does not match control filesize({stored})"
    )]
    CtrlSizeMismatch { server: u64, stored: u64 },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("semi-fatal error persisted after {retries} retries: {message}")]
    SemiFatalExhausted { retries: u32, message: String },

    #[error("invalid mirror")]
    InvalidMirror,

    #[error("{0}")]
    Fatal(String),
}

impl PargetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, PargetError>;
