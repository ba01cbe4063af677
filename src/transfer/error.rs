use std::time::Duration;

/// How a failed transfer attempt is handled.
///
/// Retryable failures back off and restart the chunk in place. Semi-fatal
/// failures (TLS connect trouble, send-side resets) get a bounded number
/// of retries before escalating. Fatal failures abort the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fatal,
    SemiFatal,
    Retryable,
}

/// One failed attempt, carrying its disposition.
#[derive(Debug)]
pub struct TransferError {
    pub class: ErrorClass,
    pub message: String,
}

impl TransferError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Fatal, message: message.into() }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Retryable, message: message.into() }
    }

    /// A body read that produced nothing within the stall window.
    pub fn stalled(window: Duration) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: format!("no data received for {}s", window.as_secs()),
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&reqwest::Error> for TransferError {
    fn from(e: &reqwest::Error) -> Self {
        Self { class: classify(e), message: e.to_string() }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        Self::from(&e)
    }
}

/// Maps a client error onto the retry taxonomy.
///
/// Timeouts, resolution/connect failures, empty replies and receive errors
/// restart the chunk. TLS handshake problems and send-side failures are
/// semi-fatal. Anything unrecognized aborts.
pub fn classify(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() {
        return ErrorClass::Retryable;
    }

    let chain = error_chain(e);
    if chain.contains("tls")
        || chain.contains("certificate")
        || chain.contains("handshake")
        || chain.contains("broken pipe")
    {
        return ErrorClass::SemiFatal;
    }

    if e.is_connect() || e.is_body() || e.is_decode() || e.is_request() {
        return ErrorClass::Retryable;
    }

    ErrorClass::Fatal
}

/// HTTP status disposition for chunk transfers: 5xx restart, anything
/// else client-side is the server telling us to stop asking.
pub fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
    if status.is_server_error() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        source = inner.source();
    }
    chain.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            ErrorClass::Retryable
        );
        assert_eq!(classify_status(reqwest::StatusCode::NOT_FOUND), ErrorClass::Fatal);
        assert_eq!(classify_status(reqwest::StatusCode::FORBIDDEN), ErrorClass::Fatal);
    }

    #[test]
    fn test_stalled_is_retryable() {
        let e = TransferError::stalled(Duration::from_secs(10));
        assert_eq!(e.class, ErrorClass::Retryable);
        assert!(e.message.contains("10s"));
    }
}
