//! Typed error types for scriptbox host capabilities.
//!
//! Provides [`FetchError`], the canonical error type returned by every
//! `Fetcher` implementation that backs the guest-visible `fetch()`.

use thiserror::Error;

/// Canonical error type for outbound HTTP performed on behalf of a guest.
///
/// The `Display` text of every variant is what the guest sees as the
/// rejection message of its `fetch()` promise, so it must never carry
/// host-internal detail beyond the request the guest itself made.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The network policy does not allow this destination.
    #[error("request to '{host}' is not allowed: {reason}")]
    Blocked {
        /// Host that was refused.
        host: String,
        /// Which rule refused it.
        reason: String,
    },

    /// The guest supplied a malformed request (bad URL, method, or header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request did not complete within the per-request timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// DNS, TCP, or TLS failure before a response was received.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The response body exceeded the configured size ceiling.
    #[error("response body exceeds maximum size of {max} bytes")]
    BodyTooLarge {
        /// Maximum allowed body size.
        max: usize,
    },

    /// The request was abandoned because its execution context was torn down.
    #[error("request aborted")]
    Aborted,

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FetchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "BLOCKED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Connection(_) => "CONNECTION_FAILED",
            Self::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            Self::Aborted => "ABORTED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the request may succeed if the guest retries it.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connection(_) => true,
            Self::Blocked { .. } => false,
            Self::InvalidRequest(_) => false,
            Self::BodyTooLarge { .. } => false,
            Self::Aborted => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_blocked() {
        let err = FetchError::Blocked {
            host: "10.0.0.1".into(),
            reason: "private address".into(),
        };
        assert_eq!(
            err.to_string(),
            "request to '10.0.0.1' is not allowed: private address"
        );
    }

    #[test]
    fn display_timeout() {
        let err = FetchError::Timeout { timeout_ms: 2500 };
        assert_eq!(err.to_string(), "request timed out after 2500ms");
    }

    #[test]
    fn display_body_too_large() {
        let err = FetchError::BodyTooLarge { max: 1024 };
        assert_eq!(
            err.to_string(),
            "response body exceeds maximum size of 1024 bytes"
        );
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(FetchError, &str)> = vec![
            (
                FetchError::Blocked {
                    host: "h".into(),
                    reason: "r".into(),
                },
                "BLOCKED",
            ),
            (FetchError::InvalidRequest("x".into()), "INVALID_REQUEST"),
            (FetchError::Timeout { timeout_ms: 1 }, "TIMEOUT"),
            (FetchError::Connection("x".into()), "CONNECTION_FAILED"),
            (FetchError::BodyTooLarge { max: 1 }, "BODY_TOO_LARGE"),
            (FetchError::Aborted, "ABORTED"),
            (FetchError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "wrong code for {err}");
        }
    }

    #[test]
    fn retryable_cases() {
        assert!(FetchError::Timeout { timeout_ms: 1 }.retryable());
        assert!(FetchError::Connection("refused".into()).retryable());
        assert!(!FetchError::InvalidRequest("bad".into()).retryable());
        assert!(!FetchError::Aborted.retryable());
        assert!(!FetchError::Blocked {
            host: "h".into(),
            reason: "r".into()
        }
        .retryable());
    }

    #[test]
    fn send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<FetchError>();
    }

    #[test]
    fn internal_is_display_transparent() {
        let err: FetchError = anyhow::anyhow!("pool exhausted").into();
        assert_eq!(err.to_string(), "pool exhausted");
    }
}
