//! Client error types.
//!
//! Every fallible operation in this crate returns [`InferenceError`].  The
//! variants follow the failure taxonomy of an OpenAI-compatible endpoint:
//! transport failures (connection, timeout), HTTP status failures (5xx vs.
//! 4xx), and protocol failures inside a stream.  [`InferenceError::kind`]
//! collapses them into an [`ErrorKind`] for the retry policy.

use std::time::Duration;

/// Coarse classification used by [`crate::retry::RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, DNS or refused connection.
    Connection,
    /// No response (or no next chunk) within the configured bound.
    Timeout,
    /// The server answered with a 5xx status.
    Server,
    /// The server answered with a 4xx status.
    Client,
    /// Malformed stream or an explicit error payload mid-stream.
    StreamProtocol,
    /// Anything that is not a property of the remote call (config, pool,
    /// validation, templates, I/O).
    Local,
}

/// Unified error type for the inference client.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    // -- Transport errors ----------------------------------------------------
    /// The request never reached the server, or the connection dropped.
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// The request or a stream read exceeded its time bound.
    #[error("request timed out: {reason}")]
    Timeout { reason: String },

    // -- HTTP status errors --------------------------------------------------
    /// The server returned a 5xx status.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// The server rejected the request with a 4xx status.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    // -- Protocol errors -----------------------------------------------------
    /// The stream carried an error payload or a record of the wrong shape.
    #[error("stream protocol error: {reason}")]
    StreamProtocol { reason: String },

    /// A non-streaming response body did not match the expected schema.
    #[error("response parse error: {reason}")]
    Parse { reason: String },

    // -- Local errors --------------------------------------------------------
    /// The request failed validation before it was sent.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The pool was shut down while the caller waited for a handle.
    #[error("client pool is shut down")]
    PoolClosed,

    /// No pooled handle became free within the acquire timeout.
    #[error("no pooled client available after {waited:?}")]
    PoolExhausted { waited: Duration },

    /// A prompt template could not be found or rendered.
    #[error("template error: {reason}")]
    Template { reason: String },

    /// File system access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InferenceError>;

impl InferenceError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Server { .. } => ErrorKind::Server,
            Self::Client { .. } => ErrorKind::Client,
            Self::StreamProtocol { .. } => ErrorKind::StreamProtocol,
            Self::Parse { .. }
            | Self::InvalidRequest { .. }
            | Self::Config { .. }
            | Self::PoolClosed
            | Self::PoolExhausted { .. }
            | Self::Template { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Local,
        }
    }

    /// Build the status-based variant for a non-success HTTP response.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status >= 500 {
            Self::Server { status, body }
        } else {
            Self::Client { status, body }
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            Self::Parse {
                reason: err.to_string(),
            }
        } else {
            Self::Connection {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_split_between_server_and_client() {
        assert_eq!(InferenceError::from_status(503, "busy").kind(), ErrorKind::Server);
        assert_eq!(InferenceError::from_status(500, "").kind(), ErrorKind::Server);
        assert_eq!(InferenceError::from_status(404, "").kind(), ErrorKind::Client);
        assert_eq!(InferenceError::from_status(429, "").kind(), ErrorKind::Client);
    }

    #[test]
    fn local_errors_classified_as_local() {
        assert_eq!(InferenceError::PoolClosed.kind(), ErrorKind::Local);
        let err = InferenceError::InvalidRequest {
            reason: "empty".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Local);
    }

    #[test]
    fn display_includes_status_and_body() {
        let err = InferenceError::from_status(502, "bad gateway");
        assert_eq!(err.to_string(), "server error 502: bad gateway");
    }
}
