//! Error taxonomy for the session engine.
//!
//! Only framing-level and socket-level failures are fatal to a connection
//! (see [`Error::is_fatal`]). Everything else is either surfaced to the caller
//! that issued a request or logged and isolated to a single stanza.

use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::session::SessionState;

/// The stream lost structural synchronization. Always fatal: the caller must
/// close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A top-level element was closed with a different name than it was opened with.
    #[error("end tag closed with wrong name (expected {expected}, received {found})")]
    MismatchedClose { expected: String, found: String },

    /// The first element of the stream was not a `<k>` handshake element.
    #[error("unexpected init stream response tag: {0}")]
    UnexpectedHandshake(String),

    /// The peer sent a document type declaration.
    #[error("DTD processing is forbidden")]
    DtdForbidden,

    /// The bytes are not well-formed XML.
    #[error("malformed XML: {0}")]
    Syntax(String),

    /// A single stanza grew past the configured limit without completing.
    #[error("stanza exceeds {max} bytes (buffered {size})")]
    Oversized { size: usize, max: usize },
}

/// The canonical error type for the session engine.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection-fatal ─────────────────────────────────────────
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The peer closed the stream with `</k>` or `</stream:stream>`.
    #[error("stream closed by peer")]
    StreamClosed,

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    // ── Per-stanza ───────────────────────────────────────────────
    /// Input was not valid UTF-8, or contained an entity the decoder refuses to expand.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A per-kind parser rejected the internal shape of a stanza.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // ── Usage ────────────────────────────────────────────────────
    #[error("a request with id {0:?} is already pending")]
    DuplicateId(String),

    #[error("session not ready (state {0:?})")]
    SessionNotReady(SessionState),

    #[error("session is temporarily banned until {0:?}")]
    TempBanned(SystemTime),

    #[error("a captcha must be answered first")]
    CaptchaRequired,

    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Request-level ────────────────────────────────────────────
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("request cancelled")]
    Cancelled,

    /// The session task has exited; no further commands can be processed.
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// True when the error means the connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Framing(_) | Error::StreamClosed | Error::Io(_) | Error::Tls(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_stream_level_errors_are_fatal() {
        assert!(Error::from(FramingError::DtdForbidden).is_fatal());
        assert!(Error::StreamClosed.is_fatal());
        assert!(Error::Io(std::io::Error::other("reset")).is_fatal());

        assert!(!Error::MalformedResponse("no body".into()).is_fatal());
        assert!(!Error::Encoding("bad utf-8".into()).is_fatal());
        assert!(!Error::DuplicateId("5".into()).is_fatal());
        assert!(!Error::TimedOut(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_mismatched_close_message_names_both_tags() {
        let err = FramingError::MismatchedClose {
            expected: "iq".into(),
            found: "message".into(),
        };
        let text = err.to_string();
        assert!(text.contains("expected iq"));
        assert!(text.contains("received message"));
    }
}
