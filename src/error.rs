use std::io;
use std::path::PathBuf;

use reqwest::header::{InvalidHeaderName, InvalidHeaderValue};
use reqwest::StatusCode;
use thiserror::Error;

use crate::parser::ParsingError;

/// Failures while performing a single outbound call.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("job has already been performed")]
    AlreadyExecuted,
    #[error("job carries both a JSON payload and a file attachment")]
    ConflictingPayload,
    #[error("encoding JSON body: {0}")]
    EncodeJson(#[source] serde_json::Error),
    #[error("invalid header name {name:?}: {source}")]
    HeaderName {
        name: String,
        #[source]
        source: InvalidHeaderName,
    },
    #[error("invalid value for header {name}: {source}")]
    HeaderValue {
        name: String,
        #[source]
        source: InvalidHeaderValue,
    },
    #[error("invalid MIME type {mime:?}: {source}")]
    MimeType {
        mime: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading attachment {}: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("building request for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Failures while interpreting a captured response. These are kept apart from
/// [`ExecError`] so a caller can tell a failed call from an unexpected payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("job has no captured response")]
    NoResponse,
    #[error("server replied {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("decoding response JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures talking to upsd.
#[derive(Debug, Error)]
pub enum UpsdError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("during `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out during `{command}`")]
    Timeout { command: String },
    #[error("connection closed by upsd during `{command}`")]
    Disconnected { command: String },
    #[error("login failure: {response}")]
    Auth { response: String },
    #[error("unexpected reply to `{command}`: {line} ({reason})")]
    Protocol {
        command: String,
        line: String,
        reason: ParsingError,
    },
    #[error("upsd refused `{command}`: {response}")]
    Daemon { command: String, response: String },
    #[error("no UPS unit known; log in first")]
    NoUnit,
    #[error("session unusable since `{after}` failed; reconnect")]
    Desynchronised { after: String },
}

impl UpsdError {
    /// Whether the connection itself is gone or out of step, as opposed to
    /// the daemon rejecting or garbling a single request.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Io { .. }
                | Self::Timeout { .. }
                | Self::Disconnected { .. }
                | Self::Desynchronised { .. }
        )
    }
}

/// Failures loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("upsd password is neither set nor given as a file")]
    MissingPassword,
}
